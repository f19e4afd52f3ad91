//! SecurityInfos parsing from EF.CardAccess and EF.DG14, and the closed set
//! of PACE / Chip Authentication protocol identifiers this crate speaks.

use alloc::{vec, vec::Vec};
use rasn::{der, types::Integer, types::ObjectIdentifier, types::Oid};
use tracing::{error, warn};

use crate::crypt::EncryptionAlgorithm;
use crate::iso7816::{get_asn1_child, len2int, validate_asn1_tag};
use crate::AuthError;

/// ASN.1 structures from ICAO Doc 9303-11 Section 9.2:
///
/// SecurityInfos ::= SET OF SecurityInfo
///
/// SecurityInfo ::= SEQUENCE {
/// protocol OBJECT IDENTIFIER,
/// requiredData ANY DEFINED BY protocol,
/// optionalData ANY DEFINED BY protocol OPTIONAL }
///
/// PACEInfo ::= SEQUENCE {
/// protocol OBJECT IDENTIFIER(
/// id-PACE-DH-GM-3DES-CBC-CBC |
/// id-PACE-DH-GM-AES-CBC-CMAC-128 | ... ),
/// version INTEGER, -- MUST be 2
/// parameterId INTEGER OPTIONAL }
///
/// ChipAuthenticationInfo ::= SEQUENCE {
/// protocol OBJECT IDENTIFIER(
/// id-CA-DH-3DES-CBC-CBC | id-CA-ECDH-AES-CBC-CMAC-256 | ... ),
/// version INTEGER, -- MUST be 1
/// keyId INTEGER OPTIONAL }
///
/// ChipAuthenticationPublicKeyInfo ::= SEQUENCE {
/// protocol OBJECT IDENTIFIER(id-PK-DH | id-PK-ECDH),
/// chipAuthenticationPublicKey SubjectPublicKeyInfo,
/// keyId INTEGER OPTIONAL }
pub mod security_infos {
    extern crate alloc;
    use rasn::prelude::*;
    use rasn_pkix::SubjectPublicKeyInfo;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct PaceInfo {
        pub protocol: ObjectIdentifier,
        pub version: Integer,
        pub parameter_id: Option<Integer>,
    }

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct ChipAuthenticationInfo {
        pub protocol: ObjectIdentifier,
        pub version: Integer,
        pub key_id: Option<Integer>,
    }

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq)]
    pub struct ChipAuthenticationPublicKeyInfo {
        pub protocol: ObjectIdentifier,
        pub chip_authentication_public_key: SubjectPublicKeyInfo,
        pub key_id: Option<Integer>,
    }
}

/// The key agreement primitive named by a protocol OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAgreementAlgorithm {
    Dh,
    Ecdh,
}

/// A supported PACE protocol. Only the Generic Mapping variants are spoken,
/// Integrated Mapping and CAM identifiers are rejected as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PaceProtocol {
    pub key_agreement: KeyAgreementAlgorithm,
    pub cipher: EncryptionAlgorithm,
}

impl PaceProtocol {
    /// Maps a PACEInfo protocol OID to the protocol parameters.
    ///
    /// # Errors
    ///
    /// * `AuthError::UnsupportedAlgorithm` for OIDs outside the GM set.
    pub(crate) fn from_oid(protocol: &ObjectIdentifier) -> Result<Self, AuthError> {
        #[rustfmt::skip]
        let known: [(&Oid, KeyAgreementAlgorithm, EncryptionAlgorithm); 8] = [
            // bsi-de protocols smartcard ia pace (0.4.0.127.0.7.2.2.4)
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 1, 1]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::DES3),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 1, 2]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::AES128),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 1, 3]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::AES192),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 1, 4]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::AES256),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 1]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::DES3),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 2]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::AES128),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 3]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::AES192),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 4]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::AES256),
        ];

        for (oid, key_agreement, cipher) in known {
            if protocol.eq(oid) {
                return Ok(Self {
                    key_agreement,
                    cipher,
                });
            }
        }
        error!("PACEInfo protocol OID is not a supported Generic Mapping protocol");
        Err(AuthError::UnsupportedAlgorithm(
            "PACEInfo protocol OID is not a supported Generic Mapping protocol",
        ))
    }
}

/// A supported Chip Authentication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CaProtocol {
    pub key_agreement: KeyAgreementAlgorithm,
    pub cipher: EncryptionAlgorithm,
}

impl CaProtocol {
    /// Maps a ChipAuthenticationInfo protocol OID to the protocol parameters.
    ///
    /// # Errors
    ///
    /// * `AuthError::UnsupportedAlgorithm` for unknown OIDs.
    pub(crate) fn from_oid(protocol: &ObjectIdentifier) -> Result<Self, AuthError> {
        #[rustfmt::skip]
        let known: [(&Oid, KeyAgreementAlgorithm, EncryptionAlgorithm); 8] = [
            // bsi-de protocols smartcard ia ca (0.4.0.127.0.7.2.2.3)
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 1, 1]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::DES3),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 1, 2]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::AES128),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 1, 3]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::AES192),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 1, 4]), KeyAgreementAlgorithm::Dh, EncryptionAlgorithm::AES256),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 1]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::DES3),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 2]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::AES128),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 3]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::AES192),
            (Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 4]), KeyAgreementAlgorithm::Ecdh, EncryptionAlgorithm::AES256),
        ];

        for (oid, key_agreement, cipher) in known {
            if protocol.eq(oid) {
                return Ok(Self {
                    key_agreement,
                    cipher,
                });
            }
        }
        error!("ChipAuthenticationInfo protocol OID is not supported");
        Err(AuthError::UnsupportedAlgorithm(
            "ChipAuthenticationInfo protocol OID is not supported",
        ))
    }
}

/// Maps a ChipAuthenticationPublicKeyInfo protocol OID (id-PK-DH or
/// id-PK-ECDH) to the key agreement primitive.
///
/// # Errors
///
/// * `AuthError::UnsupportedAlgorithm` for other OIDs.
pub(crate) fn public_key_agreement(
    protocol: &ObjectIdentifier,
) -> Result<KeyAgreementAlgorithm, AuthError> {
    if protocol.eq(Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 1, 1])) {
        Ok(KeyAgreementAlgorithm::Dh)
    } else if protocol.eq(Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 1, 2])) {
        Ok(KeyAgreementAlgorithm::Ecdh)
    } else {
        error!("ChipAuthenticationPublicKeyInfo protocol OID is not id-PK-DH or id-PK-ECDH");
        Err(AuthError::UnsupportedAlgorithm(
            "ChipAuthenticationPublicKeyInfo protocol OID is not id-PK-DH or id-PK-ECDH",
        ))
    }
}

/// Resolves a PACEInfo parameterId to a small integer. Standardized domain
/// parameters use ids 0 to 18, ICAO Doc 9303-11 Section 9.5.1.
pub(crate) fn standard_parameter_id(id: &Integer) -> Option<u32> {
    (0..=18).find(|&n| id.eq(&Integer::from(n)))
}

/// The access control and chip authentication capabilities advertised by the
/// chip, collected from EF.CardAccess and EF.DG14.
#[derive(Debug, Clone, Default)]
pub struct SecurityInfoSet {
    pub(crate) pace_infos: Vec<security_infos::PaceInfo>,
    pub(crate) chip_auth_infos: Vec<security_infos::ChipAuthenticationInfo>,
    pub(crate) chip_auth_public_key_infos: Vec<security_infos::ChipAuthenticationPublicKeyInfo>,
}

impl SecurityInfoSet {
    /// Parses the SecurityInfos SET from EF.CardAccess file content.
    ///
    /// # Errors
    ///
    /// * `AuthError` if the SET structure or a recognized entry is malformed.
    pub fn from_card_access(data: &[u8]) -> Result<Self, AuthError> {
        Self::from_security_infos(data)
    }

    /// Parses the SecurityInfos SET wrapped in the EF.DG14 tag `6E`.
    ///
    /// # Errors
    ///
    /// * `AuthError` if the file structure is malformed.
    pub fn from_dg14(data: &[u8]) -> Result<Self, AuthError> {
        validate_asn1_tag(data, b"\x6E")?;
        let (security_infos, remaining) = get_asn1_child(data, 1)?;
        if !remaining.is_empty() {
            error!("EF.DG14 has trailing data after the SecurityInfos");
            return Err(AuthError::InvalidFileStructure(
                "EF.DG14 has trailing data after the SecurityInfos",
            ));
        }
        Self::from_security_infos(security_infos)
    }

    /// Walks a SecurityInfos SET and collects the entries this crate
    /// understands. Unknown protocol OIDs are skipped, the chip may
    /// advertise protocols we do not speak.
    fn from_security_infos(data: &[u8]) -> Result<Self, AuthError> {
        validate_asn1_tag(data, b"\x31")?;
        let (mut infos, remaining) = get_asn1_child(data, 1)?;
        if !remaining.is_empty() {
            error!("SecurityInfos has trailing data after the SET");
            return Err(AuthError::InvalidFileStructure(
                "SecurityInfos has trailing data after the SET",
            ));
        }

        let mut set = Self::default();

        while !infos.is_empty() {
            let (tl, v) = len2int(infos, 1)?;
            if infos.len() < tl + v {
                error!(
                    "SecurityInfo entry is incomplete, expected len: {}, found len: {}",
                    tl + v,
                    infos.len()
                );
                return Err(AuthError::ParseAsn1DataError(tl + v, infos.len()));
            }
            let info_bytes = &infos[..tl + v];
            infos = &infos[tl + v..];

            let protocol = protocol_oid(info_bytes)?;
            let arcs: &[u32] = &protocol;

            match arcs {
                // id-PACE, all mappings and ciphers
                [0, 4, 0, 127, 0, 7, 2, 2, 4, ..] => {
                    let pace_info = der::decode::<security_infos::PaceInfo>(info_bytes)
                        .map_err(AuthError::RasnDecodeError)?;
                    set.pace_infos.push(pace_info);
                }
                // id-CA with a cipher suffix
                [0, 4, 0, 127, 0, 7, 2, 2, 3, _, _] => {
                    let ca_info = der::decode::<security_infos::ChipAuthenticationInfo>(info_bytes)
                        .map_err(AuthError::RasnDecodeError)?;
                    set.chip_auth_infos.push(ca_info);
                }
                // id-PK-DH and id-PK-ECDH
                [0, 4, 0, 127, 0, 7, 2, 2, 1, _] => {
                    let pk_info =
                        der::decode::<security_infos::ChipAuthenticationPublicKeyInfo>(info_bytes)
                            .map_err(AuthError::RasnDecodeError)?;
                    set.chip_auth_public_key_infos.push(pk_info);
                }
                _ => {
                    warn!("Skipping SecurityInfo with unrecognized protocol OID");
                }
            }
        }

        Ok(set)
    }

    /// Whether the chip advertises PACE at all.
    #[must_use]
    pub fn has_pace(&self) -> bool {
        !self.pace_infos.is_empty()
    }

    /// Whether the chip advertises Chip Authentication key material.
    #[must_use]
    pub fn has_chip_auth(&self) -> bool {
        !self.chip_auth_public_key_infos.is_empty()
    }
}

/// Reads the leading protocol OID of a SecurityInfo SEQUENCE.
fn protocol_oid(info_bytes: &[u8]) -> Result<ObjectIdentifier, AuthError> {
    validate_asn1_tag(info_bytes, b"\x30")?;
    let (content, _) = get_asn1_child(info_bytes, 1)?;
    validate_asn1_tag(content, b"\x06")?;
    let (tl, v) = len2int(content, 1)?;
    if content.len() < tl + v {
        error!(
            "SecurityInfo protocol OID is incomplete, expected len: {}, found len: {}",
            tl + v,
            content.len()
        );
        return Err(AuthError::ParseAsn1DataError(tl + v, content.len()));
    }
    der::decode::<ObjectIdentifier>(&content[..tl + v]).map_err(AuthError::RasnDecodeError)
}
