//! Chip Authentication (CA).
//!
//! Proves that the chip holds the private key matching the public key
//! published in EF.DG14, by agreeing on fresh session keys with a static-
//! ephemeral ECDH exchange. A cloned chip cannot produce the shared secret,
//! so secure messaging breaks down right after the key switch. See ICAO
//! Doc 9303-11 Section 6.2
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use alloc::{vec, vec::Vec};
use openssl::pkey::PKey;
use rand::{CryptoRng, RngCore};
use rasn::{
    der,
    types::{Integer, ObjectIdentifier},
};
use tracing::{error, trace};

use crate::comms::PassportComms;
use crate::crypt::EncryptionAlgorithm;
use crate::iso7816::{get_asn1_child, int2asn1len, validate_asn1_tag, CardTransceiver, APDU};
use crate::kex::{ecdh_generate_keypair, ecdh_shared_secret};
use crate::secure_messaging::{SessionKeys, SmSession};
use crate::security_info::{
    public_key_agreement, CaProtocol, KeyAgreementAlgorithm, SecurityInfoSet,
};
use crate::AuthError;

/// id-CA-ECDH-AES-CBC-CMAC-256, the protocol assumed when DG14 only carries
/// the public key and no ChipAuthenticationInfo
const DEFAULT_CA_PROTOCOL: &[u32] = &[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 4];

/// Runs Chip Authentication over the established secure channel and replaces
/// the session keys with the freshly agreed ones.
///
/// # Errors
///
/// * `AuthError::ChipAuthFailure` if the chip rejects the key agreement.
/// * `AuthError::UnsupportedAlgorithm` if DG14 only offers DH keys or an
///   unknown protocol.
/// * `AuthError` on transport, secure messaging or cryptographic failures.
pub(crate) fn establish<T: CardTransceiver, R: RngCore + CryptoRng + Default>(
    comms: &mut PassportComms<T, R>,
    security_info_set: &SecurityInfoSet,
) -> Result<(), AuthError> {
    let Some(public_key_info) = security_info_set.chip_auth_public_key_infos.first() else {
        error!("DG14 carries no ChipAuthenticationPublicKeyInfo");
        return Err(AuthError::ChipAuthFailure(
            "DG14 carries no ChipAuthenticationPublicKeyInfo",
        ));
    };
    if public_key_agreement(&public_key_info.protocol)? != KeyAgreementAlgorithm::Ecdh {
        error!("Only ECDH Chip Authentication keys are supported");
        return Err(AuthError::UnsupportedAlgorithm(
            "Only ECDH Chip Authentication keys are supported",
        ));
    }

    // ChipAuthenticationInfo names the protocol. Some documents publish the
    // public key alone, those get the strongest ECDH profile.
    let (protocol_oid, protocol) = match security_info_set.chip_auth_infos.first() {
        Some(ca_info) => (ca_info.protocol.clone(), CaProtocol::from_oid(&ca_info.protocol)?),
        None => {
            let oid =
                ObjectIdentifier::new(DEFAULT_CA_PROTOCOL.to_vec()).ok_or(AuthError::InvalidOidError())?;
            let protocol = CaProtocol::from_oid(&oid)?;
            (oid, protocol)
        }
    };
    if protocol.key_agreement != KeyAgreementAlgorithm::Ecdh {
        error!("Only ECDH Chip Authentication protocols are supported");
        return Err(AuthError::UnsupportedAlgorithm(
            "Only ECDH Chip Authentication protocols are supported",
        ));
    }
    let key_id = security_info_set
        .chip_auth_infos
        .first()
        .and_then(|ca_info| ca_info.key_id.as_ref());

    // The chip static key from the DG14 SubjectPublicKeyInfo
    let spki_der = der::encode(&public_key_info.chip_authentication_public_key)
        .map_err(AuthError::RasnEncodeError)?;
    let chip_key = PKey::public_key_from_der(&spki_der)?.ec_key()?;
    let group = chip_key.group();
    let mut ctx = openssl::bn::BigNumContext::new()?;
    let chip_public = chip_key.public_key().to_bytes(
        group,
        openssl::ec::PointConversionForm::UNCOMPRESSED,
        &mut ctx,
    )?;

    let ephemeral = ecdh_generate_keypair(group)?;
    let shared_secret = ecdh_shared_secret(group, &ephemeral.private, &chip_public)?;

    // MSE:SET AT selects the protocol (DO 80) and, when DG14 names one, the
    // key to use (DO 84)
    trace!("Selecting Chip Authentication protocol with MSE:SET AT...");
    let oid_der = der::encode(&protocol_oid).map_err(AuthError::RasnEncodeError)?;
    validate_asn1_tag(&oid_der, b"\x06")?;
    let (oid_content, _) = get_asn1_child(&oid_der, 1)?;
    let mut mse_data = vec![0x80];
    mse_data.extend(int2asn1len(oid_content.len()));
    mse_data.extend_from_slice(oid_content);
    if let Some(key_id) = key_id {
        let key_id_bytes = key_id_bytes(key_id);
        mse_data.push(0x84);
        mse_data.extend(int2asn1len(key_id_bytes.len()));
        mse_data.extend_from_slice(&key_id_bytes);
    }

    let apdu = APDU::new(
        b'\x00',
        b'\x22',
        b'\x41',
        b'\xA4',
        Some(int2asn1len(mse_data.len())),
        Some(mse_data),
        None,
    );
    send_checked(comms, &apdu)?;

    // GENERAL AUTHENTICATE carries the terminal ephemeral public key (DO 80)
    trace!("Sending the ephemeral Chip Authentication key...");
    let mut inner = vec![0x80];
    inner.extend(int2asn1len(ephemeral.public.len()));
    inner.extend_from_slice(&ephemeral.public);
    let mut cdata = vec![0x7C];
    cdata.extend(int2asn1len(inner.len()));
    cdata.extend_from_slice(&inner);

    let apdu = APDU::new(
        b'\x00',
        b'\x86',
        b'\x00',
        b'\x00',
        Some(int2asn1len(cdata.len())),
        Some(cdata),
        Some(vec![b'\x00']),
    );
    let response = send_checked(comms, &apdu)?;
    validate_asn1_tag(&response, b"\x7C")?;

    // Restart secure messaging with the agreed keys, the SSC resets to zero
    let session_keys = SessionKeys::derive(&shared_secret, protocol.cipher)?;
    comms.set_session(SmSession::new(
        protocol.cipher,
        session_keys,
        vec![0; protocol.cipher.pad_len()],
    )?);

    Ok(())
}

/// Sends an APDU through the secure channel, mapping a rejection status to
/// `ChipAuthFailure`.
fn send_checked<T: CardTransceiver, R: RngCore + CryptoRng + Default>(
    comms: &mut PassportComms<T, R>,
    apdu: &APDU,
) -> Result<Vec<u8>, AuthError> {
    match comms.send(apdu, true) {
        Ok((response, [0x90, 0x00])) => Ok(response),
        Ok((_, [sw1, sw2])) => {
            error!("Chip rejected Chip Authentication: {sw1:02X} {sw2:02X}");
            Err(AuthError::ChipAuthFailure(
                "Chip rejected the key agreement",
            ))
        }
        Err(err) => {
            error!("Error during Chip Authentication.");
            Err(err)
        }
    }
}

/// Encodes a DG14 key identifier as an unsigned big-endian integer.
fn key_id_bytes(key_id: &Integer) -> Vec<u8> {
    let bytes = key_id.to_signed_bytes_be();
    // Strip the sign octet DER adds for high leading bits
    if bytes.len() > 1 && bytes[0] == 0 {
        bytes[1..].to_vec()
    } else {
        bytes
    }
}

/// Quick check whether the secure channel still works, used after the key
/// switch to confirm the chip derived the same session keys.
pub(crate) fn confirm_channel<T: CardTransceiver, R: RngCore + CryptoRng + Default>(
    comms: &mut PassportComms<T, R>,
) -> Result<(), AuthError> {
    match comms.select_application(true) {
        Ok(()) => Ok(()),
        Err(
            AuthError::SecureMessagingError(_)
            | AuthError::RecvApduError(_, _)
            | AuthError::ParseAsn1DataError(_, _)
            | AuthError::ParseDataError(_),
        ) => {
            error!("Secure messaging broke down after Chip Authentication");
            Err(AuthError::ChipAuthFailure(
                "Secure messaging broke down after the key switch",
            ))
        }
        Err(err) => Err(err),
    }
}
