//! Key agreement for PACE and Chip Authentication: classic Diffie-Hellman
//! over the RFC 5114 MODP groups and ECDH over the standardized curves of
//! ICAO Doc 9303-11 Section 9.5.1, including the PACE generic mapping step.

use alloc::vec::Vec;
use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use openssl::dh::Dh;
use openssl::ec::{EcGroup, EcGroupRef, EcKey, EcPoint, PointConversionForm};
use openssl::nid::Nid;
use tracing::error;

use crate::security_info::KeyAgreementAlgorithm;
use crate::AuthError;

/// An ephemeral key pair. The public half is in wire encoding, an unsigned
/// big-endian integer for DH and an uncompressed point for ECDH.
pub(crate) struct KeyPair {
    pub private: BigNum,
    pub public: Vec<u8>,
}

/// Domain parameters for one key agreement run.
///
/// Generic mapping replaces the generator, so mapping produces a fresh
/// `KeyAgreement` and the original is kept only for the first exchange.
pub(crate) enum KeyAgreement {
    Dh { p: BigNum, q: BigNum, g: BigNum },
    Ecdh { group: EcGroup },
}

impl KeyAgreement {
    /// Instantiates the standardized domain parameters for a PACEInfo
    /// parameterId, ICAO Doc 9303-11 Section 9.5.1.
    ///
    /// # Errors
    ///
    /// * `AuthError::UnsupportedAlgorithm` if the id is not standardized for
    ///   the key agreement primitive or the curve has no OpenSSL binding.
    pub(crate) fn from_parameters(
        alg: KeyAgreementAlgorithm,
        parameter_id: u32,
    ) -> Result<Self, AuthError> {
        match alg {
            KeyAgreementAlgorithm::Dh => {
                let params = match parameter_id {
                    0 => Dh::get_1024_160()?,
                    1 => Dh::get_2048_224()?,
                    2 => Dh::get_2048_256()?,
                    _ => {
                        error!("Standardized DH domain parameter id must be 0, 1 or 2, found {parameter_id}");
                        return Err(AuthError::UnsupportedAlgorithm(
                            "Standardized DH domain parameter id must be 0, 1 or 2",
                        ));
                    }
                };
                let Some(q) = params.prime_q() else {
                    error!("RFC 5114 DH domain parameters are missing the subgroup order");
                    return Err(AuthError::UnsupportedAlgorithm(
                        "RFC 5114 DH domain parameters are missing the subgroup order",
                    ));
                };
                Ok(Self::Dh {
                    p: params.prime_p().to_owned()?,
                    q: q.to_owned()?,
                    g: params.generator().to_owned()?,
                })
            }
            KeyAgreementAlgorithm::Ecdh => {
                let nid = match parameter_id {
                    8 => Nid::X9_62_PRIME192V1,
                    9 => {
                        // Not exposed by the OpenSSL bindings
                        error!("BrainpoolP192r1 (parameter id 9) is not supported");
                        return Err(AuthError::UnsupportedAlgorithm(
                            "BrainpoolP192r1 (parameter id 9) is not supported",
                        ));
                    }
                    10 => Nid::SECP224R1,
                    11 => Nid::BRAINPOOL_P224R1,
                    12 => Nid::X9_62_PRIME256V1,
                    13 => Nid::BRAINPOOL_P256R1,
                    14 => Nid::BRAINPOOL_P320R1,
                    15 => Nid::SECP384R1,
                    16 => Nid::BRAINPOOL_P384R1,
                    17 => Nid::BRAINPOOL_P512R1,
                    18 => Nid::SECP521R1,
                    _ => {
                        error!("Standardized ECDH domain parameter id must be 8 to 18, found {parameter_id}");
                        return Err(AuthError::UnsupportedAlgorithm(
                            "Standardized ECDH domain parameter id must be 8 to 18",
                        ));
                    }
                };
                Ok(Self::Ecdh {
                    group: EcGroup::from_curve_name(nid)?,
                })
            }
        }
    }

    /// Tag of the public key data object inside the `7F49` authentication
    /// token template: `84` for DH, `86` for an ECDH point.
    pub(crate) fn public_key_do_tag(&self) -> u8 {
        match self {
            Self::Dh { .. } => 0x84,
            Self::Ecdh { .. } => 0x86,
        }
    }

    /// Generates an ephemeral key pair on the current domain parameters.
    ///
    /// # Errors
    ///
    /// * `AuthError` if OpenSSL fails to generate the key.
    pub(crate) fn generate_keypair(&self) -> Result<KeyPair, AuthError> {
        match self {
            Self::Dh { p, q, g } => {
                let dh =
                    Dh::from_pqg((**p).to_owned()?, Some((**q).to_owned()?), (**g).to_owned()?)?
                        .generate_key()?;
                Ok(KeyPair {
                    private: dh.private_key().to_owned()?,
                    public: dh.public_key().to_vec_padded(p.num_bytes())?,
                })
            }
            Self::Ecdh { group } => ecdh_generate_keypair(group),
        }
    }

    /// Runs the key agreement against the peer public key and returns the
    /// shared secret in the encoding the ICAO KDF expects: the unsigned
    /// big-endian integer for DH, the x-coordinate for ECDH.
    ///
    /// # Errors
    ///
    /// * `AuthError` if the peer key is not a valid group element.
    pub(crate) fn shared_secret(
        &self,
        private: &BigNumRef,
        peer_public: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        match self {
            Self::Dh { p, .. } => {
                let mut ctx = BigNumContext::new()?;
                let peer = BigNum::from_slice(peer_public)?;

                // 1 < y < p - 1
                let mut p_minus_one = (**p).to_owned()?;
                p_minus_one.sub_word(1)?;
                if peer.le(&BigNum::from_u32(1)?) || peer.ge(&p_minus_one) {
                    error!("Peer DH public key is not a valid group element");
                    return Err(AuthError::InvalidArgument(
                        "Peer DH public key is not a valid group element",
                    ));
                }

                let mut shared = BigNum::new()?;
                shared.mod_exp(&peer, private, p, &mut ctx)?;
                Ok(shared.to_vec_padded(p.num_bytes())?)
            }
            Self::Ecdh { group } => ecdh_shared_secret(group, private, peer_public),
        }
    }

    /// PACE generic mapping: replaces the generator with
    /// `G' = G^s * H` (DH) or `G' = s*G + H` (ECDH), where `H` is the
    /// Diffie-Hellman result of the derivation key exchange and `s` the
    /// decrypted chip nonce. ICAO Doc 9303-11 Section 4.4.3.3.
    ///
    /// # Errors
    ///
    /// * `AuthError` if the peer mapping key is invalid or the new generator
    ///   would be degenerate.
    pub(crate) fn map_generator(
        &self,
        nonce: &BigNumRef,
        derivation_private: &BigNumRef,
        peer_mapping_public: &[u8],
    ) -> Result<Self, AuthError> {
        match self {
            Self::Dh { p, q, g } => {
                let mut ctx = BigNumContext::new()?;
                let peer = BigNum::from_slice(peer_mapping_public)?;

                let mut h = BigNum::new()?;
                h.mod_exp(&peer, derivation_private, p, &mut ctx)?;

                let mut g_to_s = BigNum::new()?;
                g_to_s.mod_exp(g, nonce, p, &mut ctx)?;

                let mut mapped = BigNum::new()?;
                mapped.mod_mul(&g_to_s, &h, p, &mut ctx)?;

                if mapped.le(&BigNum::from_u32(1)?) {
                    error!("Mapped DH generator is degenerate");
                    return Err(AuthError::InvalidArgument(
                        "Mapped DH generator is degenerate",
                    ));
                }

                Ok(Self::Dh {
                    p: (**p).to_owned()?,
                    q: (**q).to_owned()?,
                    g: mapped,
                })
            }
            Self::Ecdh { group } => {
                let mut ctx = BigNumContext::new()?;
                let peer = EcPoint::from_bytes(group, peer_mapping_public, &mut ctx)?;

                let mut h = EcPoint::new(group)?;
                h.mul2(group, &peer, derivation_private, &mut ctx)?;
                if h.is_infinity(group) {
                    error!("ECDH mapping produced the point at infinity");
                    return Err(AuthError::InvalidArgument(
                        "ECDH mapping produced the point at infinity",
                    ));
                }

                // G' = nonce * G + 1 * H
                let one = BigNum::from_u32(1)?;
                let mut mapped = EcPoint::new(group)?;
                mapped.mul_full(group, nonce, &h, &one, &mut ctx)?;
                if mapped.is_infinity(group) {
                    error!("Mapped ECDH generator is the point at infinity");
                    return Err(AuthError::InvalidArgument(
                        "Mapped ECDH generator is the point at infinity",
                    ));
                }

                let mut p = BigNum::new()?;
                let mut a = BigNum::new()?;
                let mut b = BigNum::new()?;
                group.components_gfp(&mut p, &mut a, &mut b, &mut ctx)?;
                let mut order = BigNum::new()?;
                group.order(&mut order, &mut ctx)?;
                let mut cofactor = BigNum::new()?;
                group.cofactor(&mut cofactor, &mut ctx)?;

                // `mapped` lives on the named-curve group, whose EC method may
                // differ from the explicit-components group; round-trip the
                // point through its encoding so both belong to the same group.
                let mapped_bytes =
                    mapped.to_bytes(group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;
                let mut mapped_group = EcGroup::from_components(p, a, b, &mut ctx)?;
                let mapped = EcPoint::from_bytes(&mapped_group, &mapped_bytes, &mut ctx)?;
                mapped_group.set_generator(mapped, order, cofactor)?;

                Ok(Self::Ecdh {
                    group: mapped_group,
                })
            }
        }
    }
}

/// Generates an ephemeral ECDH key pair on the given group.
///
/// # Errors
///
/// * `AuthError` if OpenSSL fails to generate the key.
pub(crate) fn ecdh_generate_keypair(group: &EcGroupRef) -> Result<KeyPair, AuthError> {
    let mut ctx = BigNumContext::new()?;
    let key = EcKey::generate(group)?;
    let public =
        key.public_key()
            .to_bytes(group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;
    Ok(KeyPair {
        private: key.private_key().to_owned()?,
        public,
    })
}

/// ECDH shared secret: the x-coordinate of `private * peer`, left-padded to
/// the field size.
///
/// # Errors
///
/// * `AuthError` if the peer point is not on the curve or the result is the
///   point at infinity.
pub(crate) fn ecdh_shared_secret(
    group: &EcGroupRef,
    private: &BigNumRef,
    peer_public: &[u8],
) -> Result<Vec<u8>, AuthError> {
    let mut ctx = BigNumContext::new()?;
    let peer = EcPoint::from_bytes(group, peer_public, &mut ctx)?;
    if !peer.is_on_curve(group, &mut ctx)? {
        error!("Peer ECDH public key is not on the curve");
        return Err(AuthError::InvalidArgument(
            "Peer ECDH public key is not on the curve",
        ));
    }

    let mut shared = EcPoint::new(group)?;
    shared.mul2(group, &peer, private, &mut ctx)?;
    if shared.is_infinity(group) {
        error!("ECDH key agreement produced the point at infinity");
        return Err(AuthError::InvalidArgument(
            "ECDH key agreement produced the point at infinity",
        ));
    }

    let mut x = BigNum::new()?;
    let mut y = BigNum::new()?;
    shared.affine_coordinates(group, &mut x, &mut y, &mut ctx)?;

    let mut p = BigNum::new()?;
    let mut a = BigNum::new()?;
    let mut b = BigNum::new()?;
    group.components_gfp(&mut p, &mut a, &mut b, &mut ctx)?;

    Ok(x.to_vec_padded(p.num_bytes())?)
}
