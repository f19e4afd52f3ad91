//! Secure messaging: APDU protection with the session keys negotiated by
//! BAC, PACE or Chip Authentication.
//!
//! For the protection format and worked examples see ICAO Doc 9303-11
//! Section 9.8 and Appendix D.4
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use alloc::{format, vec, vec::Vec};
use constant_time_eq::constant_time_eq;
use tracing::error;

use crate::crypt::{
    compute_key, compute_mac, decrypt_with, encrypt_ecb_with, encrypt_with, padding_method_2,
    remove_padding, EncryptionAlgorithm, KeyType, MacAlgorithm,
};
use crate::iso7816::{int2asn1len, len2int, APDU};
use crate::AuthError;

/// The secure messaging key pair KS_enc / KS_mac.
#[derive(Clone)]
pub struct SessionKeys {
    pub(crate) ks_enc: Vec<u8>,
    pub(crate) ks_mac: Vec<u8>,
}

impl SessionKeys {
    /// Derives both session keys from a shared key seed with the ICAO KDF.
    ///
    /// # Errors
    ///
    /// * `AuthError` if key derivation fails.
    pub fn derive(key_seed: &[u8], alg: EncryptionAlgorithm) -> Result<Self, AuthError> {
        Ok(Self {
            ks_enc: compute_key(key_seed, KeyType::Encryption, alg)?,
            ks_mac: compute_key(key_seed, KeyType::Mac, alg)?,
        })
    }
}

/// Increments a big-endian Send Sequence Counter in place.
///
/// # Errors
///
/// * `AuthError` if the SSC length is unexpected or the counter overflows.
pub(crate) fn increment_ssc_bytes(ssc: &mut Vec<u8>) -> Result<(), AuthError> {
    match ssc.len() {
        8 => {
            let current = u64::from_be_bytes(ssc.as_slice().try_into().expect("length checked"));
            let Some(incremented) = current.checked_add(1) else {
                error!("SSC overflew during increment");
                return Err(AuthError::OverflowSscError());
            };
            *ssc = incremented.to_be_bytes().to_vec();
            Ok(())
        }
        16 => {
            let current = u128::from_be_bytes(ssc.as_slice().try_into().expect("length checked"));
            let Some(incremented) = current.checked_add(1) else {
                error!("SSC overflew during increment");
                return Err(AuthError::OverflowSscError());
            };
            *ssc = incremented.to_be_bytes().to_vec();
            Ok(())
        }
        found => {
            error!("SSC length must be 8 or 16, found {found}");
            Err(AuthError::InvalidArgument("SSC length must be 8 or 16"))
        }
    }
}

/// An established secure messaging session.
///
/// The Send Sequence Counter advances once for every protected command and
/// once for every protected response, so a full round trip moves it by two.
/// Any MAC or structure failure on a response is fatal for the session.
pub struct SmSession {
    enc_alg: EncryptionAlgorithm,
    mac_alg: MacAlgorithm,
    /// Data is padded to a multiple of `pad_len`, the cipher block size.
    pad_len: usize,
    keys: SessionKeys,
    ssc: Vec<u8>,
}

impl SmSession {
    /// Creates a session from negotiated keys and the initial SSC.
    ///
    /// BAC seeds the SSC from the challenge nonces, PACE and Chip
    /// Authentication start from an all-zero counter.
    ///
    /// # Errors
    ///
    /// * `AuthError` if the SSC length does not match the cipher block size.
    pub fn new(
        enc_alg: EncryptionAlgorithm,
        keys: SessionKeys,
        ssc: Vec<u8>,
    ) -> Result<Self, AuthError> {
        if ssc.len() != enc_alg.pad_len() {
            error!(
                "SSC length must match the cipher block size {}, found {}",
                enc_alg.pad_len(),
                ssc.len()
            );
            return Err(AuthError::InvalidArgument(
                "SSC length must match the cipher block size",
            ));
        }
        Ok(Self {
            enc_alg,
            mac_alg: enc_alg.mac_algorithm(),
            pad_len: enc_alg.pad_len(),
            keys,
            ssc,
        })
    }

    pub(crate) fn ssc(&self) -> &[u8] {
        &self.ssc
    }

    /// IV for the data encryption of the current SSC state. 3DES secure
    /// messaging uses a zero IV, AES encrypts the SSC in ECB mode.
    fn block_iv(&self) -> Result<Vec<u8>, AuthError> {
        match self.enc_alg {
            EncryptionAlgorithm::DES3 => Ok(vec![0; 8]),
            EncryptionAlgorithm::AES128
            | EncryptionAlgorithm::AES192
            | EncryptionAlgorithm::AES256 => {
                encrypt_ecb_with(self.enc_alg, &self.keys.ks_enc, &self.ssc)
            }
        }
    }

    /// Protects a command APDU for transmission.
    ///
    /// Increments the SSC, encrypts the command data into a DO'87' (even
    /// INS, with padding indicator) or DO'85' (odd INS), wraps Le into a
    /// DO'97' and appends the DO'8E' checksum.
    ///
    /// # Errors
    ///
    /// * `AuthError` if a cryptographic step fails or the payload does not fit.
    pub fn wrap_command(&mut self, apdu: &APDU) -> Result<Vec<u8>, AuthError> {
        increment_ssc_bytes(&mut self.ssc)?;

        let mut apdu = apdu.clone();
        apdu.cla |= 0x0C;

        let mut payload = Vec::new();
        if let Some(cdata) = &apdu.cdata {
            let data = padding_method_2(cdata, self.pad_len)?;
            let iv = self.block_iv()?;
            let encrypted_data = encrypt_with(self.enc_alg, &self.keys.ks_enc, Some(&iv), &data)?;

            if apdu.ins % 2 == 0 {
                // For a command with even INS, any command data is encrypted
                // and encapsulated in a Tag 87 with padding indicator (01).
                let do87 = [
                    b"\x87",
                    (&*int2asn1len([&b"\x01"[..], &encrypted_data].concat().len())),
                    &[&b"\x01"[..], &encrypted_data].concat(),
                ]
                .concat();
                payload.extend_from_slice(&do87);
            } else {
                // For a command with odd INS, any command data is encrypted
                // and encapsulated in a Tag 85 without padding indicator.
                let do85 = [
                    b"\x85",
                    (&*int2asn1len(encrypted_data.len())),
                    &encrypted_data,
                ]
                .concat();
                payload.extend_from_slice(&do85);
            }
        }

        if let Some(le) = &apdu.le {
            // Commands with response (Le field not empty)
            // have a protected Le-field (Tag 97) in the command data.
            let do97 = [b"\x97", (&*int2asn1len(le.len())), le].concat();
            payload.extend_from_slice(&do97);
        }

        let padded_header = padding_method_2(&apdu.get_command_header(), self.pad_len)?;
        let n = padding_method_2(
            &[&self.ssc[..], (&*padded_header), &payload].concat(),
            self.pad_len,
        )?;
        let cc = compute_mac(&self.keys.ks_mac, &n, self.mac_alg)?;

        let do8e = [b"\x8E", (&*int2asn1len(cc.len())), &cc].concat();
        payload.extend_from_slice(&do8e);

        Ok([
            apdu.get_command_header(),
            [u8::try_from(payload.len()).map_err(AuthError::IntCastError)?].to_vec(),
            payload,
            b"\x00".to_vec(),
        ]
        .concat())
    }

    /// Verifies and decrypts a protected response APDU (without the
    /// trailing status words).
    ///
    /// # Errors
    ///
    /// * `AuthError::SecureMessagingError` if the checksum does not verify.
    /// * `AuthError` if the response structure is malformed.
    pub fn unwrap_response(&mut self, rapdu: &[u8]) -> Result<Vec<u8>, AuthError> {
        increment_ssc_bytes(&mut self.ssc)?;

        // A chip that lost the session answers with a bare status word
        if rapdu.is_empty() {
            error!("R_APDU carries no secure messaging data objects");
            return Err(AuthError::SecureMessagingError(
                "R_APDU carries no secure messaging data objects",
            ));
        }

        let mut encrypted_data = Vec::new();
        let mut decrypted_data = Vec::new();
        let mut do85: Option<&[u8]> = None;
        let mut do87: Option<&[u8]> = None;
        let mut do99: Option<&[u8]> = None;
        let mut do8e: Option<&[u8]> = None;

        let mut rapdu = rapdu;
        loop {
            let (tl_len, value_len) = len2int(rapdu, 1)?;
            if rapdu.len() < tl_len + value_len {
                error!(
                    "R_APDU data object is incomplete, expected len: {}, found len: {}",
                    tl_len + value_len,
                    rapdu.len()
                );
                return Err(AuthError::ParseAsn1DataError(tl_len + value_len, rapdu.len()));
            }
            match rapdu[0] {
                b'\x85' => {
                    encrypted_data = rapdu[tl_len..tl_len + value_len].to_vec();
                    do85 = Some(&rapdu[..tl_len + value_len]);
                }
                b'\x87' => {
                    encrypted_data = rapdu[tl_len..tl_len + value_len].to_vec();
                    do87 = Some(&rapdu[..tl_len + value_len]);
                }
                b'\x99' => do99 = Some(&rapdu[..tl_len + value_len]),
                b'\x8e' => {
                    do8e = Some(&rapdu[tl_len..tl_len + value_len]);
                }
                _ => {
                    error!("Tag not supported in encrypted R_APDU");
                    return Err(AuthError::ParseDataError(format!(
                        "Tag {:02X} not supported in encrypted R_APDU",
                        rapdu[0]
                    )));
                }
            }
            rapdu = &rapdu[tl_len + value_len..];
            if rapdu.is_empty() {
                break;
            }
        }

        let k = padding_method_2(
            &[
                &self.ssc[..],
                do85.unwrap_or_default(),
                do87.unwrap_or_default(),
                do99.unwrap_or_default(),
            ]
            .concat(),
            self.pad_len,
        )?;
        let cc = compute_mac(&self.keys.ks_mac, &k, self.mac_alg)?;
        if !constant_time_eq(&cc, do8e.unwrap_or_default()) {
            error!("R_APDU MAC verification failed");
            return Err(AuthError::SecureMessagingError(
                "R_APDU MAC verification failed",
            ));
        }

        if !encrypted_data.is_empty() {
            // If INS is even, remove the padding indicator (01)
            if do87.is_some() {
                if encrypted_data[0] != 0x01 {
                    error!("DO87 padding indicator must be 01");
                    return Err(AuthError::SecureMessagingError(
                        "DO87 padding indicator must be 01",
                    ));
                }
                encrypted_data = encrypted_data[1..].to_vec();
            }
            let iv = self.block_iv()?;
            let decrypted_padded_data =
                decrypt_with(self.enc_alg, &self.keys.ks_enc, Some(&iv), &encrypted_data)?;
            decrypted_data = remove_padding(&decrypted_padded_data).to_vec();
        }
        Ok(decrypted_data)
    }
}
