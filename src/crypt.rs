//! Symmetric primitives: the ICAO 9303 KDF, block cipher helpers,
//! retail MAC / AES-CMAC and ISO 9797-1 padding.

use alloc::{format, string::String, vec, vec::Vec};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::{Cmac, Mac};
use core::{fmt::Write, iter};
use sha1_checked::Sha1;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::AuthError;

/// Key derivation counter selector, ICAO Doc 9303-11 Section 9.7.1.
#[derive(Debug, Clone, Copy)]
pub enum KeyType {
    /// Counter 1, session encryption key.
    Encryption,
    /// Counter 2, session MAC key.
    Mac,
    /// Counter 3, PACE password key K_pi.
    PacePassword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    DES3,
    AES128,
    AES192,
    AES256,
}

impl EncryptionAlgorithm {
    /// Cipher block size, which is also the secure messaging padding width.
    pub(crate) fn pad_len(self) -> usize {
        match self {
            Self::DES3 => 8,
            Self::AES128 | Self::AES192 | Self::AES256 => 16,
        }
    }

    pub(crate) fn mac_algorithm(self) -> MacAlgorithm {
        match self {
            Self::DES3 => MacAlgorithm::DES,
            Self::AES128 | Self::AES192 | Self::AES256 => MacAlgorithm::AESCMAC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// ISO/IEC 9797-1 MAC algorithm 3 with DES ("retail MAC").
    DES,
    /// AES-CMAC truncated to 8 bytes.
    AESCMAC,
}

/// Helper function that converts a byte slice into a hex string.
///
/// # Example
///
/// ```
/// use mrtd_auth::bytes2hex;
/// let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
/// assert_eq!(bytes2hex(&bytes), "DEADBEEF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, &byte| {
        write!(&mut acc, "{byte:02X}").expect("Failed to write to string");
        acc
    })
}

/// Generates a key seed from the given secret.
///
/// Calculates the SHA-1 of `secret` and returns the result.
/// BAC uses the first 16 bytes, PACE feeds all 20 into the password KDF.
/// ICAO Doc 9303-11 Sections 4.3.2 and 9.7.3.
///
/// # Errors
///
/// `AuthError` if SHA-1 hits a detected collision.
pub(crate) fn generate_key_seed(secret: &[u8]) -> Result<Vec<u8>, AuthError> {
    let hash_result = Sha1::try_digest(secret);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during generate_key_seed had collision");
        return Err(AuthError::CalculateHashError(
            "SHA1 hash calculation during generate_key_seed had collision",
        ));
    }
    Ok(hash_result.hash().as_slice().to_vec())
}

/// Encrypts data using the specified block cipher and mode.
///
/// # Errors
///
/// `AuthError` if key, IV or data sizes do not fit the cipher.
fn encrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, AuthError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    if key.len() != CM::key_size() {
        error!(
            "Wrong key size for cipher encryption, expected {}, found {}",
            CM::key_size(),
            key.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong key size for cipher encryption",
        ));
    }
    if let Some(iv) = iv {
        if iv.len() != CM::iv_size() {
            error!(
                "Wrong IV size for cipher encryption, expected {}, found {}",
                CM::iv_size(),
                iv.len()
            );
            return Err(AuthError::InvalidArgument(
                "Wrong IV size for cipher encryption",
            ));
        }
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Wrong data size for cipher encryption, expected {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong data size for cipher encryption",
        ));
    }

    Ok(CM::new(key.into(), iv.unwrap_or_default().into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Encrypts data using the specified block cipher in Electronic Codebook (ECB) mode.
///
/// # Errors
///
/// `AuthError` if key or data sizes do not fit the cipher.
fn encrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError>
where
    CM: BlockEncryptMut + KeyInit,
{
    if key.len() != CM::key_size() {
        error!(
            "Wrong key size for cipher encryption, expected {}, found {}",
            CM::key_size(),
            key.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong key size for cipher encryption",
        ));
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Wrong data size for cipher encryption, expected {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong data size for cipher encryption",
        ));
    }

    Ok(CM::new(key.into()).encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts data using the specified block cipher and mode.
///
/// # Errors
///
/// `AuthError` if key, IV or data sizes do not fit the cipher.
fn decrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, AuthError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    if key.len() != CM::key_size() {
        error!(
            "Wrong key size for cipher decryption, expected {}, found {}",
            CM::key_size(),
            key.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong key size for cipher decryption",
        ));
    }
    if let Some(iv) = iv {
        if iv.len() != CM::iv_size() {
            error!(
                "Wrong IV size for cipher decryption, expected {}, found {}",
                CM::iv_size(),
                iv.len()
            );
            return Err(AuthError::InvalidArgument(
                "Wrong IV size for cipher decryption",
            ));
        }
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Wrong data size for cipher decryption, expected {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong data size for cipher decryption",
        ));
    }

    CM::new(key.into(), iv.unwrap_or_default().into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(AuthError::UnpadError)
}

/// Decrypts data using the specified block cipher in Electronic Codebook (ECB) mode.
///
/// # Errors
///
/// `AuthError` if key or data sizes do not fit the cipher.
fn decrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError>
where
    CM: BlockDecryptMut + KeyInit,
{
    if key.len() != CM::key_size() {
        error!(
            "Wrong key size for cipher decryption, expected {}, found {}",
            CM::key_size(),
            key.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong key size for cipher decryption",
        ));
    }
    if data.len() % CM::block_size() != 0 {
        error!(
            "Wrong data size for cipher decryption, expected {}, found {}",
            CM::block_size(),
            data.len()
        );
        return Err(AuthError::InvalidArgument(
            "Wrong data size for cipher decryption",
        ));
    }

    CM::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(AuthError::UnpadError)
}

/// CBC encryption dispatched on the negotiated session cipher.
pub(crate) fn encrypt_with(
    alg: EncryptionAlgorithm,
    key: &[u8],
    iv: Option<&[u8]>,
    data: &[u8],
) -> Result<Vec<u8>, AuthError> {
    match alg {
        EncryptionAlgorithm::DES3 => encrypt::<cbc::Encryptor<des::TdesEde3>>(key, iv, data),
        EncryptionAlgorithm::AES128 => encrypt::<cbc::Encryptor<aes::Aes128>>(key, iv, data),
        EncryptionAlgorithm::AES192 => encrypt::<cbc::Encryptor<aes::Aes192>>(key, iv, data),
        EncryptionAlgorithm::AES256 => encrypt::<cbc::Encryptor<aes::Aes256>>(key, iv, data),
    }
}

/// CBC decryption dispatched on the negotiated session cipher.
pub(crate) fn decrypt_with(
    alg: EncryptionAlgorithm,
    key: &[u8],
    iv: Option<&[u8]>,
    data: &[u8],
) -> Result<Vec<u8>, AuthError> {
    match alg {
        EncryptionAlgorithm::DES3 => decrypt::<cbc::Decryptor<des::TdesEde3>>(key, iv, data),
        EncryptionAlgorithm::AES128 => decrypt::<cbc::Decryptor<aes::Aes128>>(key, iv, data),
        EncryptionAlgorithm::AES192 => decrypt::<cbc::Decryptor<aes::Aes192>>(key, iv, data),
        EncryptionAlgorithm::AES256 => decrypt::<cbc::Decryptor<aes::Aes256>>(key, iv, data),
    }
}

/// Single-shot ECB encryption, used to derive the AES secure messaging IV
/// as `E(KS_enc, SSC)`.
pub(crate) fn encrypt_ecb_with(
    alg: EncryptionAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, AuthError> {
    match alg {
        EncryptionAlgorithm::DES3 => encrypt_ecb::<ecb::Encryptor<des::TdesEde3>>(key, data),
        EncryptionAlgorithm::AES128 => encrypt_ecb::<ecb::Encryptor<aes::Aes128>>(key, data),
        EncryptionAlgorithm::AES192 => encrypt_ecb::<ecb::Encryptor<aes::Aes192>>(key, data),
        EncryptionAlgorithm::AES256 => encrypt_ecb::<ecb::Encryptor<aes::Aes256>>(key, data),
    }
}

/// Computes a key based on the given key seed, key type, and encryption algorithm.
///
/// The ICAO 9303 KDF hashes `key_seed ‖ counter` with a 4 byte big-endian
/// counter (1 for encryption, 2 for MAC, 3 for the PACE password) and
/// truncates the digest to the cipher key length. 3DES and AES-128 use
/// SHA-1, AES-192 and AES-256 use SHA-256.
/// For calculation examples see ICAO Doc 9303-11 Appendix D.1 and G.1:
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Errors
///
/// `AuthError` if key computation fails.
pub(crate) fn compute_key(
    key_seed: &[u8],
    key_type: KeyType,
    alg: EncryptionAlgorithm,
) -> Result<Vec<u8>, AuthError> {
    let c: &[u8] = match key_type {
        KeyType::Encryption => b"\x00\x00\x00\x01",
        KeyType::Mac => b"\x00\x00\x00\x02",
        KeyType::PacePassword => b"\x00\x00\x00\x03",
    };

    let mut d = key_seed.to_vec();
    d.extend_from_slice(c);

    match alg {
        EncryptionAlgorithm::DES3 => {
            let hash_result = Sha1::try_digest(&d);
            if hash_result.has_collision() {
                error!("SHA1 hash calculation during 3DES compute_key had collision");
                return Err(AuthError::CalculateHashError(
                    "SHA1 hash calculation during 3DES compute_key had collision",
                ));
            }
            let hash_bytes = hash_result.hash().as_slice().to_vec();
            let key_1_2 = des3_adjust_parity_bits(hash_bytes.iter().copied().take(16).collect());
            match key_type {
                // A two-key 3DES cipher key is expanded to K1-K2-K1
                KeyType::Encryption | KeyType::PacePassword => {
                    Ok([&key_1_2[..], &key_1_2[..8]].concat())
                }
                KeyType::Mac => Ok(key_1_2),
            }
        }
        EncryptionAlgorithm::AES128 => {
            let hash_result = Sha1::try_digest(&d);
            if hash_result.has_collision() {
                error!("SHA1 hash calculation during AES-128 compute_key had collision");
                return Err(AuthError::CalculateHashError(
                    "SHA1 hash calculation during AES-128 compute_key had collision",
                ));
            }
            let hash_bytes = hash_result.hash().as_slice().to_vec();
            Ok(hash_bytes.iter().copied().take(16).collect())
        }
        EncryptionAlgorithm::AES192 => {
            let hash_result = Sha256::digest(&d);
            let hash_bytes = hash_result.as_slice().to_vec();
            Ok(hash_bytes.iter().copied().take(24).collect())
        }
        EncryptionAlgorithm::AES256 => {
            let hash_result = Sha256::digest(&d);
            let hash_bytes = hash_result.as_slice().to_vec();
            Ok(hash_bytes)
        }
    }
}

/// Computes a MAC of data using the given key and MAC algorithm.
///
/// For `MacAlgorithm::DES` the input must already be padded to a multiple
/// of 8 (use [`padding_method_2`]); the result is the 8 byte retail MAC.
/// For `MacAlgorithm::AESCMAC` the AES key size is taken from the key
/// length and the CMAC is truncated to 8 bytes, ICAO Doc 9303-11
/// Section 9.8.7.
///
/// # Errors
///
/// * `AuthError` if `key` or `data` length is wrong or a cipher operation fails.
pub(crate) fn compute_mac(
    key: &[u8],
    data: &[u8],
    alg: MacAlgorithm,
) -> Result<Vec<u8>, AuthError> {
    match alg {
        MacAlgorithm::DES => {
            if key.len() != 16 {
                error!("Can not compute MAC, MAC key is invalid.");
                return Err(AuthError::InvalidMacKeyError(16, key.len()));
            }

            if data.len() % 8 != 0 {
                error!("Can not compute MAC, data length is invalid.");
                return Err(AuthError::ParseDataError(format!(
                    "MAC calculation should be a multiple of 8, but found {}",
                    data.len()
                )));
            }

            let key1 = &key[..8];
            let key2 = &key[8..];

            let mut h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &data[..8])?;

            for i in 1..(data.len() / 8) {
                h = encrypt_ecb::<ecb::Encryptor<des::Des>>(
                    key1,
                    &xor_slices(&h, &data[8 * i..8 * (i + 1)])?,
                )?;
            }

            let mac_x = encrypt_ecb::<ecb::Encryptor<des::Des>>(
                key1,
                &decrypt_ecb::<ecb::Decryptor<des::Des>>(key2, &h)?,
            )?;

            Ok(mac_x)
        }
        MacAlgorithm::AESCMAC => {
            let full_mac = match key.len() {
                16 => {
                    let mut mac = <Cmac<aes::Aes128> as Mac>::new_from_slice(key)
                        .map_err(|_| AuthError::InvalidMacKeyError(16, key.len()))?;
                    mac.update(data);
                    mac.finalize().into_bytes().to_vec()
                }
                24 => {
                    let mut mac = <Cmac<aes::Aes192> as Mac>::new_from_slice(key)
                        .map_err(|_| AuthError::InvalidMacKeyError(24, key.len()))?;
                    mac.update(data);
                    mac.finalize().into_bytes().to_vec()
                }
                32 => {
                    let mut mac = <Cmac<aes::Aes256> as Mac>::new_from_slice(key)
                        .map_err(|_| AuthError::InvalidMacKeyError(32, key.len()))?;
                    mac.update(data);
                    mac.finalize().into_bytes().to_vec()
                }
                found => {
                    error!("Can not compute AES-CMAC, MAC key is invalid.");
                    return Err(AuthError::InvalidMacKeyError(16, found));
                }
            };
            Ok(full_mac[..8].to_vec())
        }
    }
}

/// XORs two byte slices and returns the result.
///
/// # Errors
///
/// * `AuthError` if input `a` and `b` have different lengths.
pub(crate) fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, AuthError> {
    if a.len() == b.len() {
        let result: Vec<u8> = a.iter().zip(b.iter()).map(|(&x, &y)| x ^ y).collect();
        return Ok(result);
    }
    error!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    );
    Err(AuthError::ParseDataError(format!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    )))
}

/// Pads the input data using padding method 2.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
///
/// # Errors
///
/// * `AuthError` if `pad_to` is 0.
pub(crate) fn padding_method_2(data: &[u8], pad_to: usize) -> Result<Vec<u8>, AuthError> {
    if pad_to == 0 {
        error!("pad_to must be greater than 0, found {}", pad_to);
        return Err(AuthError::InvalidArgument("pad_to must be greater than 0"));
    }

    let mut data = data.to_vec();
    data.push(0x80);
    if data.len() % pad_to != 0 {
        let padding_len = pad_to - (data.len() % pad_to);
        data.extend(iter::repeat(0).take(padding_len));
    }
    Ok(data)
}

/// Removes the padding added by padding method 2 from the input data.
///
/// If the padding exists, returns data with the padding removed,
/// otherwise the original data.
pub(crate) fn remove_padding(data: &[u8]) -> &[u8] {
    for (i, &b) in data.iter().rev().enumerate() {
        if b == 0x80 {
            return &data[..data.len() - 1 - i];
        }
    }
    data
}

/// Adjusts the parity bits of a 3DES key.
pub(crate) fn des3_adjust_parity_bits(mut key: Vec<u8>) -> Vec<u8> {
    for byte in &mut key {
        let mut bitmask = 1;
        let mut b = *byte;
        for _ in 0..8 {
            bitmask ^= b & 0x1;
            b >>= 1;
        }
        *byte ^= bitmask;
    }
    key
}
