//! An eMRTD (Electronic Machine Readable Travel Document) authentication engine.
//!
//! The `mrtd_auth` crate drives the full ICAO Doc 9303 authentication flow
//! against a passport chip: PACE (with BAC fallback), secure messaging,
//! Chip Authentication and Passive Authentication. The transport is
//! abstracted behind the [`CardTransceiver`] trait, so the engine works with
//! any APDU channel (PC/SC, NFC, a test double) the caller provides.
//!
//! # Quick Start
//!
//! ```no_run
//! use mrtd_auth::{AuthError, AuthenticationEngine, CardTransceiver, MrzKey, TransportError, TrustAnchorSet};
//! use tracing::info;
//!
//! struct MyReader;
//!
//! impl CardTransceiver for MyReader {
//!     fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
//!         // forward `command` to the contactless interface and return the response
//!         unimplemented!()
//!     }
//! }
//!
//! fn main() -> Result<(), AuthError> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     let mrz_key = MrzKey::new("L898902C3", "740812", "120415")?;
//!     let master_list = std::fs::read("csca_master_list.ml").expect("master list file");
//!     let anchors = TrustAnchorSet::from_master_list(&master_list)?;
//!
//!     let mut engine = AuthenticationEngine::new(MyReader);
//!     let result = engine.authenticate(&mrz_key, &anchors, &mut |status| info!("{status}"))?;
//!
//!     info!(
//!         "PACE: {}, BAC: {}, CA: {}, PA: {}",
//!         result.pace_succeeded,
//!         result.bac_succeeded,
//!         result.chip_auth_succeeded,
//!         result.passive_auth_succeeded
//!     );
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

extern crate alloc;

use core::fmt;
use std::num::TryFromIntError;

mod bac;
mod chip_auth;
mod comms;
mod crypt;
mod iso7816;
mod kex;
mod mrz;
mod orchestrator;
mod pace;
mod passive_auth;
mod secure_messaging;
mod security_info;

#[cfg(test)]
pub(crate) mod testutil;

pub use comms::PassportComms;
pub use crypt::{bytes2hex, EncryptionAlgorithm, KeyType, MacAlgorithm};
pub use iso7816::{CardTransceiver, TransportError, APDU};
pub use mrz::MrzKey;
pub use orchestrator::{AuthenticationEngine, AuthenticationResult, EngineState};
pub use passive_auth::{passive_authentication, DataGroupHashTable, TrustAnchorSet};
pub use secure_messaging::{SessionKeys, SmSession};
pub use security_info::SecurityInfoSet;

#[derive(Debug)]
#[non_exhaustive]
pub enum AuthError {
    RecvApduError(u8, u8),
    ParseMrzCharError(char),
    InvalidMrzInput(&'static str, String),
    ParseAsn1DataError(usize, usize),
    InvalidMacKeyError(usize, usize),
    ParseDataError(String),
    InvalidArgument(&'static str),
    InvalidResponseError(),
    OverflowSscError(),
    InvalidOidError(),
    UnsupportedAlgorithm(&'static str),
    ParseAsn1TagError(String, String),
    InvalidFileStructure(&'static str),
    TransportError(String),
    SecureMessagingError(&'static str),
    BacFailure(&'static str),
    PaceFailure(&'static str),
    ChipAuthFailure(&'static str),
    HashMismatchError(String),
    CertPathValidationError(String),
    SignatureVerificationError(&'static str),
    TrustStoreError(&'static str),
    CalculateHashError(&'static str),
    AuthenticationError,
    OpensslErrorStack(openssl::error::ErrorStack),
    RasnEncodeError(rasn::error::EncodeError),
    RasnDecodeError(rasn::error::DecodeError),
    PadError(cipher::inout::PadError),
    UnpadError(cipher::block_padding::UnpadError),
    IntCastError(TryFromIntError),
}
impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::RecvApduError(ref sw1, ref sw2) => write!(
                f,
                "APDU command failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::ParseMrzCharError(ref c) => {
                write!(f, "MRZ can not contain the character: {c}")
            }
            Self::InvalidMrzInput(mrz_field, ref value) => {
                write!(f, "MRZ field {mrz_field} is invalid: {value}")
            }
            Self::ParseAsn1DataError(ref e_len, ref f_len) => write!(
                f,
                "ASN.1 data is incomplete, expected len: {e_len}, found len: {f_len}"
            ),
            Self::InvalidMacKeyError(ref e_len, ref f_len) => write!(
                f,
                "Invalid MAC key, expected len: {e_len}, found len: {f_len}"
            ),
            Self::ParseDataError(ref error) => write!(f, "Invalid data length: {error}"),
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::InvalidResponseError() => {
                write!(f, "Card response is invalid")
            }
            Self::OverflowSscError() => write!(f, "SSC overflew error"),
            Self::InvalidOidError() => write!(f, "Invalid OID given"),
            Self::UnsupportedAlgorithm(error_msg) => {
                write!(f, "Unsupported algorithm: {error_msg}")
            }
            Self::ParseAsn1TagError(ref expected, ref found) => {
                write!(f, "Invalid ASN.1 tag, expected: {expected}, found: {found}")
            }
            Self::InvalidFileStructure(error_msg) => {
                write!(f, "Invalid EF structure: {error_msg}")
            }
            Self::TransportError(ref error_msg) => {
                write!(f, "Card transport failure: {error_msg}")
            }
            Self::SecureMessagingError(error_msg) => {
                write!(f, "Secure messaging failure: {error_msg}")
            }
            Self::BacFailure(error_msg) => {
                write!(f, "Basic Access Control failure: {error_msg}")
            }
            Self::PaceFailure(error_msg) => {
                write!(f, "PACE failure: {error_msg}")
            }
            Self::ChipAuthFailure(error_msg) => {
                write!(f, "Chip Authentication failure: {error_msg}")
            }
            Self::HashMismatchError(ref error_msg) => {
                write!(f, "Failure during comparison of hashes: {error_msg}")
            }
            Self::CertPathValidationError(ref error_msg) => {
                write!(f, "Certificate path validation failure: {error_msg}")
            }
            Self::SignatureVerificationError(error_msg) => {
                write!(f, "Signature verification failure: {error_msg}")
            }
            Self::TrustStoreError(error_msg) => {
                write!(f, "Trust store failure: {error_msg}")
            }
            Self::CalculateHashError(error_msg) => {
                write!(f, "Failure during calculation of hashes: {error_msg}")
            }
            Self::AuthenticationError => {
                write!(
                    f,
                    "No access control protocol could be established with the chip"
                )
            }
            Self::OpensslErrorStack(ref e) => fmt::Display::fmt(&e, f),
            Self::RasnEncodeError(ref e) => fmt::Display::fmt(&e, f),
            Self::RasnDecodeError(ref e) => fmt::Display::fmt(&e, f),
            Self::PadError(ref e) => fmt::Display::fmt(&e, f),
            Self::UnpadError(ref e) => fmt::Display::fmt(&e, f),
            Self::IntCastError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
// TODO, change to core::error soon, hopefully?
impl std::error::Error for AuthError {}

impl From<TransportError> for AuthError {
    fn from(err: TransportError) -> Self {
        Self::TransportError(err.0)
    }
}

impl From<openssl::error::ErrorStack> for AuthError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::OpensslErrorStack(err)
    }
}
