//! ISO/IEC 7816-4 command structures, the transport abstraction and the
//! small TLV helpers used for elementary file parsing.

use alloc::{string::String, vec, vec::Vec};
use core::{fmt, mem};
use tracing::error;

use crate::{bytes2hex, AuthError};

/// Failure reported by the card transport. Always fatal: the engine gives up
/// on the chip when the reader link breaks.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Card transport failure: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Byte-level channel to the chip.
///
/// Implementors forward a raw command APDU to the contactless (or contact)
/// interface and return the full response including the trailing status
/// words. The engine never talks to a reader directly, it only goes through
/// this trait.
pub trait CardTransceiver {
    /// Sends a command APDU and returns the response APDU.
    ///
    /// # Errors
    ///
    /// * `TransportError` if the exchange fails at the transport level.
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// An Application Protocol Data Unit (APDU) used in smart card communication.
#[derive(Debug, Clone)]
pub struct APDU {
    /// Class byte of the APDU
    pub(crate) cla: u8,
    /// Instruction byte of the APDU
    pub(crate) ins: u8,
    /// Parameter 1 byte of the APDU
    pub(crate) p1: u8,
    /// Parameter 2 byte of the APDU
    pub(crate) p2: u8,
    /// Length of the command data field (Lc) in the APDU
    pub(crate) lc: Option<Vec<u8>>,
    /// Command data field of the APDU
    pub(crate) cdata: Option<Vec<u8>>,
    /// Expected length of the response data field (Le) in the APDU
    pub(crate) le: Option<Vec<u8>>,
}

impl APDU {
    /// Constructs a new APDU instance with the specified parameters.
    ///
    /// # Panics
    ///
    /// Panics if the lengths of `lc` and `le` violate ISO/IEC 7816-4 specifications.
    /// See the wiki article for more details:
    /// <https://en.wikipedia.org/wiki/Smart_card_application_protocol_data_unit>
    ///
    /// # Example
    ///
    /// ```
    /// # use mrtd_auth::AuthError;
    /// #
    /// # fn main() -> Result<(), AuthError> {
    /// use mrtd_auth::APDU;
    /// let apdu = APDU::new(b'\x00', b'\x84', b'\x00', b'\x00', None, None, Some(vec![b'\x08']));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        lc: Option<Vec<u8>>,
        cdata: Option<Vec<u8>>,
        le: Option<Vec<u8>>,
    ) -> Self {
        match (lc.as_ref().map(Vec::len), le.as_ref().map(Vec::len)) {
            (None | Some(1 | 3), None)
            | (None | Some(1), Some(1))
            | (Some(3), Some(2))
            | (None, Some(3)) => { /* Valid */ }
            (_, _) => {
                panic!("lc and le length error");
            }
        }

        Self {
            cla,
            ins,
            p1,
            p2,
            lc,
            cdata,
            le,
        }
    }

    /// Retrieves the command header of the APDU.
    ///
    /// The command header consists of the class byte, instruction byte,
    /// parameter 1 byte, and parameter 2 byte of the APDU.
    ///
    /// # Examples
    ///
    /// ```
    /// # use mrtd_auth::AuthError;
    /// #
    /// # fn main() -> Result<(), AuthError> {
    /// use mrtd_auth::APDU;
    /// use hex_literal::hex;
    ///
    /// let apdu = APDU::new(b'\x00', b'\x84', b'\x00', b'\x00', None, None, Some(vec![b'\x08']));
    /// assert_eq!(apdu.get_command_header(), hex!("00840000"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn get_command_header(&self) -> Vec<u8> {
        vec![self.cla, self.ins, self.p1, self.p2]
    }

    /// Serializes the APDU into the raw command bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.get_command_header();
        if let Some(lc) = &self.lc {
            bytes.extend_from_slice(lc);
        }
        if let Some(cdata) = &self.cdata {
            bytes.extend_from_slice(cdata);
        }
        if let Some(le) = &self.le {
            bytes.extend_from_slice(le);
        }
        bytes
    }
}

/// Parses the ASN.1 length field.
///
/// ASN.1 length encoding can use a single byte for short lengths (up to 127) or multiple bytes
/// for longer lengths.
///
/// # Arguments
///
/// * `data` - The ASN.1 data.
/// * `tag_len` - Length of ASN.1 tag (T of TLV).
///
/// # Returns
///
/// Result containing a tuple with the start index and length field value, or an `AuthError`.
///
/// For example, if `tag_len` is 3 and the length field is a single byte with value 42,
/// the returned value will be (4, 42).
///
/// If `tag_len` is 3 and the length field is 3 bytes long with value 2024,
/// the returned value will be (6, 2024).
///
/// # Errors
///
/// * `AuthError` if the input is incomplete, i.e. if the data is too short to read the length value.
pub(crate) fn len2int(data: &[u8], tag_len: usize) -> Result<(usize, usize), AuthError> {
    if data.len() < tag_len + 1 {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len`: `{}`",
            data.len(),
            tag_len
        );
        return Err(AuthError::ParseAsn1DataError(tag_len + 1, data.len()));
    }

    if data[tag_len] & 0x80 == 0 {
        Ok((tag_len + 1, data[tag_len] as usize))
    } else {
        let length_of_length = ((1 << 7) ^ data[tag_len]) as usize;

        if data.len() < tag_len + 1 + length_of_length {
            error!("Error during len2int, `data.len()`: `{}` is less than `tag_len + 1 + length_of_length`: `{}`", data.len(), tag_len + 1 + length_of_length);
            return Err(AuthError::ParseAsn1DataError(
                tag_len + 1 + length_of_length,
                data.len(),
            ));
        }

        let mut buf = [0_u8; mem::size_of::<usize>()];
        buf[mem::size_of::<usize>() - length_of_length..]
            .copy_from_slice(&data[tag_len + 1..tag_len + 1 + length_of_length]);

        Ok((tag_len + 1 + length_of_length, usize::from_be_bytes(buf)))
    }
}

/// Encodes the length field in ASN.1 format.
///
/// If the length is less than 128, a single octet is used to represent the length.
/// Otherwise, the long form is used, where the first octet specifies the number of
/// octets used for the length, followed by the length encoded in big-endian order.
///
/// # Panics
/// Should not panic.
pub(crate) fn int2asn1len(length: usize) -> Vec<u8> {
    if length < 128 {
        vec![u8::try_from(length).expect("`length` is less than 128")]
    } else {
        let mut length_bytes: Vec<u8> = Vec::new();
        let mut len = length;

        let mut octet_count: u8 = 0;
        while len > 0 {
            octet_count += 1;
            len >>= 8;
        }
        length_bytes.push(0x80 | octet_count);
        for i in (0..octet_count).rev() {
            let masked_bits = (length >> (8 * i)) & 0xFF;
            length_bytes
                .push(u8::try_from(masked_bits).expect("Bits are masked, must fit in a u8"));
        }
        length_bytes
    }
}

/// Validates that the data starts with the expected ASN.1 tag.
///
/// # Errors
///
/// * `AuthError` if the data is too short or the tag does not match.
pub(crate) fn validate_asn1_tag(data: &[u8], tag: &[u8]) -> Result<(), AuthError> {
    data.get(..tag.len()).map_or_else(
        || {
            error!(
            "Error while validating ASN1 tag, `data.len()`: `{}` is less than `tag.len()`: `{}`",
            data.len(),
            tag.len()
        );
            Err(AuthError::ParseAsn1DataError(tag.len(), data.len()))
        },
        |d| {
            if d.starts_with(tag) {
                Ok(())
            } else {
                error!(
                    "Error while validating ASN1 tag, expected: {}, found {}",
                    bytes2hex(tag),
                    bytes2hex(d)
                );
                Err(AuthError::ParseAsn1TagError(bytes2hex(tag), bytes2hex(d)))
            }
        },
    )
}

/// Retrieve the ASN.1 child from the provided data.
///
/// Returns the child element and the remaining data after it.
///
/// # Errors
///
/// * `AuthError` if the data is incomplete.
pub(crate) fn get_asn1_child(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8]), AuthError> {
    if data.len() < tag_len {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tag_len`: `{}`",
            data.len(),
            tag_len
        );
        return Err(AuthError::ParseAsn1DataError(tag_len, data.len()));
    }

    let (tl, v) = len2int(data, tag_len)?;
    if data.len() < tl + v {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tl + v`: `{}`",
            data.len(),
            tl + v
        );
        return Err(AuthError::ParseAsn1DataError(tl + v, data.len()));
    }
    Ok((&data[tl..tl + v], &data[tl + v..]))
}
