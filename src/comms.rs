//! Communication with the passport chip: plain and protected APDU exchange,
//! application and file selection, chunked elementary file reads.

use alloc::{vec, vec::Vec};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{error, info, trace};

use crate::crypt::bytes2hex;
use crate::iso7816::{int2asn1len, len2int, CardTransceiver, APDU};
use crate::secure_messaging::SmSession;
use crate::AuthError;

/// Application identifier of the eMRTD LDS1 applet.
pub(crate) const EMRTD_AID: &[u8] = b"\xA0\x00\x00\x02\x47\x10\x01";

/// A connection to a passport chip over a [`CardTransceiver`].
///
/// Carries the secure messaging session once an access control protocol
/// has established one. The RNG parameter exists so protocol tests can
/// replay the ICAO worked examples with fixed nonces.
pub struct PassportComms<T: CardTransceiver, R: RngCore + CryptoRng + Default = OsRng> {
    pub(crate) rng: R,
    /// The transport used for communication with the eMRTD.
    pub(crate) transceiver: T,
    /// The secure messaging session, `None` until BAC or PACE succeeds.
    pub(crate) session: Option<SmSession>,
}

impl<T: CardTransceiver, R: RngCore + CryptoRng + Default> PassportComms<T, R> {
    /// Constructs a new `PassportComms` instance over the given transport.
    #[must_use]
    pub fn new(transceiver: T) -> Self {
        Self {
            rng: R::default(),
            transceiver,
            session: None,
        }
    }

    /// Replaces the secure messaging session wholesale. PACE and Chip
    /// Authentication both restart the channel with fresh keys.
    pub(crate) fn set_session(&mut self, session: SmSession) {
        self.session = Some(session);
    }

    /// Sends an APDU (Application Protocol Data Unit) to the chip and receives the response.
    /// If `secure` is `false`, the APDU is sent in plaintext.
    /// If `secure` is `true`, the established secure messaging session protects
    /// the exchange.
    /// For more details and examples, see ICAO Doc 9303-11 Section 9.8 and Appendix D.4
    /// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
    ///
    /// # Errors
    ///
    /// * `AuthError` in case of failure during sending or receiving an APDU.
    pub fn send(&mut self, apdu: &APDU, secure: bool) -> Result<(Vec<u8>, [u8; 2]), AuthError> {
        // Sending APDU in plaintext
        if !secure {
            let apdu_bytes = apdu.to_bytes();

            trace!("Sending APDU: {}", bytes2hex(&apdu_bytes));
            let response = self.transceiver.transceive(&apdu_bytes)?;

            if response.len() < 2 {
                error!(
                    "Card response length should be greater than or equal to 2, found {}",
                    response.len()
                );
                return Err(AuthError::InvalidResponseError());
            }

            let status_bytes: [u8; 2] = [response[response.len() - 2], response[response.len() - 1]];
            let data = response[..response.len() - 2].to_vec();

            trace!(
                "APDU response ({:02X}{:02X}): {}",
                status_bytes[0],
                status_bytes[1],
                bytes2hex(&data)
            );

            return Ok((data, status_bytes));
        }

        let Some(session) = self.session.as_mut() else {
            error!("Secure messaging session is not established but trying to send securely");
            return Err(AuthError::InvalidArgument(
                "Secure messaging session is not established but trying to send securely",
            ));
        };

        let protected_apdu = session.wrap_command(apdu)?;

        trace!("Sending Protected APDU: {}", bytes2hex(&protected_apdu));
        let response = self.transceiver.transceive(&protected_apdu)?;

        if response.len() < 2 {
            error!(
                "Card response length should be greater than or equal to 2, found {}",
                response.len()
            );
            return Err(AuthError::InvalidResponseError());
        }

        let status_bytes: [u8; 2] = [response[response.len() - 2], response[response.len() - 1]];
        let data = session.unwrap_response(&response[..response.len() - 2])?;

        trace!(
            "APDU response ({:02X}{:02X}): {}",
            status_bytes[0],
            status_bytes[1],
            bytes2hex(&data)
        );

        Ok((data, status_bytes))
    }

    /// Selects the eMRTD application on the card.
    ///
    /// This function sends a command to select the eMRTD application using AID `A0000002471001`.
    /// After PACE the selection must already go through the secure channel.
    ///
    /// # Errors
    ///
    /// `AuthError` in case of failure during sending the APDU.
    pub fn select_application(&mut self, secure: bool) -> Result<(), AuthError> {
        info!(
            "Selecting eMRTD Application `International AID`: {}...",
            bytes2hex(EMRTD_AID)
        );
        let apdu = APDU::new(
            b'\x00',
            b'\xA4',
            b'\x04',
            b'\x0C',
            Some(int2asn1len(EMRTD_AID.len())),
            Some(EMRTD_AID.to_vec()),
            None,
        );
        match self.send(&apdu, secure) {
            Ok((_, status)) => match status {
                [0x90, 0x00] => Ok(()),
                [sw1, sw2] => {
                    error!("Received invalid SW during Select eMRTD Application command: {sw1:02X} {sw2:02X}");
                    Err(AuthError::RecvApduError(sw1, sw2))
                }
            },
            Err(err) => {
                error!("Error while selecting eMRTD Application.");
                Err(err)
            }
        }
    }

    /// Selects a specific Elementary File (EF) on the chip by sending a "Select File" APDU.
    ///
    /// # Arguments
    ///
    /// * `fid` - Array representing the File Identifier (FID) of the EF to select.
    /// * `fname` - The name of the file being selected (used for logging purposes).
    /// * `secure` - Whether the command goes through the secure channel.
    ///
    /// # Errors
    ///
    /// * `AuthError` in case of failure during sending the APDU.
    pub fn select_ef(&mut self, fid: &[u8; 2], fname: &str, secure: bool) -> Result<(), AuthError> {
        trace!("Selecting File {fname}: {}...", bytes2hex(fid));
        let apdu = APDU::new(
            b'\x00',
            b'\xA4',
            b'\x02',
            b'\x0C',
            Some(int2asn1len(fid.len())),
            Some(fid.to_vec()),
            None,
        );
        match self.send(&apdu, secure) {
            Ok((_, status)) => match status {
                [0x90, 0x00] => Ok(()),
                [sw1, sw2] => {
                    error!("Received invalid SW during Select EF command: {sw1:02X} {sw2:02X}");
                    Err(AuthError::RecvApduError(sw1, sw2))
                }
            },
            Err(err) => {
                error!("Error while selecting an EF.");
                Err(err)
            }
        }
    }

    /// Reads data from an EF (Elementary File) of the chip.
    ///
    /// This function sends APDU (Application Protocol Data Unit) commands to read the data from the EF.
    /// It starts by reading the first four bytes of the file, then determines the total length of the file.
    /// Afterward, it reads the rest of the bytes in chunks until it reaches the end of the file.
    /// `select_ef` function must be called before calling this function.
    ///
    /// # Errors
    ///
    /// * `AuthError` in case of failure.
    pub fn read_data_from_ef(&mut self, secure: bool) -> Result<Vec<u8>, AuthError> {
        // Read Binary of first four bytes
        let apdu = APDU::new(
            b'\x00',
            b'\xB0',
            b'\x00',
            b'\x00',
            None,
            None,
            Some(vec![b'\x04']),
        );
        trace!("Reading first 4 bytes from EF...");
        let mut data = match self.send(&apdu, secure) {
            Ok((data, status)) => match status {
                [0x90, 0x00] => data,
                [sw1, sw2] => {
                    error!("Received invalid SW during reading first 4 bytes of EF: {sw1:02X} {sw2:02X}");
                    return Err(AuthError::RecvApduError(sw1, sw2));
                }
            },
            Err(err) => {
                error!("Error while reading 4 bytes from EF.");
                return Err(err);
            }
        };

        if data.len() != 4 {
            error!(
                "Card response length should be equal to the requested amount 4, found {}",
                data.len()
            );
            return Err(AuthError::InvalidResponseError());
        }

        let data_len;
        {
            let (tl, v) = len2int(&data, 1)?;
            data_len = tl + v;
        };

        let mut offset = 4;

        // Read the rest of the bytes
        trace!("Reading {data_len} bytes from EF...");
        while offset < data_len {
            let le = if data_len - offset < 0xFA {
                [u8::try_from((data_len - offset) & 0xFF).map_err(AuthError::IntCastError)?]
            } else {
                [0x00]
            };

            // Send "Read Binary" APDU for the next chunk
            let offset_bytes = [
                u8::try_from(offset >> 8).map_err(AuthError::IntCastError)?,
                u8::try_from(offset & 0xFF).map_err(AuthError::IntCastError)?,
            ];
            let read_apdu = APDU::new(
                b'\x00',
                b'\xB0',
                offset_bytes[0],
                offset_bytes[1],
                None,
                None,
                Some(vec![le[0]]),
            );
            trace!("Reading next {} bytes from EF...", data_len - offset);
            let data_read = match self.send(&read_apdu, secure) {
                Ok((data, status)) => match status {
                    [0x90, 0x00] => data,
                    [sw1, sw2] => {
                        error!("Received invalid SW during reading bytes {} of EF: {sw1:02X} {sw2:02X}", data_len - offset);
                        return Err(AuthError::RecvApduError(sw1, sw2));
                    }
                },
                Err(err) => {
                    error!("Error while reading bytes from EF.");
                    return Err(err);
                }
            };

            if data_read.is_empty() {
                error!("Requested bytes while reading EF but received 0 bytes.");
                return Err(AuthError::InvalidResponseError());
            }

            // Append the new data to the result
            data.extend_from_slice(&data_read);
            offset += data_read.len();
        }

        if offset != data_len {
            error!(
                "Error while parsing EF data from the card, expected {offset}, found {data_len}."
            );
            return Err(AuthError::InvalidResponseError());
        }

        Ok(data)
    }
}
