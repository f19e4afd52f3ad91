//! Basic Access Control (BAC).
//!
//! Derives document access keys from the MRZ, runs the challenge-response
//! with the chip and installs the resulting 3DES secure messaging session.
//! For more details and examples, see ICAO Doc 9303-11 Section 4.3 and
//! Appendix D.3
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use alloc::{vec, vec::Vec};
use constant_time_eq::constant_time_eq;
use rand::{CryptoRng, RngCore};
use tracing::{error, trace};

use crate::comms::PassportComms;
use crate::crypt::{
    compute_mac, decrypt_with, encrypt_with, generate_key_seed, padding_method_2, xor_slices,
    EncryptionAlgorithm, MacAlgorithm,
};
use crate::iso7816::{int2asn1len, CardTransceiver, APDU};
use crate::mrz::MrzKey;
use crate::secure_messaging::{SessionKeys, SmSession};
use crate::AuthError;

/// Runs BAC against the chip and installs the session keys on success.
///
/// # Errors
///
/// * `AuthError::BacFailure` if the chip fails the mutual authentication.
/// * `AuthError` on transport or cryptographic failures.
pub(crate) fn establish<T: CardTransceiver, R: RngCore + CryptoRng + Default>(
    comms: &mut PassportComms<T, R>,
    mrz_key: &MrzKey,
) -> Result<(), AuthError> {
    let secret = mrz_key.seed()?;
    let ba_key_seed = &generate_key_seed(secret.as_bytes())?[..16];

    // Calculate the basic access keys
    trace!("Computing basic access keys...");
    let ba_keys = SessionKeys::derive(ba_key_seed, EncryptionAlgorithm::DES3)?;

    // AUTHENTICATION AND ESTABLISHMENT OF SESSION KEYS
    trace!("Establishing session keys...");
    let apdu = APDU::new(
        b'\x00',
        b'\x84',
        b'\x00',
        b'\x00',
        None,
        None,
        Some(vec![b'\x08']),
    );
    let rnd_ic = match comms.send(&apdu, false) {
        Ok((rnd_ic, status)) => match status {
            [0x90, 0x00] => rnd_ic,
            [sw1, sw2] => {
                error!("Received invalid SW during GET CHALLENGE: {sw1:02X} {sw2:02X}");
                return Err(AuthError::RecvApduError(sw1, sw2));
            }
        },
        Err(err) => {
            error!("Error while establishing BAC session keys.");
            return Err(err);
        }
    };

    if rnd_ic.len() != 8 {
        error!(
            "GET CHALLENGE must return 8 bytes, found {}",
            rnd_ic.len()
        );
        return Err(AuthError::BacFailure(
            "GET CHALLENGE must return 8 bytes",
        ));
    }

    let mut rnd_ifd: [u8; 8] = [0; 8];
    comms.rng.fill_bytes(&mut rnd_ifd);
    let mut k_ifd: [u8; 16] = [0; 16];
    comms.rng.fill_bytes(&mut k_ifd);

    let e_ifd = encrypt_with(
        EncryptionAlgorithm::DES3,
        &ba_keys.ks_enc,
        Some(&[0; 8]),
        &[&rnd_ifd[..], (&*rnd_ic), &k_ifd[..]].concat(),
    )?;

    let m_ifd = compute_mac(
        &ba_keys.ks_mac,
        &padding_method_2(&e_ifd, 8)?,
        MacAlgorithm::DES,
    )?;
    let cmd_data = [&e_ifd, (&*m_ifd)].concat();

    let apdu = APDU::new(
        b'\x00',
        b'\x82',
        b'\x00',
        b'\x00',
        Some(int2asn1len(cmd_data.len())),
        Some(cmd_data),
        Some(vec![b'\x28']),
    );
    let resp_data_enc = match comms.send(&apdu, false) {
        Ok((resp_data_enc, status)) => match status {
            [0x90, 0x00] => resp_data_enc,
            [sw1, sw2] => {
                error!("Received invalid SW during EXTERNAL AUTHENTICATE: {sw1:02X} {sw2:02X}");
                return Err(AuthError::RecvApduError(sw1, sw2));
            }
        },
        Err(err) => {
            error!("Error while establishing BAC session keys.");
            return Err(err);
        }
    };

    if resp_data_enc.len() != 40 {
        error!(
            "EXTERNAL AUTHENTICATE must return 40 bytes, found {}",
            resp_data_enc.len()
        );
        return Err(AuthError::BacFailure(
            "EXTERNAL AUTHENTICATE must return 40 bytes",
        ));
    }

    let m_ic = compute_mac(
        &ba_keys.ks_mac,
        &padding_method_2(&resp_data_enc[..resp_data_enc.len() - 8], 8)?,
        MacAlgorithm::DES,
    )?;
    if !constant_time_eq(&m_ic, &resp_data_enc[resp_data_enc.len() - 8..]) {
        error!("EXTERNAL AUTHENTICATE response MAC verification failed");
        return Err(AuthError::BacFailure(
            "EXTERNAL AUTHENTICATE response MAC verification failed",
        ));
    }

    let resp_data = decrypt_with(
        EncryptionAlgorithm::DES3,
        &ba_keys.ks_enc,
        Some(&[0; 8]),
        &resp_data_enc[..resp_data_enc.len() - 8],
    )?;

    if !constant_time_eq(&resp_data[..8], &rnd_ic[..]) {
        error!("Chip did not echo its own challenge");
        return Err(AuthError::BacFailure(
            "Chip did not echo its own challenge",
        ));
    }

    if !constant_time_eq(&resp_data[8..16], &rnd_ifd[..]) {
        error!("Chip did not echo the terminal challenge");
        return Err(AuthError::BacFailure(
            "Chip did not echo the terminal challenge",
        ));
    }

    let k_ic: &[u8] = &resp_data[16..32];

    let ses_key_seed = xor_slices(&k_ifd, k_ic)?;

    let session_keys = SessionKeys::derive(&ses_key_seed, EncryptionAlgorithm::DES3)?;
    let ssc = [&rnd_ic[4..], &rnd_ifd[4..]].concat();

    comms.set_session(SmSession::new(EncryptionAlgorithm::DES3, session_keys, ssc)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockRng, ScriptedTransceiver};
    use hex_literal::hex;

    // Conversation from ICAO Doc 9303-11 Appendix D.3, with
    // RND.IFD = 781723860C06C226 and K.IFD = 0B795240CB7049B01C19B33E32804F0B
    // supplied by the fixed test RNG.
    fn appendix_d3_script() -> Vec<(&'static str, &'static str)> {
        vec![
            ("0084000008", "4608F91988702212 9000"),
            (
                "0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28",
                "46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D7449 9000",
            ),
        ]
    }

    #[test]
    fn test_establish_bac_session_keys() -> Result<(), AuthError> {
        let transceiver = ScriptedTransceiver::new(&appendix_d3_script());
        let mut comms: PassportComms<_, MockRng> = PassportComms::new(transceiver);
        let mrz_key = MrzKey::new("L898902C<", "690806", "940623")?;

        establish(&mut comms, &mrz_key)?;

        let session = comms.session.as_ref().expect("session must be installed");
        assert_eq!(session.ssc(), &hex!("887022120C06C226"));
        Ok(())
    }

    #[test]
    fn test_established_session_protects_commands() -> Result<(), AuthError> {
        // Continues into the Appendix D.4 secure Select EF.COM exchange
        let mut script = appendix_d3_script();
        script.push((
            "0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800",
            "990290008E08FA855A5D4C50A8ED 9000",
        ));
        let transceiver = ScriptedTransceiver::new(&script);
        let mut comms: PassportComms<_, MockRng> = PassportComms::new(transceiver);
        let mrz_key = MrzKey::new("L898902C<", "690806", "940623")?;

        establish(&mut comms, &mrz_key)?;
        comms.select_ef(b"\x01\x1E", "EF.COM", true)?;

        Ok(())
    }

    #[test]
    fn test_tampered_external_authenticate_response() -> Result<(), AuthError> {
        let transceiver = ScriptedTransceiver::new(&[
            ("0084000008", "4608F91988702212 9000"),
            (
                "0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28",
                "46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D744A 9000",
            ),
        ]);
        let mut comms: PassportComms<_, MockRng> = PassportComms::new(transceiver);
        let mrz_key = MrzKey::new("L898902C<", "690806", "940623")?;

        let result = establish(&mut comms, &mrz_key);
        assert!(result.is_err_and(|e| matches!(e, AuthError::BacFailure(_))));
        assert!(comms.session.is_none());
        Ok(())
    }

    #[test]
    fn test_wrong_mrz_key_fails_mutual_auth() -> Result<(), AuthError> {
        let transceiver = ScriptedTransceiver::new(&[("0084000008", "4608F91988702212 9000")]);
        let mut comms: PassportComms<_, MockRng> = PassportComms::new(transceiver);
        // Wrong document number, the encrypted challenge no longer matches the script
        let mrz_key = MrzKey::new("L898902C1", "690806", "940623")?;

        let result = establish(&mut comms, &mrz_key);
        assert!(result.is_err());
        assert!(comms.session.is_none());
        Ok(())
    }
}
