//! Password Authenticated Connection Establishment (PACE), Generic Mapping.
//!
//! The protocol runs in four GENERAL AUTHENTICATE steps after the MSE:SET AT
//! selection: encrypted nonce, mapping key exchange, ephemeral key exchange
//! and mutual token authentication. See ICAO Doc 9303-11 Section 4.4 and
//! Appendix G
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use alloc::{vec, vec::Vec};
use constant_time_eq::constant_time_eq;
use openssl::bn::BigNum;
use rand::{CryptoRng, RngCore};
use rasn::{der, types::Integer};
use tracing::{error, trace};

use crate::comms::PassportComms;
use crate::crypt::{
    compute_key, compute_mac, decrypt_with, generate_key_seed, padding_method_2, KeyType,
};
use crate::iso7816::{get_asn1_child, int2asn1len, validate_asn1_tag, CardTransceiver, APDU};
use crate::kex::KeyAgreement;
use crate::mrz::MrzKey;
use crate::secure_messaging::{SessionKeys, SmSession};
use crate::security_info::{security_infos::PaceInfo, standard_parameter_id, PaceProtocol, SecurityInfoSet};
use crate::AuthError;

/// Runs PACE with the MRZ password and installs the session keys on success.
///
/// # Errors
///
/// * `AuthError::PaceFailure` if the chip fails the mutual authentication.
/// * `AuthError::UnsupportedAlgorithm` if the chip only offers protocols or
///   domain parameters outside the Generic Mapping set.
/// * `AuthError` on transport or cryptographic failures.
pub(crate) fn establish<T: CardTransceiver, R: RngCore + CryptoRng + Default>(
    comms: &mut PassportComms<T, R>,
    security_info_set: &SecurityInfoSet,
    mrz_key: &MrzKey,
) -> Result<(), AuthError> {
    let (pace_info, protocol) = select_protocol(security_info_set)?;

    if pace_info.version.ne(&Integer::from(2)) {
        error!("PACEInfo version must be 2");
        return Err(AuthError::PaceFailure("PACEInfo version must be 2"));
    }

    let Some(parameter_id) = pace_info
        .parameter_id
        .as_ref()
        .and_then(standard_parameter_id)
    else {
        error!("PACEInfo must name standardized domain parameters");
        return Err(AuthError::UnsupportedAlgorithm(
            "PACEInfo must name standardized domain parameters",
        ));
    };

    let kex = KeyAgreement::from_parameters(protocol.key_agreement, parameter_id)?;

    // Password key K_pi from the full SHA-1 of the MRZ information,
    // ICAO Doc 9303-11 Section 9.7.3
    let secret = mrz_key.seed()?;
    let key_seed = generate_key_seed(secret.as_bytes())?;
    let k_pi = compute_key(&key_seed, KeyType::PacePassword, protocol.cipher)?;

    // MSE:SET AT selects the protocol (DO 80) and the MRZ password (DO 83)
    trace!("Selecting PACE protocol with MSE:SET AT...");
    let oid_der = der::encode(&pace_info.protocol).map_err(AuthError::RasnEncodeError)?;
    let oid_content = strip_oid_header(&oid_der)?;
    let mut mse_data = vec![0x80];
    mse_data.extend(int2asn1len(oid_content.len()));
    mse_data.extend_from_slice(oid_content);
    mse_data.extend_from_slice(&[0x83, 0x01, 0x01]);

    let apdu = APDU::new(
        b'\x00',
        b'\x22',
        b'\xC1',
        b'\xA4',
        Some(int2asn1len(mse_data.len())),
        Some(mse_data),
        None,
    );
    match comms.send(&apdu, false) {
        Ok((_, [0x90, 0x00])) => {}
        Ok((_, [sw1, sw2])) => {
            error!("Received invalid SW during PACE MSE:SET AT: {sw1:02X} {sw2:02X}");
            return Err(AuthError::RecvApduError(sw1, sw2));
        }
        Err(err) => {
            error!("Error while selecting the PACE protocol.");
            return Err(err);
        }
    }

    // Step 1: encrypted nonce, decrypted with K_pi and a zero IV
    trace!("Requesting the encrypted PACE nonce...");
    let encrypted_nonce = general_authenticate(comms, true, &[], 0x80)?;
    if encrypted_nonce.is_empty() || encrypted_nonce.len() % protocol.cipher.pad_len() != 0 {
        error!("Encrypted PACE nonce has an invalid length");
        return Err(AuthError::PaceFailure(
            "Encrypted PACE nonce has an invalid length",
        ));
    }
    let zero_iv = vec![0; protocol.cipher.pad_len()];
    let nonce_bytes = decrypt_with(protocol.cipher, &k_pi, Some(&zero_iv), &encrypted_nonce)?;
    let nonce = BigNum::from_slice(&nonce_bytes)?;

    // Step 2: mapping key exchange, then generic mapping of the generator
    trace!("Exchanging PACE mapping public keys...");
    let derivation = kex.generate_keypair()?;
    let mut mapping_data = vec![0x81];
    mapping_data.extend(int2asn1len(derivation.public.len()));
    mapping_data.extend_from_slice(&derivation.public);
    let chip_mapping_public = general_authenticate(comms, true, &mapping_data, 0x82)?;

    let mapped = kex.map_generator(&nonce, &derivation.private, &chip_mapping_public)?;

    // Step 3: ephemeral key exchange on the mapped domain parameters
    trace!("Exchanging PACE ephemeral public keys...");
    let ephemeral = mapped.generate_keypair()?;
    let mut ephemeral_data = vec![0x83];
    ephemeral_data.extend(int2asn1len(ephemeral.public.len()));
    ephemeral_data.extend_from_slice(&ephemeral.public);
    let chip_ephemeral_public = general_authenticate(comms, true, &ephemeral_data, 0x84)?;

    if ephemeral.public == chip_ephemeral_public {
        error!("Terminal and chip ephemeral PACE keys are equal");
        return Err(AuthError::PaceFailure(
            "Terminal and chip ephemeral PACE keys are equal",
        ));
    }

    let shared_secret = mapped.shared_secret(&ephemeral.private, &chip_ephemeral_public)?;
    let session_keys = SessionKeys::derive(&shared_secret, protocol.cipher)?;

    // Step 4: mutual authentication tokens over the 7F49 templates
    trace!("Performing PACE mutual authentication...");
    let t_ifd = authentication_token(
        &session_keys,
        protocol,
        oid_content,
        mapped.public_key_do_tag(),
        &chip_ephemeral_public,
    )?;
    let expected_t_ic = authentication_token(
        &session_keys,
        protocol,
        oid_content,
        mapped.public_key_do_tag(),
        &ephemeral.public,
    )?;

    let mut token_data = vec![0x85];
    token_data.extend(int2asn1len(t_ifd.len()));
    token_data.extend_from_slice(&t_ifd);
    let t_ic = general_authenticate(comms, false, &token_data, 0x86)?;

    if !constant_time_eq(&t_ic, &expected_t_ic) {
        error!("PACE mutual authentication failed");
        return Err(AuthError::PaceFailure("PACE mutual authentication failed"));
    }

    // The SSC starts at zero for a PACE session
    comms.set_session(SmSession::new(
        protocol.cipher,
        session_keys,
        vec![0; protocol.cipher.pad_len()],
    )?);

    Ok(())
}

/// Picks the first PACEInfo with a supported Generic Mapping protocol.
fn select_protocol(
    security_info_set: &SecurityInfoSet,
) -> Result<(&PaceInfo, PaceProtocol), AuthError> {
    let mut unsupported = None;
    for pace_info in &security_info_set.pace_infos {
        match PaceProtocol::from_oid(&pace_info.protocol) {
            Ok(protocol) => return Ok((pace_info, protocol)),
            Err(err) => unsupported = Some(err),
        }
    }
    match unsupported {
        Some(err) => Err(err),
        None => {
            error!("Chip does not advertise PACE");
            Err(AuthError::PaceFailure("Chip does not advertise PACE"))
        }
    }
}

/// Sends one GENERAL AUTHENTICATE step, the dynamic authentication data
/// wrapped in a `7C` template, and extracts the response object with the
/// expected tag. All steps except the last are command chained (CLA `10`).
fn general_authenticate<T: CardTransceiver, R: RngCore + CryptoRng + Default>(
    comms: &mut PassportComms<T, R>,
    chained: bool,
    inner: &[u8],
    expected_tag: u8,
) -> Result<Vec<u8>, AuthError> {
    let mut cdata = vec![0x7C];
    cdata.extend(int2asn1len(inner.len()));
    cdata.extend_from_slice(inner);

    let apdu = APDU::new(
        if chained { b'\x10' } else { b'\x00' },
        b'\x86',
        b'\x00',
        b'\x00',
        Some(int2asn1len(cdata.len())),
        Some(cdata),
        Some(vec![b'\x00']),
    );
    let response = match comms.send(&apdu, false) {
        Ok((response, [0x90, 0x00])) => response,
        Ok((_, [sw1, sw2])) => {
            error!("Received invalid SW during GENERAL AUTHENTICATE: {sw1:02X} {sw2:02X}");
            return Err(AuthError::RecvApduError(sw1, sw2));
        }
        Err(err) => {
            error!("Error during GENERAL AUTHENTICATE.");
            return Err(err);
        }
    };

    validate_asn1_tag(&response, b"\x7C")?;
    let (dynamic_data, _) = get_asn1_child(&response, 1)?;
    validate_asn1_tag(dynamic_data, &[expected_tag])?;
    let (value, _) = get_asn1_child(dynamic_data, 1)?;
    Ok(value.to_vec())
}

/// Computes an authentication token: the MAC over the padded public key
/// template `7F49 { 06 protocol, 84/86 public key }`.
fn authentication_token(
    session_keys: &SessionKeys,
    protocol: PaceProtocol,
    oid_content: &[u8],
    public_key_tag: u8,
    public_key: &[u8],
) -> Result<Vec<u8>, AuthError> {
    let mut inner = vec![0x06];
    inner.extend(int2asn1len(oid_content.len()));
    inner.extend_from_slice(oid_content);
    inner.push(public_key_tag);
    inner.extend(int2asn1len(public_key.len()));
    inner.extend_from_slice(public_key);

    let mut template = vec![0x7F, 0x49];
    template.extend(int2asn1len(inner.len()));
    template.extend(inner);

    compute_mac(
        &session_keys.ks_mac,
        &padding_method_2(&template, protocol.cipher.pad_len())?,
        protocol.cipher.mac_algorithm(),
    )
}

/// Strips the `06 LL` header off a DER-encoded object identifier.
fn strip_oid_header(oid_der: &[u8]) -> Result<&[u8], AuthError> {
    validate_asn1_tag(oid_der, b"\x06")?;
    let (content, _) = get_asn1_child(oid_der, 1)?;
    Ok(content)
}
