//! Test doubles shared across the protocol tests: a deterministic RNG, a
//! scripted transceiver for replaying the ICAO worked examples, a software
//! passport chip and a throwaway PKI for Passive Authentication fixtures.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::{format, string::String, vec, vec::Vec};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage};
use openssl::x509::{X509NameBuilder, X509};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use rasn::der;
use rasn::types::{Any, Integer, ObjectIdentifier, OctetString};
use rasn_cms::{
    Attribute, CertificateChoices, ContentInfo, EncapsulatedContentInfo, IssuerAndSerialNumber,
    SignedData, SignerIdentifier, SignerInfo,
};
use rasn_cms::AlgorithmIdentifier;
use rasn_pkix::Certificate;

use crate::crypt::{
    bytes2hex, compute_key, compute_mac, decrypt_with, encrypt_ecb_with, encrypt_with,
    generate_key_seed, padding_method_2, remove_padding, xor_slices, EncryptionAlgorithm, KeyType,
    MacAlgorithm,
};
use crate::iso7816::{
    get_asn1_child, int2asn1len, len2int, validate_asn1_tag, CardTransceiver, TransportError,
};
use crate::kex::{ecdh_shared_secret, KeyAgreement, KeyPair};
use crate::mrz::MrzKey;
use crate::passive_auth::csca_master_list::CscaMasterList;
use crate::passive_auth::lds_security_object::{DataGroupHash, LDSSecurityObject};
use crate::secure_messaging::{increment_ssc_bytes, SessionKeys};
use crate::security_info::security_infos::{
    ChipAuthenticationInfo, ChipAuthenticationPublicKeyInfo, PaceInfo,
};
use crate::security_info::KeyAgreementAlgorithm;
use crate::AuthError;

/// RND.IFD and K.IFD from the ICAO Doc 9303-11 Appendix D.3 worked example,
/// served in order and cycled.
pub(crate) struct MockRng {
    data: Vec<u8>,
    index: usize,
}

impl Default for MockRng {
    fn default() -> Self {
        Self {
            data: parse_hex("781723860C06C226 0B795240CB7049B0 1C19B33E32804F0B"),
            index: 0,
        }
    }
}

impl RngCore for MockRng {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0; 4];
        self.fill_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0; 8];
        self.fill_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.data[self.index % self.data.len()];
            self.index += 1;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for MockRng {}

/// Parses hex, ignoring whitespace. Test fixtures only.
pub(crate) fn parse_hex(hex: &str) -> Vec<u8> {
    let clean: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    assert!(clean.len() % 2 == 0, "odd length hex string: {hex}");
    (0..clean.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).expect("valid hex"))
        .collect()
}

/// Replays a fixed (command, response) conversation, failing the transport
/// on any deviation from the script.
pub(crate) struct ScriptedTransceiver {
    script: Vec<(Vec<u8>, Vec<u8>)>,
    cursor: usize,
}

impl ScriptedTransceiver {
    pub(crate) fn new(script: &[(&str, &str)]) -> Self {
        Self {
            script: script
                .iter()
                .map(|(command, response)| (parse_hex(command), parse_hex(response)))
                .collect(),
            cursor: 0,
        }
    }
}

impl CardTransceiver for ScriptedTransceiver {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let Some((expected, response)) = self.script.get(self.cursor) else {
            return Err(TransportError(format!(
                "scripted conversation exhausted, got: {}",
                bytes2hex(command)
            )));
        };
        if command != expected.as_slice() {
            return Err(TransportError(format!(
                "unexpected command, expected: {}, got: {}",
                bytes2hex(expected),
                bytes2hex(command)
            )));
        }
        self.cursor += 1;
        Ok(response.clone())
    }
}

/// Builds a TLV with a single-byte tag.
fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(int2asn1len(content.len()));
    out.extend_from_slice(content);
    out
}

fn oid(arcs: &[u32]) -> ObjectIdentifier {
    ObjectIdentifier::new(arcs.to_vec()).expect("valid OID arcs")
}

/// Chip-side secure messaging state, the mirror image of `SmSession`.
struct ChipSm {
    enc_alg: EncryptionAlgorithm,
    keys: SessionKeys,
    ssc: Vec<u8>,
}

impl ChipSm {
    fn new(enc_alg: EncryptionAlgorithm, keys: SessionKeys, ssc: Vec<u8>) -> Self {
        Self { enc_alg, keys, ssc }
    }

    fn block_iv(&self) -> Result<Vec<u8>, AuthError> {
        match self.enc_alg {
            EncryptionAlgorithm::DES3 => Ok(vec![0; 8]),
            _ => encrypt_ecb_with(self.enc_alg, &self.keys.ks_enc, &self.ssc),
        }
    }

    /// Verifies and decrypts a protected command.
    ///
    /// Returns the command header, the decrypted command data and the
    /// requested response length from the DO'97'.
    fn unwrap_command(
        &mut self,
        command: &[u8],
    ) -> Result<([u8; 4], Vec<u8>, Option<usize>), AuthError> {
        increment_ssc_bytes(&mut self.ssc)?;

        if command.len() < 5 {
            return Err(AuthError::InvalidResponseError());
        }
        let header = [command[0], command[1], command[2], command[3]];
        let lc = command[4] as usize;
        if command.len() < 5 + lc {
            return Err(AuthError::InvalidResponseError());
        }
        let body = &command[5..5 + lc];

        let mut encrypted: Option<Vec<u8>> = None;
        let mut with_indicator = false;
        let mut le = None;
        let mut mac: Option<&[u8]> = None;
        let mut mac_end = 0;

        let mut rest = body;
        while !rest.is_empty() {
            let (tl_len, value_len) = len2int(rest, 1)?;
            if rest.len() < tl_len + value_len {
                return Err(AuthError::ParseAsn1DataError(tl_len + value_len, rest.len()));
            }
            let value = &rest[tl_len..tl_len + value_len];
            match rest[0] {
                0x85 => encrypted = Some(value.to_vec()),
                0x87 => {
                    encrypted = Some(value.to_vec());
                    with_indicator = true;
                }
                0x97 => {
                    le = Some(match value.first() {
                        Some(0) | None => 256,
                        Some(&b) => b as usize,
                    });
                }
                0x8E => {
                    mac = Some(value);
                    mac_end = body.len() - rest.len();
                }
                _ => return Err(AuthError::InvalidResponseError()),
            }
            rest = &rest[tl_len + value_len..];
        }

        let Some(mac) = mac else {
            return Err(AuthError::SecureMessagingError("C_APDU carries no DO8E"));
        };
        let pad_len = self.enc_alg.pad_len();
        let padded_header = padding_method_2(&header, pad_len)?;
        let n = padding_method_2(
            &[&self.ssc[..], &padded_header, &body[..mac_end]].concat(),
            pad_len,
        )?;
        let cc = compute_mac(&self.keys.ks_mac, &n, self.enc_alg.mac_algorithm())?;
        if cc != mac {
            return Err(AuthError::SecureMessagingError(
                "C_APDU MAC verification failed",
            ));
        }

        let data = match encrypted {
            Some(mut encrypted) => {
                if with_indicator {
                    if encrypted.first() != Some(&0x01) {
                        return Err(AuthError::SecureMessagingError(
                            "DO87 padding indicator must be 01",
                        ));
                    }
                    encrypted.remove(0);
                }
                let iv = self.block_iv()?;
                let decrypted =
                    decrypt_with(self.enc_alg, &self.keys.ks_enc, Some(&iv), &encrypted)?;
                remove_padding(&decrypted).to_vec()
            }
            None => Vec::new(),
        };

        Ok((header, data, le))
    }

    /// Protects a response: DO'87' when there is data, DO'99' with the
    /// status words, DO'8E' checksum. The status trailer is not included.
    fn wrap_response(&mut self, data: &[u8], status: [u8; 2]) -> Result<Vec<u8>, AuthError> {
        increment_ssc_bytes(&mut self.ssc)?;

        let mut payload = Vec::new();
        if !data.is_empty() {
            let iv = self.block_iv()?;
            let padded = padding_method_2(data, self.enc_alg.pad_len())?;
            let encrypted = encrypt_with(self.enc_alg, &self.keys.ks_enc, Some(&iv), &padded)?;
            let do87_value = [&b"\x01"[..], &encrypted].concat();
            payload.extend(tlv(0x87, &do87_value));
        }
        payload.extend_from_slice(&[0x99, 0x02, status[0], status[1]]);

        let k = padding_method_2(
            &[&self.ssc[..], &payload].concat(),
            self.enc_alg.pad_len(),
        )?;
        let cc = compute_mac(&self.keys.ks_mac, &k, self.enc_alg.mac_algorithm())?;
        payload.extend(tlv(0x8E, &cc));
        Ok(payload)
    }
}

/// Chip state while a PACE handshake is in flight.
struct PaceState {
    step: u8,
    nonce: BigNum,
    base: KeyAgreement,
    mapped: Option<KeyAgreement>,
    ephemeral: Option<KeyPair>,
    terminal_ephemeral: Option<Vec<u8>>,
    keys: Option<SessionKeys>,
}

/// DER content octets of id-PACE-ECDH-GM-AES-CBC-CMAC-128, the only PACE
/// profile the mock chip speaks (standardized parameters 12, P-256).
const PACE_OID_CONTENT: &[u8] = b"\x04\x00\x7F\x00\x07\x02\x02\x04\x02\x02";

/// RND.IC and K.IC from ICAO Doc 9303-11 Appendix D.3, so a BAC handshake
/// against a `MockRng` terminal replays the worked example bit for bit.
const BAC_RND_IC: &str = "4608F91988702212";
const BAC_K_IC: &str = "0B4F80323EB3191CB04970CB4052790B";

/// A software passport chip.
///
/// Speaks BAC out of the box; `with_pace` and `with_chip_auth` enable the
/// respective protocols and install the matching files. File contents are
/// deterministic so tests can build a SOD over them.
pub(crate) struct MockChip {
    ba_keys: SessionKeys,
    k_pi: Vec<u8>,
    pace_supported: bool,
    ca_key: Option<EcKey<Private>>,
    files: BTreeMap<u16, Vec<u8>>,
    selected: Option<u16>,
    rnd_ic: Option<Vec<u8>>,
    pace: Option<PaceState>,
    ca_pending: bool,
    session: Option<ChipSm>,
    pending_session: Option<ChipSm>,
}

impl MockChip {
    pub(crate) fn new(mrz_key: &MrzKey) -> Result<Self, AuthError> {
        let secret = mrz_key.seed()?;
        let key_seed = generate_key_seed(secret.as_bytes())?;
        let ba_keys = SessionKeys::derive(&key_seed[..16], EncryptionAlgorithm::DES3)?;
        let k_pi = compute_key(&key_seed, KeyType::PacePassword, EncryptionAlgorithm::AES128)?;

        let mut files = BTreeMap::new();
        files.insert(
            0x0101,
            tlv(0x61, b"P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<"),
        );
        files.insert(0x0102, tlv(0x75, b"holder portrait image data"));

        Ok(Self {
            ba_keys,
            k_pi,
            pace_supported: false,
            ca_key: None,
            files,
            selected: None,
            rnd_ic: None,
            pace: None,
            ca_pending: false,
            session: None,
            pending_session: None,
        })
    }

    /// Enables PACE and installs the matching EF.CardAccess.
    pub(crate) fn with_pace(mut self) -> Result<Self, AuthError> {
        let pace_info = PaceInfo {
            protocol: oid(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 2]),
            version: Integer::from(2),
            parameter_id: Some(Integer::from(12)),
        };
        let encoded = der::encode(&pace_info).map_err(AuthError::RasnEncodeError)?;
        self.files.insert(0x011C, tlv(0x31, &encoded));
        self.pace_supported = true;
        Ok(self)
    }

    /// Enables Chip Authentication (ECDH P-256, AES-256) and installs the
    /// matching EF.DG14.
    pub(crate) fn with_chip_auth(mut self) -> Result<Self, AuthError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = EcKey::generate(&group)?;
        let spki_der = PKey::from_ec_key(key.clone())?.public_key_to_der()?;
        let spki = der::decode::<rasn_pkix::SubjectPublicKeyInfo>(&spki_der)
            .map_err(AuthError::RasnDecodeError)?;

        let ca_info = ChipAuthenticationInfo {
            protocol: oid(&[0, 4, 0, 127, 0, 7, 2, 2, 3, 2, 4]),
            version: Integer::from(1),
            key_id: None,
        };
        let pk_info = ChipAuthenticationPublicKeyInfo {
            protocol: oid(&[0, 4, 0, 127, 0, 7, 2, 2, 1, 2]),
            chip_authentication_public_key: spki,
            key_id: None,
        };
        let mut content = der::encode(&ca_info).map_err(AuthError::RasnEncodeError)?;
        content.extend(der::encode(&pk_info).map_err(AuthError::RasnEncodeError)?);
        self.files.insert(0x010E, tlv(0x6E, &tlv(0x31, &content)));
        self.ca_key = Some(key);
        Ok(self)
    }

    /// Installs the EF.SOD served to the terminal.
    pub(crate) fn with_sod(mut self, ef_sod: Vec<u8>) -> Self {
        self.files.insert(0x011D, ef_sod);
        self
    }

    /// Contents of a file by identifier, for building SOD fixtures.
    pub(crate) fn file(&self, fid: u16) -> &[u8] {
        self.files.get(&fid).expect("file present on the chip")
    }

    fn handle(&mut self, command: &[u8]) -> Result<Vec<u8>, AuthError> {
        if command.len() < 4 {
            return Ok(vec![0x67, 0x00]);
        }
        if self.session.is_some() && command[0] & 0x0C == 0x0C {
            return self.handle_secure(command);
        }

        let (header, data, le) = parse_plain(command);
        let (response, status) = self.dispatch(header, &data, le, false)?;
        Ok([&response[..], &status].concat())
    }

    fn handle_secure(&mut self, command: &[u8]) -> Result<Vec<u8>, AuthError> {
        let unwrapped = self
            .session
            .as_mut()
            .expect("secure path requires a session")
            .unwrap_command(command);
        let Ok((header, data, le)) = unwrapped else {
            // A chip that cannot verify the checksum answers plain
            return Ok(vec![0x69, 0x88]);
        };
        let (response, status) = self.dispatch(header, &data, le, true)?;
        let mut wrapped = self
            .session
            .as_mut()
            .expect("secure path requires a session")
            .wrap_response(&response, status)?;
        wrapped.extend_from_slice(&status);
        // A Chip Authentication key switch takes effect after this response
        if let Some(new_session) = self.pending_session.take() {
            self.session = Some(new_session);
        }
        Ok(wrapped)
    }

    fn dispatch(
        &mut self,
        header: [u8; 4],
        data: &[u8],
        le: Option<usize>,
        secure: bool,
    ) -> Result<(Vec<u8>, [u8; 2]), AuthError> {
        match header[1] {
            // SELECT
            0xA4 => match header[2] {
                0x04 => {
                    if data == crate::comms::EMRTD_AID {
                        Ok((Vec::new(), [0x90, 0x00]))
                    } else {
                        Ok((Vec::new(), [0x6A, 0x82]))
                    }
                }
                0x02 => {
                    if data.len() != 2 {
                        return Ok((Vec::new(), [0x67, 0x00]));
                    }
                    let fid = u16::from_be_bytes([data[0], data[1]]);
                    if self.files.contains_key(&fid) {
                        self.selected = Some(fid);
                        Ok((Vec::new(), [0x90, 0x00]))
                    } else {
                        Ok((Vec::new(), [0x6A, 0x82]))
                    }
                }
                _ => Ok((Vec::new(), [0x6A, 0x86])),
            },
            // READ BINARY
            0xB0 => {
                let Some(fid) = self.selected else {
                    return Ok((Vec::new(), [0x69, 0x86]));
                };
                let file = self.files.get(&fid).expect("selected file exists");
                let offset = usize::from(u16::from_be_bytes([header[2], header[3]]));
                if offset >= file.len() {
                    return Ok((Vec::new(), [0x6B, 0x00]));
                }
                let requested = le.unwrap_or(256);
                let end = usize::min(file.len(), offset + requested);
                Ok((file[offset..end].to_vec(), [0x90, 0x00]))
            }
            // GET CHALLENGE
            0x84 => {
                let rnd_ic = parse_hex(BAC_RND_IC);
                self.rnd_ic = Some(rnd_ic.clone());
                Ok((rnd_ic, [0x90, 0x00]))
            }
            // EXTERNAL AUTHENTICATE
            0x82 => self.external_authenticate(data),
            // MSE:SET AT
            0x22 => match [header[2], header[3]] {
                [0xC1, 0xA4] => self.pace_set_at(data),
                [0x41, 0xA4] if secure => {
                    if self.ca_key.is_some() {
                        self.ca_pending = true;
                        Ok((Vec::new(), [0x90, 0x00]))
                    } else {
                        Ok((Vec::new(), [0x6A, 0x88]))
                    }
                }
                _ => Ok((Vec::new(), [0x6A, 0x86])),
            },
            // GENERAL AUTHENTICATE
            0x86 => {
                if secure && self.ca_pending {
                    self.chip_authenticate(data)
                } else {
                    self.pace_general_authenticate(data)
                }
            }
            _ => Ok((Vec::new(), [0x6D, 0x00])),
        }
    }

    fn external_authenticate(&mut self, data: &[u8]) -> Result<(Vec<u8>, [u8; 2]), AuthError> {
        let Some(rnd_ic) = self.rnd_ic.take() else {
            return Ok((Vec::new(), [0x69, 0x85]));
        };
        if data.len() != 40 {
            return Ok((Vec::new(), [0x67, 0x00]));
        }
        let (e_ifd, m_ifd) = data.split_at(32);

        let expected = compute_mac(
            &self.ba_keys.ks_mac,
            &padding_method_2(e_ifd, 8)?,
            MacAlgorithm::DES,
        )?;
        if expected != m_ifd {
            return Ok((Vec::new(), [0x63, 0x00]));
        }

        let s = decrypt_with(
            EncryptionAlgorithm::DES3,
            &self.ba_keys.ks_enc,
            Some(&[0; 8]),
            e_ifd,
        )?;
        if s[8..16] != rnd_ic[..] {
            return Ok((Vec::new(), [0x63, 0x00]));
        }
        let rnd_ifd = &s[..8];
        let k_ifd = &s[16..32];
        let k_ic = parse_hex(BAC_K_IC);

        let r = [&rnd_ic[..], rnd_ifd, &k_ic].concat();
        let e_ic = encrypt_with(
            EncryptionAlgorithm::DES3,
            &self.ba_keys.ks_enc,
            Some(&[0; 8]),
            &r,
        )?;
        let m_ic = compute_mac(
            &self.ba_keys.ks_mac,
            &padding_method_2(&e_ic, 8)?,
            MacAlgorithm::DES,
        )?;

        let ses_key_seed = xor_slices(k_ifd, &k_ic)?;
        let keys = SessionKeys::derive(&ses_key_seed, EncryptionAlgorithm::DES3)?;
        let ssc = [&rnd_ic[4..], &rnd_ifd[4..]].concat();
        self.session = Some(ChipSm::new(EncryptionAlgorithm::DES3, keys, ssc));

        Ok(([&e_ic[..], &m_ic].concat(), [0x90, 0x00]))
    }

    fn pace_set_at(&mut self, data: &[u8]) -> Result<(Vec<u8>, [u8; 2]), AuthError> {
        let mut expected = tlv(0x80, PACE_OID_CONTENT);
        expected.extend_from_slice(&[0x83, 0x01, 0x01]);
        if !self.pace_supported || data != expected {
            return Ok((Vec::new(), [0x6A, 0x80]));
        }

        let mut nonce_bytes = [0_u8; 16];
        OsRng.fill_bytes(&mut nonce_bytes);
        self.pace = Some(PaceState {
            step: 1,
            nonce: BigNum::from_slice(&nonce_bytes)?,
            base: KeyAgreement::from_parameters(KeyAgreementAlgorithm::Ecdh, 12)?,
            mapped: None,
            ephemeral: None,
            terminal_ephemeral: None,
            keys: None,
        });
        Ok((Vec::new(), [0x90, 0x00]))
    }

    fn pace_general_authenticate(
        &mut self,
        data: &[u8],
    ) -> Result<(Vec<u8>, [u8; 2]), AuthError> {
        let Some(state) = self.pace.as_mut() else {
            return Ok((Vec::new(), [0x69, 0x85]));
        };
        let Ok((tag, value)) = ga_inner(data) else {
            return Ok((Vec::new(), [0x6A, 0x80]));
        };

        match (state.step, tag) {
            (1, 0x00) => {
                state.step = 2;
                let encrypted_nonce = encrypt_with(
                    EncryptionAlgorithm::AES128,
                    &self.k_pi,
                    Some(&[0; 16]),
                    &state.nonce.to_vec_padded(16)?,
                )?;
                Ok((tlv(0x7C, &tlv(0x80, &encrypted_nonce)), [0x90, 0x00]))
            }
            (2, 0x81) => {
                state.step = 3;
                let mapping = state.base.generate_keypair()?;
                let mapped = state
                    .base
                    .map_generator(&state.nonce, &mapping.private, &value)?;
                state.mapped = Some(mapped);
                Ok((tlv(0x7C, &tlv(0x82, &mapping.public)), [0x90, 0x00]))
            }
            (3, 0x83) => {
                state.step = 4;
                let mapped = state.mapped.as_ref().expect("mapping done in step 2");
                let ephemeral = mapped.generate_keypair()?;
                let shared_secret = mapped.shared_secret(&ephemeral.private, &value)?;
                state.keys = Some(SessionKeys::derive(
                    &shared_secret,
                    EncryptionAlgorithm::AES128,
                )?);
                let public = ephemeral.public.clone();
                state.ephemeral = Some(ephemeral);
                state.terminal_ephemeral = Some(value);
                Ok((tlv(0x7C, &tlv(0x84, &public)), [0x90, 0x00]))
            }
            (4, 0x85) => {
                let keys = state.keys.as_ref().expect("keys derived in step 3");
                let ephemeral = state.ephemeral.as_ref().expect("set in step 3");
                let terminal_ephemeral =
                    state.terminal_ephemeral.as_ref().expect("set in step 3");

                let expected = pace_token(&keys.ks_mac, &ephemeral.public)?;
                if value != expected {
                    self.pace = None;
                    return Ok((Vec::new(), [0x63, 0x00]));
                }
                let t_ic = pace_token(&keys.ks_mac, terminal_ephemeral)?;
                let session = ChipSm::new(EncryptionAlgorithm::AES128, keys.clone(), vec![0; 16]);
                self.session = Some(session);
                self.pace = None;
                Ok((tlv(0x7C, &tlv(0x86, &t_ic)), [0x90, 0x00]))
            }
            _ => {
                self.pace = None;
                Ok((Vec::new(), [0x6A, 0x80]))
            }
        }
    }

    fn chip_authenticate(&mut self, data: &[u8]) -> Result<(Vec<u8>, [u8; 2]), AuthError> {
        self.ca_pending = false;
        let Ok((0x80, terminal_public)) = ga_inner(data) else {
            return Ok((Vec::new(), [0x6A, 0x80]));
        };
        let key = self.ca_key.as_ref().expect("CA key present when pending");
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let Ok(shared_secret) = ecdh_shared_secret(&group, key.private_key(), &terminal_public)
        else {
            return Ok((Vec::new(), [0x6A, 0x80]));
        };
        let keys = SessionKeys::derive(&shared_secret, EncryptionAlgorithm::AES256)?;
        self.pending_session = Some(ChipSm::new(EncryptionAlgorithm::AES256, keys, vec![0; 16]));
        Ok((tlv(0x7C, &[]), [0x90, 0x00]))
    }
}

impl CardTransceiver for MockChip {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.handle(command)
            .map_err(|err| TransportError(err.to_string()))
    }
}

/// Splits a plain short-form APDU into header, command data and Le.
fn parse_plain(command: &[u8]) -> ([u8; 4], Vec<u8>, Option<usize>) {
    let header = [command[0], command[1], command[2], command[3]];
    let le_of = |byte: u8| if byte == 0 { 256 } else { byte as usize };
    match command.len() {
        4 => (header, Vec::new(), None),
        5 => (header, Vec::new(), Some(le_of(command[4]))),
        _ => {
            let lc = command[4] as usize;
            let end = usize::min(command.len(), 5 + lc);
            let data = command[5..end].to_vec();
            let le = command.get(5 + lc).map(|&b| le_of(b));
            (header, data, le)
        }
    }
}

/// Extracts the inner dynamic authentication object out of a `7C` template.
/// Returns tag 0 for an empty template.
fn ga_inner(data: &[u8]) -> Result<(u8, Vec<u8>), AuthError> {
    validate_asn1_tag(data, b"\x7C")?;
    let (inner, _) = get_asn1_child(data, 1)?;
    if inner.is_empty() {
        return Ok((0x00, Vec::new()));
    }
    let tag = inner[0];
    let (value, _) = get_asn1_child(inner, 1)?;
    Ok((tag, value.to_vec()))
}

/// PACE authentication token for the mock chip's fixed protocol profile.
fn pace_token(ks_mac: &[u8], public_key: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut inner = tlv(0x06, PACE_OID_CONTENT);
    inner.extend(tlv(0x86, public_key));
    let mut template = vec![0x7F, 0x49];
    template.extend(int2asn1len(inner.len()));
    template.extend(inner);
    compute_mac(
        ks_mac,
        &padding_method_2(&template, 16)?,
        MacAlgorithm::AESCMAC,
    )
}

/// A throwaway PKI: CSCA root, Document Signer Certificate and a signed
/// EF.SOD over the given data group contents.
pub(crate) struct PkiFixture {
    pub csca_der: Vec<u8>,
    pub ef_sod: Vec<u8>,
    csca_cert: X509,
    csca_key: PKey<Private>,
}

impl PkiFixture {
    /// Builds the PKI and an EF.SOD covering `data_groups`, signed with
    /// RSASSA-PKCS1-v1_5 or RSASSA-PSS.
    pub(crate) fn new(
        data_groups: &[(u8, Vec<u8>)],
        use_pss: bool,
    ) -> Result<Self, AuthError> {
        let csca_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let csca_cert = build_cert(1, "Test CSCA", &csca_key, None, true, false)?;
        let dsc_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let dsc_cert = build_cert(
            2,
            "Test Document Signer",
            &dsc_key,
            Some((&csca_cert, &csca_key)),
            false,
            false,
        )?;

        let sha256 = oid(&[2, 16, 840, 1, 101, 3, 4, 2, 1]);
        let hash_algorithm = AlgorithmIdentifier {
            algorithm: sha256,
            parameters: None,
        };
        let mut hash_values = Vec::new();
        for (dg_number, contents) in data_groups {
            hash_values.push(DataGroupHash {
                data_group_number: Integer::from(*dg_number),
                data_group_hash_value: OctetString::copy_from_slice(&hash(
                    MessageDigest::sha256(),
                    contents,
                )?),
            });
        }
        let security_object = LDSSecurityObject {
            version: Integer::from(0),
            hash_algorithm,
            data_group_hash_values: hash_values,
            lds_version_info: None,
        };
        let econtent = der::encode(&security_object).map_err(AuthError::RasnEncodeError)?;

        let dsc_rasn =
            der::decode::<Certificate>(&dsc_cert.to_der()?).map_err(AuthError::RasnDecodeError)?;
        let sod_cms = build_cms(
            oid(&[2, 23, 136, 1, 1, 1]),
            &econtent,
            vec![dsc_rasn.clone()],
            &dsc_rasn,
            &dsc_key,
            use_pss,
        )?;

        Ok(Self {
            csca_der: csca_cert.to_der()?,
            ef_sod: tlv(0x77, &sod_cms),
            csca_cert,
            csca_key,
        })
    }

    /// Builds a CSCA Master List carrying this fixture's CSCA, signed by a
    /// Master List Signer certificate issued under it.
    pub(crate) fn master_list(&self) -> Result<Vec<u8>, AuthError> {
        let mls_key = PKey::from_rsa(Rsa::generate(2048)?)?;
        let mls_cert = build_cert(
            3,
            "Test Master List Signer",
            &mls_key,
            Some((&self.csca_cert, &self.csca_key)),
            false,
            true,
        )?;

        let csca_rasn =
            der::decode::<Certificate>(&self.csca_der).map_err(AuthError::RasnDecodeError)?;
        let mls_rasn =
            der::decode::<Certificate>(&mls_cert.to_der()?).map_err(AuthError::RasnDecodeError)?;

        let master_list = CscaMasterList {
            version: Integer::from(0),
            cert_list: [csca_rasn.clone()].into_iter().collect(),
        };
        let econtent = der::encode(&master_list).map_err(AuthError::RasnEncodeError)?;

        build_cms(
            oid(&[2, 23, 136, 1, 1, 2]),
            &econtent,
            vec![mls_rasn.clone(), csca_rasn],
            &mls_rasn,
            &mls_key,
            false,
        )
    }
}

/// Issues an X.509 certificate; `issuer` of `None` self-signs.
fn build_cert(
    serial: u32,
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    is_ca: bool,
    master_list_eku: bool,
) -> Result<X509, AuthError> {
    let name = {
        let mut builder = X509NameBuilder::new()?;
        builder.append_entry_by_text("CN", common_name)?;
        builder.build()
    };

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    match issuer {
        Some((issuer_cert, _)) => builder.set_issuer_name(issuer_cert.subject_name())?,
        None => builder.set_issuer_name(&name)?,
    }
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(3650)?;
    builder.set_not_after(&not_after)?;
    if is_ca {
        builder.append_extension(BasicConstraints::new().critical().ca().pathlen(0).build()?)?;
    }
    if master_list_eku {
        builder.append_extension(ExtendedKeyUsage::new().other("2.23.136.1.1.3").build()?)?;
    }
    let signing_key = issuer.map_or(key, |(_, issuer_key)| issuer_key);
    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Assembles a CMS SignedData with one SignerInfo over `econtent` and wraps
/// it in a ContentInfo, the way SOD and Master List files are laid out.
fn build_cms(
    econtent_type: ObjectIdentifier,
    econtent: &[u8],
    certificates: Vec<Certificate>,
    signer_cert: &Certificate,
    signer_key: &PKey<Private>,
    use_pss: bool,
) -> Result<Vec<u8>, AuthError> {
    let digest_algorithm = AlgorithmIdentifier {
        algorithm: oid(&[2, 16, 840, 1, 101, 3, 4, 2, 1]),
        parameters: None,
    };

    let content_type_attr = Attribute {
        r#type: oid(&[1, 2, 840, 113549, 1, 9, 3]),
        values: [Any::new(
            der::encode(&econtent_type).map_err(AuthError::RasnEncodeError)?,
        )]
        .into_iter()
        .collect(),
    };
    let econtent_hash = hash(MessageDigest::sha256(), econtent)?;
    let message_digest_attr = Attribute {
        r#type: oid(&[1, 2, 840, 113549, 1, 9, 4]),
        values: [Any::new(
            der::encode(&OctetString::copy_from_slice(&econtent_hash))
                .map_err(AuthError::RasnEncodeError)?,
        )]
        .into_iter()
        .collect(),
    };
    let signed_attrs: rasn_cms::SignedAttributes = [content_type_attr, message_digest_attr]
        .into_iter()
        .collect();

    // The signature covers the signedAttrs under an EXPLICIT SET OF tag,
    // RFC 5652 Section 5.4
    let mut signed_attrs_bytes = der::encode(&signed_attrs).map_err(AuthError::RasnEncodeError)?;
    signed_attrs_bytes[0] = b'\x31';

    let mut signer = Signer::new(MessageDigest::sha256(), signer_key)?;
    if use_pss {
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
    }
    signer.update(&signed_attrs_bytes)?;
    let signature = signer.sign_to_vec()?;

    let signature_algorithm = AlgorithmIdentifier {
        algorithm: if use_pss {
            oid(&[1, 2, 840, 113549, 1, 1, 10])
        } else {
            oid(&[1, 2, 840, 113549, 1, 1, 1])
        },
        parameters: None,
    };
    let signer_info = SignerInfo {
        version: Integer::from(1),
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: signer_cert.tbs_certificate.issuer.clone(),
            serial_number: signer_cert.tbs_certificate.serial_number.clone(),
        }),
        digest_algorithm: digest_algorithm.clone(),
        signed_attrs: Some(signed_attrs),
        signature_algorithm,
        signature: OctetString::copy_from_slice(&signature),
        unsigned_attrs: None,
    };

    let signed_data = SignedData {
        version: Integer::from(3),
        digest_algorithms: [digest_algorithm].into_iter().collect(),
        encap_content_info: EncapsulatedContentInfo {
            content_type: econtent_type,
            content: Some(OctetString::copy_from_slice(econtent)),
        },
        certificates: Some(
            certificates
                .into_iter()
                .map(|cert| CertificateChoices::Certificate(Box::new(cert)))
                .collect(),
        ),
        crls: None,
        signer_infos: [signer_info].into_iter().collect(),
    };

    let content_info = ContentInfo {
        content_type: oid(&[1, 2, 840, 113549, 1, 7, 2]),
        content: Any::new(der::encode(&signed_data).map_err(AuthError::RasnEncodeError)?),
    };
    der::encode(&content_info).map_err(AuthError::RasnEncodeError)
}
