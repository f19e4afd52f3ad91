//! The authentication engine driving the full ICAO Doc 9303 flow:
//! PACE (falling back to BAC), data group reads over secure messaging,
//! Chip Authentication and Passive Authentication.

use alloc::{collections::BTreeMap, format, string::String, vec::Vec};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tracing::{info, warn};

use crate::comms::PassportComms;
use crate::iso7816::CardTransceiver;
use crate::mrz::MrzKey;
use crate::passive_auth::{passive_authentication, TrustAnchorSet};
use crate::security_info::SecurityInfoSet;
use crate::{bac, chip_auth, pace, AuthError};

/// Where the engine currently stands in the authentication flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    /// First exchange with the chip went through.
    Connected,
    PaceAttempted,
    BacAttempted,
    /// A secure messaging session is established.
    Authenticated,
    DataGroupsRead,
    ChipAuthAttempted,
    PassiveAuthEvaluated,
    Done,
    Failed,
}

/// Outcome of a full authentication run.
///
/// The access control flags record which protocol produced the secure
/// channel; `chip_auth_succeeded` and `passive_auth_succeeded` record the
/// two verification results. `data_groups` maps data group numbers to the
/// raw file contents read from the chip.
#[derive(Debug, Default)]
pub struct AuthenticationResult {
    pub pace_succeeded: bool,
    pub bac_succeeded: bool,
    pub chip_auth_succeeded: bool,
    pub passive_auth_succeeded: bool,
    pub data_groups: BTreeMap<u8, Vec<u8>>,
}

/// Drives a passport chip through the full authentication flow.
///
/// See the crate documentation for a usage example.
pub struct AuthenticationEngine<T: CardTransceiver, R: RngCore + CryptoRng + Default = OsRng> {
    comms: PassportComms<T, R>,
    state: EngineState,
}

impl<T: CardTransceiver, R: RngCore + CryptoRng + Default> AuthenticationEngine<T, R> {
    /// Constructs an engine over the given transport.
    #[must_use]
    pub fn new(transceiver: T) -> Self {
        Self {
            comms: PassportComms::new(transceiver),
            state: EngineState::Idle,
        }
    }

    /// The current position in the flow, mainly useful after an error.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Runs the full authentication flow against the chip.
    ///
    /// PACE is attempted first when EF.CardAccess advertises it; BAC is the
    /// fallback and is never attempted once PACE succeeded. DG1, DG2 and
    /// EF.SOD are read over the secure channel, DG14 when present. Chip
    /// Authentication and Passive Authentication failures do not abort the
    /// run, they are recorded in the result.
    ///
    /// `progress` receives a human-readable status string at each stage.
    ///
    /// # Errors
    ///
    /// * `AuthError::AuthenticationError` if neither PACE nor BAC could
    ///   establish a secure channel.
    /// * `AuthError::TransportError` if the reader link breaks.
    /// * `AuthError::SecureMessagingError` if the secure channel fails while
    ///   reading the mandatory files.
    pub fn authenticate(
        &mut self,
        mrz_key: &MrzKey,
        anchors: &TrustAnchorSet,
        progress: &mut dyn FnMut(&str),
    ) -> Result<AuthenticationResult, AuthError> {
        match self.run(mrz_key, anchors, progress) {
            Ok(result) => {
                self.state = EngineState::Done;
                progress("Done");
                Ok(result)
            }
            Err(err) => {
                self.state = EngineState::Failed;
                progress("Authentication failure");
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        mrz_key: &MrzKey,
        anchors: &TrustAnchorSet,
        progress: &mut dyn FnMut(&str),
    ) -> Result<AuthenticationResult, AuthError> {
        let mut result = AuthenticationResult::default();
        progress("Authenticating...");

        // EF.CardAccess lives in the master file and is readable without
        // access control. Chips without PACE simply do not have it.
        let card_access = self.try_read_ef(b"\x01\x1C", "EF.CardAccess", false)?;
        self.state = EngineState::Connected;

        let security_info_set = match &card_access {
            Some(bytes) => match SecurityInfoSet::from_card_access(bytes) {
                Ok(set) => Some(set),
                Err(err) => {
                    warn!("EF.CardAccess could not be parsed: {err}");
                    None
                }
            },
            None => None,
        };

        if let Some(set) = security_info_set.filter(SecurityInfoSet::has_pace) {
            match pace::establish(&mut self.comms, &set, mrz_key) {
                Ok(()) => result.pace_succeeded = true,
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) => warn!("PACE failed, falling back to BAC: {err}"),
            }
            self.state = EngineState::PaceAttempted;
            progress(&format!("PACE passed = {}", result.pace_succeeded));
        }

        self.comms.select_application(result.pace_succeeded)?;

        // BAC is only attempted when PACE did not produce a session
        if !result.pace_succeeded {
            match bac::establish(&mut self.comms, mrz_key) {
                Ok(()) => result.bac_succeeded = true,
                Err(err) if is_fatal(&err) => return Err(err),
                Err(err) => warn!("BAC failed: {err}"),
            }
            self.state = EngineState::BacAttempted;
            progress(&format!("BAC passed = {}", result.bac_succeeded));
            if !result.bac_succeeded {
                return Err(AuthError::AuthenticationError);
            }
        }
        self.state = EngineState::Authenticated;

        progress("Reading data groups...");
        let dg1 = self.read_ef(b"\x01\x01", "EF.DG1")?;
        let dg2 = self.read_ef(b"\x01\x02", "EF.DG2")?;
        let ef_sod = self.read_ef(b"\x01\x1D", "EF.SOD")?;
        result.data_groups.insert(1, dg1);
        result.data_groups.insert(2, dg2);

        // DG14 is optional, it only exists on chips that support Chip
        // Authentication
        let dg14 = self.try_read_ef(b"\x01\x0E", "EF.DG14", true)?;
        if let Some(dg14) = &dg14 {
            result.data_groups.insert(14, dg14.clone());
        }
        self.state = EngineState::DataGroupsRead;

        if let Some(dg14) = &dg14 {
            progress("Chip authentication...");
            result.chip_auth_succeeded = self.chip_authenticate(dg14);
            self.state = EngineState::ChipAuthAttempted;
        }

        progress("Passive authentication...");
        result.passive_auth_succeeded = match passive_authentication(&ef_sod, anchors) {
            Ok((hash_table, _dsc)) => {
                let mut verified = true;
                // DG14 integrity matters only when its key was used
                let mut to_check = alloc::vec![1_u8, 2];
                if dg14.is_some() {
                    to_check.push(14);
                }
                for dg_number in to_check {
                    let Some(dg) = result.data_groups.get(&dg_number) else {
                        continue;
                    };
                    if let Err(err) = hash_table.verify(dg_number, dg) {
                        warn!("EF.DG{dg_number} failed the hash check: {err}");
                        verified = false;
                    } else {
                        info!("EF.DG{dg_number} passed the hash check");
                    }
                }
                verified
            }
            Err(err) => {
                warn!("Passive authentication failed: {err}");
                false
            }
        };
        self.state = EngineState::PassiveAuthEvaluated;

        Ok(result)
    }

    /// Runs Chip Authentication, reporting failure instead of propagating it.
    /// Only the transport breaking is fatal, but by this point every file has
    /// already been read, so a dead session after a failed key switch is
    /// harmless.
    fn chip_authenticate(&mut self, dg14: &[u8]) -> bool {
        let security_info_set = match SecurityInfoSet::from_dg14(dg14) {
            Ok(set) => set,
            Err(err) => {
                warn!("EF.DG14 could not be parsed: {err}");
                return false;
            }
        };
        if !security_info_set.has_chip_auth() {
            warn!("EF.DG14 does not advertise Chip Authentication");
            return false;
        }
        match chip_auth::establish(&mut self.comms, &security_info_set)
            .and_then(|()| chip_auth::confirm_channel(&mut self.comms))
        {
            Ok(()) => true,
            Err(err) => {
                warn!("Chip Authentication failed: {err}");
                false
            }
        }
    }

    /// Reads a mandatory elementary file, any failure is propagated.
    fn read_ef(&mut self, fid: &[u8; 2], fname: &str) -> Result<Vec<u8>, AuthError> {
        self.comms.select_ef(fid, fname, true)?;
        self.comms.read_data_from_ef(true)
    }

    /// Reads an optional elementary file. A rejected SELECT means the file
    /// does not exist on this chip; everything else is propagated.
    fn try_read_ef(
        &mut self,
        fid: &[u8; 2],
        fname: &str,
        secure: bool,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        match self.comms.select_ef(fid, fname, secure) {
            Ok(()) => Ok(Some(self.comms.read_data_from_ef(secure)?)),
            Err(AuthError::RecvApduError(sw1, sw2)) => {
                info!("{fname} is not present on this chip: {sw1:02X} {sw2:02X}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Whether an access control failure must abort the whole run instead of
/// falling back.
fn is_fatal(err: &AuthError) -> bool {
    matches!(
        err,
        AuthError::TransportError(_) | AuthError::SecureMessagingError(_)
    )
}
