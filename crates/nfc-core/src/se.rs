//! Secure element wired session controller.
//!
//! Opens a wired session to one secure element, runs the APDU gate reset
//! handshake, exchanges APDUs and recovers the SE when an exchange times
//! out. Multi-step sequences (open, close, timeout recovery) serialize on
//! one recovery lock; APDU exchanges serialize on their own lock.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use nfc_hal::{ControllerStack, EeHandle, EeStatus, NfcStatus, PipeInfo, PowerLink, NCI_MAX_AID_LEN};

use crate::config::NfcConfig;
use crate::directory::Directory;
use crate::errors::{EeError, SeError, WaitError};
use crate::recovery::{
    PowerCycle, ABORT_TIMEOUT, APDU_GATE, EVT_END_OF_APDU_TRANSFER, GATE_PIPE_TIMEOUT, GATE_RESET_ATTEMPTS,
    MAX_APDU_LEN, POWER_LINK_ON, SESSION_RESET_COMMAND, SW_WRONG_LENGTH,
};
use crate::rf_field::RfFieldTracker;
use crate::types::GenericSeId;
use crate::waiter::{PendingWait, Waiter};

const INS_SELECT: u8 = 0xA4;
const P1_SELECT_BY_NAME: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Transceiving,
    Recovering,
    Aborting,
}

/// Result of one APDU exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransceiveOutcome {
    pub success: bool,
    pub response: Bytes,
}

impl TransceiveOutcome {
    fn completed(response: Bytes, max_response: usize) -> Self {
        let len = response.len().min(max_response);
        Self {
            success: true,
            response: response.slice(..len),
        }
    }

    fn failed(response: Bytes, max_response: usize) -> Self {
        let len = response.len().min(max_response);
        Self {
            success: false,
            response: response.slice(..len),
        }
    }
}

/// Replace an empty-AID SELECT with a SELECT of `aid`.
///
/// Applies to 4 or 5 byte `SELECT by name` commands. A 5-byte command keeps
/// its last byte as Le.
pub fn substitute_empty_select<'a>(apdu: &'a [u8], aid: Option<&[u8]>) -> Cow<'a, [u8]> {
    let Some(aid) = aid.filter(|aid| (1..=NCI_MAX_AID_LEN).contains(&aid.len())) else {
        return Cow::Borrowed(apdu);
    };
    if !matches!(apdu.len(), 4 | 5) || apdu[1] != INS_SELECT || apdu[2] != P1_SELECT_BY_NAME {
        return Cow::Borrowed(apdu);
    }

    let mut select = Vec::with_capacity(apdu.len() + aid.len() + 1);
    select.extend_from_slice(&apdu[..4]);
    select.push(aid.len() as u8);
    select.extend_from_slice(aid);
    if let Some(le) = apdu.get(4) {
        select.push(*le);
    }
    debug!(apdu = %hex::encode(&select), "substituted default aid into empty select");
    Cow::Owned(select)
}

pub struct SecureElement {
    controller: Arc<dyn ControllerStack>,
    directory: Arc<Directory>,

    state: RwLock<SessionState>,
    handle: RwLock<EeHandle>,
    pipe: AtomicU8,
    wired_open: AtomicBool,
    disabling: AtomicBool,
    atr: RwLock<Bytes>,
    rf_field: RfFieldTracker,

    default_aid: Option<Vec<u8>>,
    error_recovery: bool,
    transceive_timeout: Duration,
    recovery_timeout: Duration,
    timeout: Duration,

    // Completion waiters
    power_link: Waiter<NfcStatus>,
    recovery: Waiter<()>,
    transceive: Waiter<(NfcStatus, Bytes)>,
    abort: Waiter<(NfcStatus, Bytes)>,
    hci_event: Waiter<NfcStatus>,
    raw: Waiter<(NfcStatus, Bytes)>,
    rf_discovery: Waiter<NfcStatus>,
    gate: Waiter<(NfcStatus, u8)>,
    pipes: Waiter<(NfcStatus, Vec<PipeInfo>)>,

    transceive_lock: AsyncMutex<()>,
    /// Open, close and timeout recovery.
    recovery_lock: AsyncMutex<()>,
}

impl SecureElement {
    pub fn new(controller: Arc<dyn ControllerStack>, directory: Arc<Directory>, config: &NfcConfig) -> Self {
        Self {
            controller,
            directory,
            state: RwLock::new(SessionState::Closed),
            handle: RwLock::new(EeHandle::INVALID),
            pipe: AtomicU8::new(0),
            wired_open: AtomicBool::new(false),
            disabling: AtomicBool::new(false),
            atr: RwLock::new(Bytes::new()),
            rf_field: RfFieldTracker::new(),
            default_aid: config.default_se_aid_bytes(),
            error_recovery: config.error_recovery,
            transceive_timeout: config.transceive_timeout(),
            recovery_timeout: config.recovery_timeout(),
            timeout: config.completion_timeout(),
            power_link: Waiter::new("power link"),
            recovery: Waiter::new("ee recovery"),
            transceive: Waiter::new("transceive"),
            abort: Waiter::new("abort"),
            hci_event: Waiter::new("hci event"),
            raw: Waiter::new("raw command"),
            rf_discovery: Waiter::new("rf discovery"),
            gate: Waiter::new("gate allocation"),
            pipes: Waiter::new("pipe list"),
            transceive_lock: AsyncMutex::new(()),
            recovery_lock: AsyncMutex::new(()),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Open a wired session to `se` and reset its APDU gate.
    pub async fn open(&self, se: GenericSeId) -> Result<EeHandle, SeError> {
        let _guard = self.recovery_lock.lock().await;

        if self.is_disabling() {
            warn!(%se, "refusing wired open while nfc is disabling");
            return Err(SeError::Disabling);
        }
        if self.state() != SessionState::Closed {
            warn!(%se, state = ?self.state(), "wired session already open");
            return Err(SeError::AlreadyOpen);
        }

        let handle = self.directory.resolve(se);
        if !handle.is_valid() || handle.is_host() {
            return Err(SeError::UnknownSe(se));
        }
        info!(%se, handle = %handle, "opening wired session");
        self.set_state(SessionState::Opening);

        if let Err(e) = self.activate(handle).await {
            error!(handle = %handle, error = %e, "failed to activate secure element");
            self.set_state(SessionState::Closed);
            return Err(e);
        }

        *self.handle.write() = handle;
        self.wired_open.store(true, Ordering::SeqCst);
        if self.gate_and_pipe(handle).await.is_none() {
            warn!(handle = %handle, "no apdu pipe to the secure element");
        }

        match self.apdu_gate_reset(handle).await {
            Ok(atr) => {
                info!(handle = %handle, atr = %hex::encode(&atr), "wired session open");
                self.set_state(SessionState::Open);
                Ok(handle)
            }
            Err(e) => {
                error!(handle = %handle, error = %e, "apdu gate reset failed");
                self.wired_open.store(false, Ordering::SeqCst);
                if let Err(e) = self.directory.set_mode(handle, false).await {
                    warn!(handle = %handle, error = %e, "failed to deactivate secure element");
                }
                *self.handle.write() = EeHandle::INVALID;
                self.set_state(SessionState::Closed);
                Err(e)
            }
        }
    }

    /// Power the EE up and enable it, waiting out an EE recovery if the
    /// enable fails.
    async fn activate(&self, handle: EeHandle) -> Result<(), SeError> {
        self.set_power_link(handle, POWER_LINK_ON).await?;

        let recovered = self.recovery.arm();
        match self.directory.set_mode(handle, true).await {
            Ok(EeStatus::Active) => {
                self.recovery.release();
                return Ok(());
            }
            Err(EeError::Command(e)) => {
                self.recovery.release();
                return Err(e.into());
            }
            Ok(status) => warn!(handle = %handle, ?status, "ee not active after enable"),
            Err(e) => warn!(handle = %handle, error = %e, "ee enable failed"),
        }

        info!(handle = %handle, "waiting for ee recovery");
        self.set_state(SessionState::Recovering);
        match recovered.wait(self.recovery_timeout).await {
            Ok(()) => {
                info!(handle = %handle, "ee recovered");
                self.set_state(SessionState::Opening);
                Ok(())
            }
            Err(e) => {
                error!(handle = %handle, error = %e, "ee recovery did not complete");
                Err(SeError::RecoveryTimeout)
            }
        }
    }

    /// Close the wired session. Returns false if none was open.
    pub async fn close(&self) -> bool {
        if !self.wired_open.swap(false, Ordering::SeqCst) {
            debug!("close without an open wired session");
            return false;
        }
        self.transceive.release();
        self.abort.release();

        let _guard = self.recovery_lock.lock().await;
        let handle = *self.handle.read();
        info!(handle = %handle, "closing wired session");

        if let Err(e) = self.set_power_link(handle, PowerLink::ALWAYS_ON).await {
            warn!(handle = %handle, error = %e, "failed to restore power configuration");
        }
        if let Err(e) = self.send_event(EVT_END_OF_APDU_TRANSFER).await {
            warn!(handle = %handle, error = %e, "failed to send end of apdu transfer");
        }

        *self.handle.write() = EeHandle::INVALID;
        self.set_state(SessionState::Closed);
        true
    }

    // ========================================================================
    // APDU gate reset
    // ========================================================================

    /// Reset the APDU gate and store the returned ATR.
    ///
    /// A failed reset is recovered once according to its status, if error
    /// recovery is enabled.
    pub async fn apdu_gate_reset(&self, handle: EeHandle) -> Result<Bytes, SeError> {
        let (status, recovered) = match self.attempt_gate_reset(handle).await {
            Ok(atr) => return Ok(self.store_atr(atr)),
            Err(failure) => failure,
        };
        if !self.error_recovery {
            return Err(SeError::GateReset(status));
        }

        warn!(handle = %handle, ?status, "apdu gate reset failed, recovering");
        match (status, recovered) {
            (NfcStatus::Unrecoverable, Some(recovered)) => {
                if recovered.wait(self.recovery_timeout).await.is_err() {
                    return Err(SeError::RecoveryTimeout);
                }
            }
            (NfcStatus::WtxTimeout, _) => self.run_power_cycle(handle, PowerCycle::WTX_GATE_RESET).await,
            (NfcStatus::Timeout, _) => self.nfcee_session_reset(handle).await,
            (status, _) => return Err(SeError::GateReset(status)),
        }

        match self.attempt_gate_reset(handle).await {
            Ok(atr) => Ok(self.store_atr(atr)),
            Err((status, _)) => Err(SeError::GateReset(status)),
        }
    }

    /// Up to [`GATE_RESET_ATTEMPTS`] aborts while the SE answers
    /// invalid-parameter. An unrecoverable failure hands back the armed
    /// recovery wait.
    async fn attempt_gate_reset(&self, handle: EeHandle) -> Result<Bytes, (NfcStatus, Option<PendingWait<()>>)> {
        let mut attempt = 1;
        loop {
            let recovered = self.recovery.arm();
            match self.abort_exchange(handle).await {
                Ok(atr) => {
                    self.recovery.release();
                    return Ok(atr);
                }
                Err(NfcStatus::InvalidParam) if attempt < GATE_RESET_ATTEMPTS => {
                    self.recovery.release();
                    attempt += 1;
                    debug!(attempt, "gate reset answered invalid parameter, retrying");
                }
                Err(NfcStatus::Unrecoverable) => return Err((NfcStatus::Unrecoverable, Some(recovered))),
                Err(status) => {
                    self.recovery.release();
                    return Err((status, None));
                }
            }
        }
    }

    fn store_atr(&self, atr: Bytes) -> Bytes {
        *self.atr.write() = atr.clone();
        atr
    }

    /// Clear the NFCEE session identity and power-cycle the EE with RF
    /// discovery stopped.
    async fn nfcee_session_reset(&self, handle: EeHandle) {
        info!(handle = %handle, "resetting nfcee session");
        if let Err(e) = self.set_rf_discovery(false).await {
            warn!(error = %e, "failed to stop rf discovery");
        }
        match self.write_raw(&SESSION_RESET_COMMAND).await {
            Ok(response) => debug!(response = %hex::encode(&response), "session reset written"),
            Err(e) => warn!(error = %e, "session reset command failed"),
        }
        self.run_power_cycle(handle, PowerCycle::SESSION_RESET).await;
        if let Err(e) = self.set_rf_discovery(true).await {
            warn!(error = %e, "failed to restart rf discovery");
        }
    }

    // ========================================================================
    // Transceive
    // ========================================================================

    /// Exchange one APDU over the wired session.
    ///
    /// Timeouts never error: they trigger recovery and degrade to
    /// `success == false` with whatever bytes arrived.
    pub async fn transceive(&self, apdu: &[u8], timeout: Duration, max_response: usize) -> TransceiveOutcome {
        let apdu = substitute_empty_select(apdu, self.default_aid.as_deref());
        if !self.is_open() {
            warn!("transceive without an open wired session");
            return TransceiveOutcome::failed(Bytes::new(), max_response);
        }
        if apdu.len() > MAX_APDU_LEN {
            warn!(len = apdu.len(), "apdu exceeds the wired link maximum");
            return TransceiveOutcome::completed(Bytes::from_static(&SW_WRONG_LENGTH), max_response);
        }

        let _guard = self.transceive_lock.lock().await;
        let handle = *self.handle.read();
        let limit = timeout.max(self.transceive_timeout);
        debug!(handle = %handle, apdu = %hex::encode(&apdu), "transceive");

        self.set_state_if_open(SessionState::Transceiving);
        let pending = self.transceive.arm();
        if let Err(e) = self.controller.send_apdu(handle, &apdu, limit).await {
            self.transceive.release();
            error!(handle = %handle, error = %e, "apdu rejected");
            self.set_state_if_open(SessionState::Open);
            return TransceiveOutcome::failed(Bytes::new(), max_response);
        }

        let outcome = match pending.wait(limit + self.timeout).await {
            Ok((NfcStatus::Ok, response)) => {
                debug!(response = %hex::encode(&response), "transceive complete");
                TransceiveOutcome::completed(response, max_response)
            }
            Ok((NfcStatus::WtxTimeout, response)) => {
                warn!(handle = %handle, "transceive wtx timeout");
                self.recover_from_wtx(handle).await;
                TransceiveOutcome::failed(response, max_response)
            }
            Ok((NfcStatus::Timeout, response)) => {
                warn!(handle = %handle, "transceive timeout");
                self.recover_from_timeout(handle).await;
                TransceiveOutcome::failed(response, max_response)
            }
            Ok((status, response)) => {
                warn!(handle = %handle, ?status, "transceive failed");
                TransceiveOutcome::failed(response, max_response)
            }
            Err(e) => {
                error!(handle = %handle, error = %e, "no transceive completion");
                TransceiveOutcome::failed(Bytes::new(), max_response)
            }
        };

        self.set_state_if_open(SessionState::Open);
        outcome
    }

    async fn recover_from_wtx(&self, handle: EeHandle) {
        self.set_state_if_open(SessionState::Aborting);
        let no_response = matches!(self.abort_exchange(handle).await, Err(NfcStatus::Timeout));
        if no_response && self.is_open() && !self.is_disabling() {
            warn!(handle = %handle, "abort unanswered, power cycling");
            self.handle_transceive_timeout(PowerLink::NFCC_DECIDES).await;
        }
    }

    async fn recover_from_timeout(&self, handle: EeHandle) {
        self.handle_transceive_timeout(PowerLink::ALWAYS_ON).await;
        if let Err(e) = self.send_event(EVT_END_OF_APDU_TRANSFER).await {
            warn!(handle = %handle, error = %e, "failed to send end of apdu transfer");
        }
        match self.directory.current_status(handle).await {
            Some(EeStatus::Active) => {}
            status => {
                warn!(handle = %handle, ?status, "ee still not active, power cycling again");
                self.handle_transceive_timeout(PowerLink::NFCC_DECIDES).await;
            }
        }
    }

    /// Power-cycle the open session's EE after a transceive timeout.
    /// Returns false when no session was open.
    pub async fn handle_transceive_timeout(&self, first: PowerLink) -> bool {
        let _guard = self.recovery_lock.lock().await;
        if !self.is_open() {
            debug!("session closed, skipping power cycle");
            return false;
        }
        let handle = *self.handle.read();
        self.set_state(SessionState::Recovering);
        self.run_power_cycle(handle, PowerCycle::transceive_timeout(first)).await;
        true
    }

    async fn run_power_cycle(&self, handle: EeHandle, cycle: PowerCycle) {
        info!(handle = %handle, first = %cycle.first, "power cycling secure element");
        if let Err(e) = self.set_power_link(handle, cycle.first).await {
            warn!(handle = %handle, error = %e, "power link failed");
        }
        if let Err(e) = self.directory.set_mode(handle, false).await {
            warn!(handle = %handle, error = %e, "ee disable failed");
        }
        sleep(cycle.off_settle).await;
        if let Err(e) = self.set_power_link(handle, POWER_LINK_ON).await {
            warn!(handle = %handle, error = %e, "power link failed");
        }
        match self.directory.set_mode(handle, true).await {
            Ok(status) => debug!(handle = %handle, ?status, "ee re-enabled"),
            Err(e) => warn!(handle = %handle, error = %e, "ee enable failed"),
        }
        if !cycle.on_settle.is_zero() {
            sleep(cycle.on_settle).await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// ATR from the last successful gate reset.
    pub fn get_atr(&self) -> Bytes {
        self.atr.read().clone()
    }

    /// Allocate the APDU gate and find the pipe to `handle`.
    pub async fn gate_and_pipe(&self, handle: EeHandle) -> Option<u8> {
        let pending = self.gate.arm();
        match self.controller.allocate_gate(APDU_GATE).await {
            Ok(()) => match pending.wait(GATE_PIPE_TIMEOUT).await {
                Ok((status, gate)) if status.is_ok() => debug!(gate, "apdu gate allocated"),
                Ok((status, _)) => warn!(?status, "apdu gate allocation failed"),
                Err(e) => warn!(error = %e, "apdu gate allocation unanswered"),
            },
            Err(e) => {
                self.gate.release();
                warn!(error = %e, "apdu gate allocation rejected");
            }
        }

        let pending = self.pipes.arm();
        if let Err(e) = self.controller.gate_pipe_list().await {
            self.pipes.release();
            warn!(error = %e, "pipe list rejected");
            return None;
        }
        let pipes = match pending.wait(GATE_PIPE_TIMEOUT).await {
            Ok((status, pipes)) if status.is_ok() => pipes,
            Ok((status, _)) => {
                warn!(?status, "pipe list failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "pipe list unanswered");
                return None;
            }
        };

        let dest_host = handle.nfcee_id();
        let pipe = pipes.iter().find(|p| p.dest_host == dest_host)?;
        debug!(pipe = pipe.pipe_id, gate = pipe.local_gate, "apdu pipe found");
        self.pipe.store(pipe.pipe_id, Ordering::Relaxed);
        Some(pipe.pipe_id)
    }

    pub fn is_rf_field_on(&self) -> bool {
        self.rf_field.is_on()
    }

    pub fn notify_rf_field(&self, on: bool) {
        self.rf_field.notify(on);
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// True once the gate reset completed, until close. Wired mode is
    /// already on while OPENING but the session takes no APDUs yet.
    pub fn is_open(&self) -> bool {
        self.wired_open.load(Ordering::SeqCst)
            && !matches!(self.state(), SessionState::Closed | SessionState::Opening)
    }

    pub fn active_handle(&self) -> EeHandle {
        *self.handle.read()
    }

    pub fn set_disabling(&self, disabling: bool) {
        self.disabling.store(disabling, Ordering::SeqCst);
    }

    pub fn is_disabling(&self) -> bool {
        self.disabling.load(Ordering::SeqCst)
    }

    /// Wake a transceive or abort blocked on the controller.
    pub fn release_pending_transceive(&self) {
        if self.transceive.release() | self.abort.release() {
            info!("released pending transceive");
        }
    }

    pub fn release_waiters(&self) {
        self.release_pending_transceive();
        self.power_link.release();
        self.recovery.release();
        self.hci_event.release();
        self.raw.release();
        self.rf_discovery.release();
        self.gate.release();
        self.pipes.release();
    }

    // ========================================================================
    // Completions
    // ========================================================================

    pub fn on_power_link(&self, status: NfcStatus) {
        self.power_link.complete(status);
    }

    pub fn on_recovery_complete(&self) {
        if !self.recovery.complete(()) {
            debug!("ee recovery complete with nobody waiting");
        }
    }

    pub fn on_apdu_response(&self, status: NfcStatus, data: Bytes) {
        self.transceive.complete((status, data));
    }

    pub fn on_abort_response(&self, status: NfcStatus, data: Bytes) {
        self.abort.complete((status, data));
    }

    pub fn on_hci_event_sent(&self, status: NfcStatus) {
        self.hci_event.complete(status);
    }

    pub fn on_raw_response(&self, status: NfcStatus, data: Bytes) {
        self.raw.complete((status, data));
    }

    pub fn on_rf_discovery(&self, status: NfcStatus) {
        self.rf_discovery.complete(status);
    }

    pub fn on_gate_allocated(&self, status: NfcStatus, gate: u8) {
        self.gate.complete((status, gate));
    }

    pub fn on_pipe_list(&self, status: NfcStatus, pipes: Vec<PipeInfo>) {
        self.pipes.complete((status, pipes));
    }

    // ========================================================================
    // Command plumbing
    // ========================================================================

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "session state");
        }
    }

    fn set_state_if_open(&self, state: SessionState) {
        if self.is_open() {
            self.set_state(state);
        }
    }

    async fn set_power_link(&self, handle: EeHandle, config: PowerLink) -> Result<(), SeError> {
        let pending = self.power_link.arm();
        if let Err(e) = self.controller.power_link(handle, config).await {
            self.power_link.release();
            return Err(e.into());
        }
        let status = pending.wait(self.timeout).await?;
        if !status.is_ok() {
            return Err(SeError::Failed { op: "power link", status });
        }
        Ok(())
    }

    /// Abort the current exchange; an ATR comes back on success.
    async fn abort_exchange(&self, handle: EeHandle) -> Result<Bytes, NfcStatus> {
        let pending = self.abort.arm();
        if let Err(e) = self.controller.abort_apdu(handle, ABORT_TIMEOUT).await {
            self.abort.release();
            warn!(handle = %handle, error = %e, "abort rejected");
            return Err(e.status());
        }
        match pending.wait(ABORT_TIMEOUT + self.timeout).await {
            Ok((NfcStatus::Ok, atr)) if !atr.is_empty() => Ok(atr),
            Ok((NfcStatus::Ok, _)) => Err(NfcStatus::Failed),
            Ok((status, _)) => Err(status),
            Err(WaitError::TimedOut(_)) => Err(NfcStatus::Timeout),
            Err(WaitError::Released(_)) => Err(NfcStatus::Failed),
        }
    }

    async fn send_event(&self, event: u8) -> Result<(), SeError> {
        let pipe = self.pipe.load(Ordering::Relaxed);
        let pending = self.hci_event.arm();
        if let Err(e) = self.controller.send_hci_event(pipe, event).await {
            self.hci_event.release();
            return Err(e.into());
        }
        let status = pending.wait(self.timeout).await?;
        if !status.is_ok() {
            return Err(SeError::Failed { op: "send hci event", status });
        }
        Ok(())
    }

    async fn set_rf_discovery(&self, enable: bool) -> Result<(), SeError> {
        let pending = self.rf_discovery.arm();
        if let Err(e) = self.controller.set_rf_discovery(enable).await {
            self.rf_discovery.release();
            return Err(e.into());
        }
        let status = pending.wait(self.timeout).await?;
        if !status.is_ok() {
            return Err(SeError::Failed { op: "rf discovery", status });
        }
        Ok(())
    }

    async fn write_raw(&self, command: &[u8]) -> Result<Bytes, SeError> {
        let pending = self.raw.arm();
        if let Err(e) = self.controller.write_raw(command).await {
            self.raw.release();
            return Err(e.into());
        }
        let (status, response) = pending.wait(self.timeout).await?;
        if !status.is_ok() {
            return Err(SeError::Failed { op: "raw command", status });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfc_hal::MockController;

    const AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00];

    fn secure_element() -> SecureElement {
        let controller: Arc<dyn ControllerStack> = Arc::new(MockController::new());
        let config = NfcConfig::default();
        let directory = Arc::new(Directory::new(controller.clone(), &config));
        SecureElement::new(controller, directory, &config)
    }

    #[test]
    fn test_empty_select_with_le() {
        let apdu = [0x00, 0xA4, 0x04, 0x00, 0x00];
        let out = substitute_empty_select(&apdu, Some(&AID));
        assert_eq!(
            &out[..],
            &[0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_empty_select_without_le() {
        let apdu = [0x00, 0xA4, 0x04, 0x0C];
        let out = substitute_empty_select(&apdu, Some(&AID[..2]));
        assert_eq!(&out[..], &[0x00, 0xA4, 0x04, 0x0C, 0x02, 0xA0, 0x00]);
    }

    #[test]
    fn test_select_left_alone() {
        // Non-empty select
        let apdu = [0x00, 0xA4, 0x04, 0x00, 0x02, 0xA0, 0x00];
        assert!(matches!(substitute_empty_select(&apdu, Some(&AID)), Cow::Borrowed(_)));

        // Select by file id
        let apdu = [0x00, 0xA4, 0x00, 0x00];
        assert!(matches!(substitute_empty_select(&apdu, Some(&AID)), Cow::Borrowed(_)));

        // No usable default aid
        let apdu = [0x00, 0xA4, 0x04, 0x00];
        assert!(matches!(substitute_empty_select(&apdu, None), Cow::Borrowed(_)));
        assert!(matches!(substitute_empty_select(&apdu, Some(&[])), Cow::Borrowed(_)));
        assert!(matches!(substitute_empty_select(&apdu, Some(&[0u8; 17])), Cow::Borrowed(_)));
    }

    #[test]
    fn test_outcome_truncates() {
        let outcome = TransceiveOutcome::completed(Bytes::from_static(&[1, 2, 3, 4]), 2);
        assert!(outcome.success);
        assert_eq!(&outcome.response[..], &[1, 2]);
    }

    #[tokio::test]
    async fn test_transceive_requires_open_session() {
        let se = secure_element();
        let outcome = se.transceive(&[0x00, 0xB0, 0x00, 0x00], Duration::from_secs(1), 256).await;
        assert!(!outcome.success);
        assert!(outcome.response.is_empty());
        assert!(!se.close().await);
        assert_eq!(se.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_refused_while_disabling() {
        let se = secure_element();
        se.set_disabling(true);
        assert_eq!(se.open(GenericSeId::EmbeddedSe).await, Err(SeError::Disabling));
    }

    #[tokio::test]
    async fn test_open_host_is_unknown_se() {
        let se = secure_element();
        assert_eq!(se.open(GenericSeId::Host).await, Err(SeError::UnknownSe(GenericSeId::Host)));
    }
}
