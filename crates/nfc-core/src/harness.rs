//! Test harness for the NFC core.
//!
//! Builds a [`HostBridge`] over a [`MockController`] and records the
//! notifications it forwards.

use std::sync::Arc;

use parking_lot::Mutex;

use nfc_hal::{ControllerStack, EeHandle, EeInfo, EeStatus, MockController, PipeInfo, ProtoMask, TechMask};

use crate::bridge::{HostBridge, HostNotification, HostNotifier};
use crate::config::NfcConfig;
use crate::recovery::APDU_GATE;

/// Notifier keeping every forwarded notification.
#[derive(Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<HostNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<HostNotification> {
        self.received.lock().clone()
    }
}

impl HostNotifier for RecordingNotifier {
    fn notify(&self, notification: HostNotification) {
        self.received.lock().push(notification);
    }
}

/// Embedded SE supporting A and B, UICC supporting A only.
pub fn reference_ees() -> Vec<EeInfo> {
    vec![
        EeInfo::new(EeHandle::ESE, EeStatus::Active)
            .with_technologies(TechMask::A | TechMask::B)
            .with_protocols(ProtoMask::ISO_DEP),
        EeInfo::new(EeHandle::UICC, EeStatus::Active)
            .with_technologies(TechMask::A)
            .with_protocols(ProtoMask::ISO_DEP),
    ]
}

/// APDU pipe from the host to the embedded SE.
pub fn ese_pipe() -> PipeInfo {
    PipeInfo {
        pipe_id: 0x19,
        local_gate: APDU_GATE,
        dest_host: EeHandle::ESE.nfcee_id(),
        dest_gate: 0xF0,
    }
}

/// A bridge wired to `mock`, plus its notifier.
pub struct Harness {
    pub mock: Arc<MockController>,
    pub notifier: Arc<RecordingNotifier>,
    pub bridge: Arc<HostBridge>,
}

impl Harness {
    pub fn new(config: &NfcConfig, mock: MockController) -> Self {
        let mock = Arc::new(mock);
        let notifier = Arc::new(RecordingNotifier::new());
        let controller: Arc<dyn ControllerStack> = mock.clone();
        let bridge = HostBridge::new(config, controller, notifier.clone());
        Self { mock, notifier, bridge }
    }

    /// Reference EEs, default configuration.
    pub fn reference() -> Self {
        Self::new(
            &NfcConfig::default(),
            MockController::new().with_ees(reference_ees()).with_pipes(vec![ese_pipe()]),
        )
    }
}
