//! Execution-environment directory.
//!
//! Caches the EE list reported by the controller and resolves generic SE ids
//! to native handles. Lookups refresh implicitly until the cache has been
//! populated once; afterwards discovery-changed events keep it current.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use nfc_hal::{ControllerStack, EeHandle, EeInfo, EeStatus, NfcStatus, ProtoMask, TechMask};

use crate::config::NfcConfig;
use crate::errors::EeError;
use crate::types::{GenericSeId, NciVersion, UiccSlot, UiccStatus};
use crate::waiter::Waiter;

#[derive(Default)]
struct Cache {
    ees: Vec<EeInfo>,
    /// Filled by a successful query or a discovery event.
    populated: bool,
    /// A discovery event has been received since startup.
    discovered: bool,
    /// Discovery changed since routing last looked.
    dirty: bool,
}

pub struct Directory {
    controller: Arc<dyn ControllerStack>,
    cache: RwLock<Cache>,
    uicc_slot: RwLock<UiccSlot>,
    nci_version: NciVersion,
    host_techs: TechMask,
    discovery: Waiter<()>,
    mode_set: Waiter<(NfcStatus, EeStatus)>,
    mode_lock: Mutex<()>,
    probes: AtomicUsize,
    timeout: Duration,
}

impl Directory {
    pub fn new(controller: Arc<dyn ControllerStack>, config: &NfcConfig) -> Self {
        Self {
            controller,
            cache: RwLock::new(Cache::default()),
            uicc_slot: RwLock::new(config.uicc_slot),
            nci_version: config.nci_version,
            host_techs: config.host_listen_tech_mask,
            discovery: Waiter::new("ee discovery"),
            mode_set: Waiter::new("mode set"),
            mode_lock: Mutex::new(()),
            probes: AtomicUsize::new(0),
            timeout: config.completion_timeout(),
        }
    }

    /// Query the controller for the current EE list. A failed query keeps
    /// the previous cache.
    pub async fn refresh(&self) -> Vec<EeInfo> {
        match self.controller.ee_info().await {
            Ok(ees) => {
                debug!(count = ees.len(), "ee directory refreshed");
                let mut cache = self.cache.write();
                cache.ees = ees.clone();
                cache.populated = true;
                ees
            }
            Err(e) => {
                warn!(error = %e, "ee info query failed, keeping cached directory");
                self.cache.read().ees.clone()
            }
        }
    }

    async fn ensure_populated(&self) {
        if !self.cache.read().populated {
            self.refresh().await;
        }
    }

    /// Native handle behind a generic id, honouring the selected UICC slot.
    pub fn resolve(&self, generic: GenericSeId) -> EeHandle {
        match generic {
            GenericSeId::Host => EeHandle::HOST,
            GenericSeId::EmbeddedSe => EeHandle::ESE,
            GenericSeId::Uicc => match self.nci_version {
                NciVersion::V1 => EeHandle::UICC_NCI1,
                NciVersion::V2 => EeHandle::UICC,
            },
            GenericSeId::Uicc2 | GenericSeId::Uicc3 => match *self.uicc_slot.read() {
                UiccSlot::Slot2 => EeHandle::UICC2,
                UiccSlot::Slot3 => EeHandle::UICC3,
            },
            GenericSeId::T4tNfcee => EeHandle::T4T_NFCEE,
            GenericSeId::Euicc => EeHandle::EUICC,
            GenericSeId::Euicc2 => EeHandle::EUICC2,
        }
    }

    /// Generic id of a native handle.
    pub fn generic_for(&self, handle: EeHandle) -> Option<GenericSeId> {
        match handle {
            EeHandle::HOST => Some(GenericSeId::Host),
            EeHandle::ESE => Some(GenericSeId::EmbeddedSe),
            EeHandle::UICC | EeHandle::UICC_NCI1 => Some(GenericSeId::Uicc),
            EeHandle::UICC2 => Some(GenericSeId::Uicc2),
            EeHandle::UICC3 => Some(GenericSeId::Uicc3),
            EeHandle::T4T_NFCEE => Some(GenericSeId::T4tNfcee),
            EeHandle::EUICC => Some(GenericSeId::Euicc),
            EeHandle::EUICC2 => Some(GenericSeId::Euicc2),
            _ => None,
        }
    }

    pub fn select_uicc_slot(&self, slot: UiccSlot) {
        let previous = std::mem::replace(&mut *self.uicc_slot.write(), slot);
        if previous != slot {
            info!(?previous, ?slot, "uicc slot selection changed");
        }
    }

    pub fn uicc_slot(&self) -> UiccSlot {
        *self.uicc_slot.read()
    }

    /// The host is always active.
    pub async fn is_active(&self, handle: EeHandle) -> bool {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if handle.is_host() {
            return true;
        }
        self.ensure_populated().await;
        self.cache
            .read()
            .ees
            .iter()
            .any(|ee| ee.handle == handle && ee.is_active())
    }

    /// Listen technologies and protocols of an EE; empty if unknown.
    pub async fn capabilities(&self, handle: EeHandle) -> (TechMask, ProtoMask) {
        if handle.is_host() {
            return (self.host_techs, ProtoMask::ISO_DEP | ProtoMask::T3T);
        }
        self.ensure_populated().await;
        self.cache
            .read()
            .ees
            .iter()
            .find(|ee| ee.handle == handle)
            .map(|ee| (ee.technologies, ee.protocols))
            .unwrap_or_default()
    }

    /// Cached status, without refreshing.
    pub fn status(&self, handle: EeHandle) -> Option<EeStatus> {
        self.cache
            .read()
            .ees
            .iter()
            .find(|ee| ee.handle == handle)
            .map(|ee| ee.status)
    }

    /// Status as currently reported by the controller.
    pub async fn current_status(&self, handle: EeHandle) -> Option<EeStatus> {
        self.refresh().await;
        self.status(handle)
    }

    pub fn snapshot(&self) -> Vec<EeInfo> {
        self.cache.read().ees.clone()
    }

    /// Cached EE list, refreshed first if never populated.
    pub async fn list(&self) -> Vec<EeInfo> {
        self.ensure_populated().await;
        self.snapshot()
    }

    /// Number of activity probes made so far.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Ask the controller to rediscover EEs; the result arrives as an event.
    pub async fn request_discovery(&self) -> Result<(), EeError> {
        self.controller.request_discovery().await?;
        Ok(())
    }

    pub fn on_discovery_changed(&self, snapshot: Vec<EeInfo>) {
        info!(count = snapshot.len(), "ee discovery changed");
        {
            let mut cache = self.cache.write();
            cache.ees = snapshot;
            cache.populated = true;
            cache.discovered = true;
            cache.dirty = true;
        }
        self.discovery.complete(());
    }

    /// Wait for the first discovery event. Returns immediately if one has
    /// already been received.
    pub async fn wait_for_discovery(&self, limit: Duration) -> bool {
        let pending = self.discovery.arm();
        if self.cache.read().discovered {
            self.discovery.release();
            return true;
        }
        match pending.wait(limit).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "no ee discovery received");
                false
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.read().dirty
    }

    /// Clears and returns the discovery-changed flag.
    pub fn take_dirty(&self) -> bool {
        std::mem::take(&mut self.cache.write().dirty)
    }

    // ------------------------------------------------------------------------
    // Mode set
    // ------------------------------------------------------------------------

    /// Enable or disable an EE and wait for the controller's answer.
    pub async fn set_mode(&self, handle: EeHandle, enable: bool) -> Result<EeStatus, EeError> {
        let _guard = self.mode_lock.lock().await;
        debug!(handle = %handle, enable, "mode set");

        let pending = self.mode_set.arm();
        self.controller.mode_set(handle, enable).await?;
        let (status, ee_status) = pending.wait(self.timeout).await?;

        if !status.is_ok() {
            return Err(EeError::ModeSetFailed { handle, status });
        }
        Ok(ee_status)
    }

    pub fn on_mode_set(&self, handle: EeHandle, status: NfcStatus, ee_status: EeStatus) {
        debug!(handle = %handle, ?status, ?ee_status, "mode set completed");
        if let Some(ee) = self.cache.write().ees.iter_mut().find(|ee| ee.handle == handle) {
            ee.status = ee_status;
        }
        self.mode_set.complete((status, ee_status));
    }

    pub fn release_waiters(&self) {
        self.discovery.release();
        self.mode_set.release();
    }

    // ------------------------------------------------------------------------
    // Host-facing views
    // ------------------------------------------------------------------------

    /// Generic ids of every active secure element.
    pub async fn active_generic_ids(&self) -> Vec<GenericSeId> {
        self.ensure_populated().await;
        let mut ids: Vec<GenericSeId> = self
            .cache
            .read()
            .ees
            .iter()
            .filter(|ee| ee.is_active() && !ee.handle.is_host())
            .filter_map(|ee| self.generic_for(ee.handle))
            .collect();
        ids.dedup();
        ids
    }

    /// Handles usable as routing destinations: not the HCI network, not
    /// HCI-access only, not inactive.
    pub async fn ee_handle_list(&self) -> Vec<EeHandle> {
        self.ensure_populated().await;
        self.cache
            .read()
            .ees
            .iter()
            .filter(|ee| ee.handle != EeHandle::HCI_NETWORK && !ee.hci_access_only && ee.status != EeStatus::Inactive)
            .map(|ee| ee.handle)
            .collect()
    }

    pub async fn uicc_status(&self, uicc: GenericSeId) -> UiccStatus {
        self.ensure_populated().await;
        match self.status(self.resolve(uicc)) {
            Some(EeStatus::Active) => UiccStatus::Enabled,
            Some(EeStatus::Inactive) => UiccStatus::Disabled,
            Some(EeStatus::Removed) | None => UiccStatus::Removed,
        }
    }
}
