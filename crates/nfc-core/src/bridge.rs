//! Host application bridge.
//!
//! Wires the directory, routing manager and secure element to one
//! controller stack, dispatches controller events to them and exposes the
//! upward API. Every failure degrades to a boolean, an invalid handle or an
//! empty result here.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{error, info, trace, warn};

use nfc_hal::{
    AidInfo, ControllerEvent, ControllerStack, EeHandle, EntryKind, EventSink, PowerStates, RoutingEntry,
    TechMask,
};

use crate::config::NfcConfig;
use crate::directory::Directory;
use crate::routing::RoutingManager;
use crate::se::{SecureElement, TransceiveOutcome};
use crate::types::{GenericSeId, UiccSlot, UiccStatus};

/// Controller notification forwarded to the host unmodified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostNotification {
    RfField { on: bool },
    ListenActivated { technology: TechMask },
    ListenDeactivated { technology: TechMask },
    /// One reassembled card-emulation packet.
    CeData { technology: TechMask, data: Bytes },
}

/// Receiver of host notifications. Called on the controller's callback
/// context.
pub trait HostNotifier: Send + Sync {
    fn notify(&self, notification: HostNotification);
}

pub struct HostBridge {
    directory: Arc<Directory>,
    routing: Arc<RoutingManager>,
    se: Arc<SecureElement>,
    notifier: Arc<dyn HostNotifier>,
}

impl HostBridge {
    /// Build the services over `controller` and register the bridge as its
    /// event sink.
    pub fn new(config: &NfcConfig, controller: Arc<dyn ControllerStack>, notifier: Arc<dyn HostNotifier>) -> Arc<Self> {
        let directory = Arc::new(Directory::new(controller.clone(), config));
        let routing = Arc::new(RoutingManager::new(controller.clone(), directory.clone(), config));
        let se = Arc::new(SecureElement::new(controller.clone(), directory.clone(), config));

        let bridge = Arc::new(Self {
            directory,
            routing,
            se,
            notifier,
        });
        let sink = Arc::downgrade(&bridge);
        controller.register(sink);
        bridge
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn routing(&self) -> &Arc<RoutingManager> {
        &self.routing
    }

    pub fn secure_element(&self) -> &Arc<SecureElement> {
        &self.se
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Compute the initial routes and commit them.
    pub async fn initialize(&self) -> bool {
        if let Err(e) = self.routing.initialize().await {
            warn!(error = %e, "routing initialized with errors");
        }
        self.commit_routing().await
    }

    pub async fn enable_routing_to_host(&self) -> bool {
        report("enable routing to host", self.routing.enable_routing_to_host().await)
    }

    pub async fn disable_routing_to_host(&self) -> bool {
        report("disable routing to host", self.routing.disable_routing_to_host().await)
    }

    pub async fn route_aid(&self, aid: &[u8], route: GenericSeId, power: PowerStates, info: AidInfo) -> bool {
        report("route aid", self.routing.add_aid_route(aid, route, power, info).await)
    }

    pub async fn unroute_aid(&self, aid: &[u8]) -> bool {
        report("unroute aid", self.routing.remove_aid_route(aid).await)
    }

    pub async fn commit_routing(&self) -> bool {
        report("commit routing", self.routing.commit().await)
    }

    pub async fn clear_routing_entry(&self, kind: EntryKind) -> bool {
        report("clear routing entry", self.routing.clear_routing_entry(kind).await)
    }

    pub async fn set_routing_entry(&self, kind: EntryKind, value: u16, route: GenericSeId, power: PowerStates) -> bool {
        report("set routing entry", self.routing.set_routing_entry(kind, value, route, power).await)
    }

    /// Recompute every default route, e.g. after a slot change.
    pub async fn update_routing_table(&self) -> bool {
        report("update routing table", self.routing.update_routing_table().await)
    }

    pub fn set_nfc_secure(&self, enable: bool) -> bool {
        self.routing.set_nfc_secure(enable);
        true
    }

    /// Committed table as read back from the controller.
    pub async fn routing_dump(&self) -> Vec<RoutingEntry> {
        match self.routing.listen_routing().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to read listen routing");
                Vec::new()
            }
        }
    }

    pub async fn register_t3t_identifier(&self, identifier: &[u8]) -> Option<u16> {
        match self.routing.register_t3t_identifier(identifier).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "t3t registration failed");
                None
            }
        }
    }

    pub async fn deregister_t3t_identifier(&self, handle: u16) -> bool {
        report("deregister t3t", self.routing.deregister_t3t_identifier(handle).await)
    }

    // ========================================================================
    // Secure elements
    // ========================================================================

    pub async fn active_secure_elements(&self) -> Vec<GenericSeId> {
        self.directory.active_generic_ids().await
    }

    pub fn select_uicc_slot(&self, slot: UiccSlot) {
        self.directory.select_uicc_slot(slot);
    }

    pub async fn uicc_status(&self, uicc: GenericSeId) -> UiccStatus {
        self.directory.uicc_status(uicc).await
    }

    pub async fn request_ee_discovery(&self) -> bool {
        report("ee discovery", self.directory.request_discovery().await)
    }

    /// Open a wired session; [`EeHandle::INVALID`] on failure.
    pub async fn open_secure_element(&self, se: GenericSeId) -> EeHandle {
        match self.se.open(se).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(%se, error = %e, "wired open failed");
                EeHandle::INVALID
            }
        }
    }

    pub async fn close_secure_element(&self) -> bool {
        self.se.close().await
    }

    pub async fn transceive(
        &self,
        handle: EeHandle,
        apdu: &[u8],
        timeout: Duration,
        max_response: usize,
    ) -> TransceiveOutcome {
        if handle != self.se.active_handle() {
            warn!(handle = %handle, "transceive on a handle without a session");
            return TransceiveOutcome {
                success: false,
                response: Bytes::new(),
            };
        }
        self.se.transceive(apdu, timeout, max_response).await
    }

    pub fn get_atr(&self, handle: EeHandle) -> Bytes {
        if handle != self.se.active_handle() {
            return Bytes::new();
        }
        self.se.get_atr()
    }

    pub fn is_rf_field_on(&self) -> bool {
        self.se.is_rf_field_on()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close the wired session, deactivate EEs and release every waiter.
    pub async fn shutdown(&self) {
        info!("nfc shutting down");
        self.se.set_disabling(true);
        self.se.release_pending_transceive();
        self.se.close().await;
        self.routing.on_nfcc_shutdown().await;

        self.se.release_waiters();
        self.routing.release_waiters();
        self.directory.release_waiters();
    }
}

fn report<E: std::fmt::Display>(op: &'static str, result: Result<(), E>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(op, error = %e, "operation failed");
            false
        }
    }
}

impl EventSink for HostBridge {
    fn on_event(&self, event: ControllerEvent) {
        trace!(event = event.name(), "controller event");
        match event {
            // EE management
            ControllerEvent::EeDiscovered(ees) => self.directory.on_discovery_changed(ees),
            ControllerEvent::ModeSet { handle, status, ee_status } => {
                self.directory.on_mode_set(handle, status, ee_status)
            }
            ControllerEvent::PowerLinkSet { status, .. } => self.se.on_power_link(status),
            ControllerEvent::EeRecoveryComplete => self.se.on_recovery_complete(),

            // Routing
            ControllerEvent::RouteConfigured { status } => self.routing.on_route_configured(status),
            ControllerEvent::AidAdded { status } | ControllerEvent::AidRemoved { status } => {
                self.routing.on_aid_completed(status)
            }
            ControllerEvent::RoutingUpdated { status } => self.routing.on_routing_updated(status),
            ControllerEvent::ListenRouting { status, tlvs } => self.routing.on_listen_routing(status, tlvs),
            ControllerEvent::T3tRegistered { status, handle } => self.routing.on_t3t_completed(status, handle),
            ControllerEvent::T3tDeregistered { status } => self.routing.on_t3t_completed(status, 0),

            // Wired data path
            ControllerEvent::RfDiscovery { status, .. } => self.se.on_rf_discovery(status),
            ControllerEvent::ApduResponse { status, data } => self.se.on_apdu_response(status, data),
            ControllerEvent::AbortResponse { status, data } => self.se.on_abort_response(status, data),
            ControllerEvent::HciEventSent { status } => self.se.on_hci_event_sent(status),
            ControllerEvent::GateAllocated { status, gate } => self.se.on_gate_allocated(status, gate),
            ControllerEvent::PipeList { status, pipes } => self.se.on_pipe_list(status, pipes),
            ControllerEvent::RawResponse { status, data } => self.se.on_raw_response(status, data),

            // Host notifications
            ControllerEvent::RfField { on } => {
                self.se.notify_rf_field(on);
                self.notifier.notify(HostNotification::RfField { on });
            }
            ControllerEvent::ListenActivated { technology } => {
                self.notifier.notify(HostNotification::ListenActivated { technology })
            }
            ControllerEvent::ListenDeactivated { technology } => {
                self.routing.on_listen_deactivated();
                self.notifier.notify(HostNotification::ListenDeactivated { technology });
            }
            ControllerEvent::CeData { status, technology, data, more } => {
                if let Some(data) = self.routing.on_ce_data(status, &data, more) {
                    self.notifier.notify(HostNotification::CeData { technology, data });
                }
            }
        }
    }
}
