//! Controller stack command interface and completion events.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::power::PowerStates;
use crate::types::{AidInfo, EeHandle, EeInfo, EeStatus, NfcStatus, PipeInfo, PowerLink, ProtoMask, TechMask};

/// Synchronous rejection of a command by the controller stack
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command rejected by controller: {0:?}")]
    Rejected(NfcStatus),

    #[error("command not supported by controller")]
    NotSupported,

    #[error("controller stack unavailable")]
    Unavailable,
}

impl CommandError {
    /// Status equivalent of the rejection.
    pub fn status(&self) -> NfcStatus {
        match self {
            CommandError::Rejected(status) => *status,
            CommandError::NotSupported => NfcStatus::NotSupported,
            CommandError::Unavailable => NfcStatus::Failed,
        }
    }
}

/// Asynchronous completion or notification delivered by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    // EE management
    /// EE discovery finished or changed; carries the full snapshot.
    EeDiscovered(Vec<EeInfo>),
    ModeSet { handle: EeHandle, status: NfcStatus, ee_status: EeStatus },
    PowerLinkSet { handle: EeHandle, status: NfcStatus },
    /// The NFCC finished reinitializing an EE after an unrecoverable error.
    EeRecoveryComplete,

    // Routing
    /// Completion of a technology, protocol, system-code or listen
    /// technology configuration command.
    RouteConfigured { status: NfcStatus },
    AidAdded { status: NfcStatus },
    AidRemoved { status: NfcStatus },
    RoutingUpdated { status: NfcStatus },
    ListenRouting { status: NfcStatus, tlvs: Bytes },
    T3tRegistered { status: NfcStatus, handle: u16 },
    T3tDeregistered { status: NfcStatus },

    // Wired data path
    RfDiscovery { status: NfcStatus, started: bool },
    ApduResponse { status: NfcStatus, data: Bytes },
    /// Answer to an abort; carries the ATR on success.
    AbortResponse { status: NfcStatus, data: Bytes },
    HciEventSent { status: NfcStatus },
    GateAllocated { status: NfcStatus, gate: u8 },
    PipeList { status: NfcStatus, pipes: Vec<PipeInfo> },
    RawResponse { status: NfcStatus, data: Bytes },

    // Notifications forwarded to the host
    RfField { on: bool },
    ListenActivated { technology: TechMask },
    ListenDeactivated { technology: TechMask },
    CeData { status: NfcStatus, technology: TechMask, data: Bytes, more: bool },
}

impl ControllerEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ControllerEvent::EeDiscovered(_) => "ee_discovered",
            ControllerEvent::ModeSet { .. } => "mode_set",
            ControllerEvent::PowerLinkSet { .. } => "power_link_set",
            ControllerEvent::EeRecoveryComplete => "ee_recovery_complete",
            ControllerEvent::RouteConfigured { .. } => "route_configured",
            ControllerEvent::AidAdded { .. } => "aid_added",
            ControllerEvent::AidRemoved { .. } => "aid_removed",
            ControllerEvent::RoutingUpdated { .. } => "routing_updated",
            ControllerEvent::ListenRouting { .. } => "listen_routing",
            ControllerEvent::T3tRegistered { .. } => "t3t_registered",
            ControllerEvent::T3tDeregistered { .. } => "t3t_deregistered",
            ControllerEvent::RfDiscovery { .. } => "rf_discovery",
            ControllerEvent::ApduResponse { .. } => "apdu_response",
            ControllerEvent::AbortResponse { .. } => "abort_response",
            ControllerEvent::HciEventSent { .. } => "hci_event_sent",
            ControllerEvent::GateAllocated { .. } => "gate_allocated",
            ControllerEvent::PipeList { .. } => "pipe_list",
            ControllerEvent::RawResponse { .. } => "raw_response",
            ControllerEvent::RfField { .. } => "rf_field",
            ControllerEvent::ListenActivated { .. } => "listen_activated",
            ControllerEvent::ListenDeactivated { .. } => "listen_deactivated",
            ControllerEvent::CeData { .. } => "ce_data",
        }
    }
}

/// Receiver of controller completions and notifications.
///
/// Called on the controller's callback context; implementations must not
/// block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: ControllerEvent);
}

/// Command interface of an NFC controller stack.
///
/// Every method returns as soon as the stack has accepted or rejected the
/// command. An accepted command is answered by exactly one completion event
/// unless noted otherwise.
#[async_trait]
pub trait ControllerStack: Send + Sync {
    /// Register the receiver of completion events.
    fn register(&self, sink: Weak<dyn EventSink>);

    /// Current EE list, answered directly without a completion.
    async fn ee_info(&self) -> Result<Vec<EeInfo>, CommandError>;

    /// Request EE discovery; completes with `EeDiscovered`.
    async fn request_discovery(&self) -> Result<(), CommandError>;

    /// Enable or disable an EE; completes with `ModeSet`.
    async fn mode_set(&self, handle: EeHandle, enable: bool) -> Result<(), CommandError>;

    /// NFCEE power and link control; completes with `PowerLinkSet`.
    async fn power_link(&self, handle: EeHandle, config: PowerLink) -> Result<(), CommandError>;

    /// Completes with `AidAdded`.
    async fn add_aid_route(
        &self,
        handle: EeHandle,
        aid: &[u8],
        power: PowerStates,
        info: AidInfo,
    ) -> Result<(), CommandError>;

    /// Completes with `AidRemoved`.
    async fn remove_aid_route(&self, aid: &[u8]) -> Result<(), CommandError>;

    /// Completes with `RouteConfigured`.
    async fn set_default_tech_route(
        &self,
        handle: EeHandle,
        technology: TechMask,
        power: PowerStates,
    ) -> Result<(), CommandError>;

    /// Completes with `RouteConfigured`.
    async fn clear_default_tech_route(&self, handle: EeHandle, technology: TechMask) -> Result<(), CommandError>;

    /// Completes with `RouteConfigured`.
    async fn set_default_proto_route(
        &self,
        handle: EeHandle,
        protocol: ProtoMask,
        power: PowerStates,
    ) -> Result<(), CommandError>;

    /// Completes with `RouteConfigured`.
    async fn clear_default_proto_route(&self, handle: EeHandle, protocol: ProtoMask) -> Result<(), CommandError>;

    /// Completes with `RouteConfigured`. Controllers without system-code
    /// based routing reject with [`CommandError::NotSupported`].
    async fn add_system_code_route(
        &self,
        handle: EeHandle,
        system_code: u16,
        power: PowerStates,
    ) -> Result<(), CommandError>;

    /// Completes with `RouteConfigured`.
    async fn remove_system_code_route(&self, system_code: u16) -> Result<(), CommandError>;

    /// Configure the listen technologies of an EE; completes with
    /// `RouteConfigured`.
    async fn set_listen_tech(&self, handle: EeHandle, technology: TechMask) -> Result<(), CommandError>;

    /// Push the staged listen-mode routing table; completes with
    /// `RoutingUpdated`.
    async fn update_routing(&self) -> Result<(), CommandError>;

    /// Read back the committed table; completes with `ListenRouting`.
    async fn get_listen_routing(&self) -> Result<(), CommandError>;

    /// Register a Felica system code on the host; completes with
    /// `T3tRegistered`.
    async fn register_felica_system_code(
        &self,
        system_code: u16,
        nfcid2: [u8; 8],
        pmm: [u8; 8],
    ) -> Result<(), CommandError>;

    /// Completes with `T3tDeregistered`.
    async fn deregister_felica_system_code(&self, handle: u16) -> Result<(), CommandError>;

    /// Start or stop RF discovery; completes with `RfDiscovery`.
    async fn set_rf_discovery(&self, enable: bool) -> Result<(), CommandError>;

    /// Send an APDU over the wired link; completes with `ApduResponse`.
    async fn send_apdu(&self, handle: EeHandle, apdu: &[u8], timeout: Duration) -> Result<(), CommandError>;

    /// Abort the current exchange / reset the APDU gate; completes with
    /// `AbortResponse`.
    async fn abort_apdu(&self, handle: EeHandle, timeout: Duration) -> Result<(), CommandError>;

    /// Send an HCI event on a pipe; completes with `HciEventSent`.
    async fn send_hci_event(&self, pipe: u8, event: u8) -> Result<(), CommandError>;

    /// Allocate a local gate; completes with `GateAllocated`.
    async fn allocate_gate(&self, gate: u8) -> Result<(), CommandError>;

    /// Completes with `PipeList`.
    async fn gate_pipe_list(&self) -> Result<(), CommandError>;

    /// Write a raw NCI command; completes with `RawResponse`.
    async fn write_raw(&self, command: &[u8]) -> Result<(), CommandError>;
}
