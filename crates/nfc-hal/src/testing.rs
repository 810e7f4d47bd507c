//! Testing utilities for controller stack consumers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::entry::{encode_entries, RoutingEntry};
use crate::power::PowerStates;
use crate::traits::{CommandError, ControllerEvent, ControllerStack, EventSink};
use crate::types::{AidInfo, EeHandle, EeInfo, EeStatus, NfcStatus, PipeInfo, PowerLink, ProtoMask, TechMask};

/// CORE_SET_CONFIG_RSP with status OK.
const SET_CONFIG_OK: &[u8] = &[0x40, 0x02, 0x02, 0x00, 0x00];

/// Command kind, used to script replies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RequestDiscovery,
    ModeSet,
    PowerLink,
    AddAid,
    RemoveAid,
    SetTechRoute,
    ClearTechRoute,
    SetProtoRoute,
    ClearProtoRoute,
    AddSystemCode,
    RemoveSystemCode,
    ListenTech,
    UpdateRouting,
    GetListenRouting,
    RegisterT3t,
    DeregisterT3t,
    RfDiscovery,
    SendApdu,
    AbortApdu,
    SendHciEvent,
    AllocateGate,
    GatePipeList,
    WriteRaw,
}

/// Command as recorded by [`MockController`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    RequestDiscovery,
    ModeSet { handle: EeHandle, enable: bool },
    PowerLink { handle: EeHandle, config: PowerLink },
    AddAid { handle: EeHandle, aid: Vec<u8>, power: PowerStates, info: AidInfo },
    RemoveAid { aid: Vec<u8> },
    SetTechRoute { handle: EeHandle, technology: TechMask, power: PowerStates },
    ClearTechRoute { handle: EeHandle, technology: TechMask },
    SetProtoRoute { handle: EeHandle, protocol: ProtoMask, power: PowerStates },
    ClearProtoRoute { handle: EeHandle, protocol: ProtoMask },
    AddSystemCode { handle: EeHandle, system_code: u16, power: PowerStates },
    RemoveSystemCode { system_code: u16 },
    ListenTech { handle: EeHandle, technology: TechMask },
    UpdateRouting,
    GetListenRouting,
    RegisterT3t { system_code: u16, nfcid2: [u8; 8], pmm: [u8; 8] },
    DeregisterT3t { handle: u16 },
    RfDiscovery { enable: bool },
    SendApdu { handle: EeHandle, apdu: Vec<u8> },
    AbortApdu { handle: EeHandle },
    SendHciEvent { pipe: u8, event: u8 },
    AllocateGate { gate: u8 },
    GatePipeList,
    WriteRaw { command: Vec<u8> },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::RequestDiscovery => CommandKind::RequestDiscovery,
            Command::ModeSet { .. } => CommandKind::ModeSet,
            Command::PowerLink { .. } => CommandKind::PowerLink,
            Command::AddAid { .. } => CommandKind::AddAid,
            Command::RemoveAid { .. } => CommandKind::RemoveAid,
            Command::SetTechRoute { .. } => CommandKind::SetTechRoute,
            Command::ClearTechRoute { .. } => CommandKind::ClearTechRoute,
            Command::SetProtoRoute { .. } => CommandKind::SetProtoRoute,
            Command::ClearProtoRoute { .. } => CommandKind::ClearProtoRoute,
            Command::AddSystemCode { .. } => CommandKind::AddSystemCode,
            Command::RemoveSystemCode { .. } => CommandKind::RemoveSystemCode,
            Command::ListenTech { .. } => CommandKind::ListenTech,
            Command::UpdateRouting => CommandKind::UpdateRouting,
            Command::GetListenRouting => CommandKind::GetListenRouting,
            Command::RegisterT3t { .. } => CommandKind::RegisterT3t,
            Command::DeregisterT3t { .. } => CommandKind::DeregisterT3t,
            Command::RfDiscovery { .. } => CommandKind::RfDiscovery,
            Command::SendApdu { .. } => CommandKind::SendApdu,
            Command::AbortApdu { .. } => CommandKind::AbortApdu,
            Command::SendHciEvent { .. } => CommandKind::SendHciEvent,
            Command::AllocateGate { .. } => CommandKind::AllocateGate,
            Command::GatePipeList => CommandKind::GatePipeList,
            Command::WriteRaw { .. } => CommandKind::WriteRaw,
        }
    }
}

/// Scripted answer for the next command of a kind
#[derive(Clone, Debug)]
pub enum Reply {
    /// Deliver these events instead of the default completion.
    Events(Vec<ControllerEvent>),
    /// Accept the command and never complete it.
    Silent,
    /// Reject the command synchronously.
    Reject(CommandError),
}

/// Mock controller stack for testing.
///
/// Records every command, keeps a staged/committed model of the listen-mode
/// routing table and answers each accepted command with its default
/// completion unless a [`Reply`] was scripted for that command kind.
pub struct MockController {
    sink: Mutex<Option<Weak<dyn EventSink>>>,
    sent: Mutex<Vec<Command>>,
    replies: DashMap<CommandKind, VecDeque<Reply>>,
    ees: Mutex<Vec<EeInfo>>,
    ee_info_available: AtomicBool,
    ee_info_calls: AtomicUsize,
    scbr_supported: AtomicBool,
    staged: Mutex<Vec<RoutingEntry>>,
    committed: Mutex<Vec<RoutingEntry>>,
    atr: Mutex<Bytes>,
    apdu_response: Mutex<Bytes>,
    pipes: Mutex<Vec<PipeInfo>>,
    next_t3t: AtomicU16,
    latency: Duration,
}

impl MockController {
    /// Create a new mock controller with no EEs
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            replies: DashMap::new(),
            ees: Mutex::new(Vec::new()),
            ee_info_available: AtomicBool::new(true),
            ee_info_calls: AtomicUsize::new(0),
            scbr_supported: AtomicBool::new(true),
            staged: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            atr: Mutex::new(Bytes::from_static(&[0x3B, 0x8A, 0x80, 0x01])),
            apdu_response: Mutex::new(Bytes::from_static(&[0x90, 0x00])),
            pipes: Mutex::new(Vec::new()),
            next_t3t: AtomicU16::new(1),
            latency: Duration::ZERO,
        }
    }

    /// Configure the discovered EEs
    pub fn with_ees(self, ees: Vec<EeInfo>) -> Self {
        *self.ees.lock() = ees;
        self
    }

    /// Deliver completions from a spawned task after `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reject system-code routing as unsupported
    pub fn without_system_code_routing(self) -> Self {
        self.scbr_supported.store(false, Ordering::Relaxed);
        self
    }

    /// ATR returned by a successful abort
    pub fn with_atr(self, atr: &[u8]) -> Self {
        *self.atr.lock() = Bytes::copy_from_slice(atr);
        self
    }

    /// Response returned to every APDU
    pub fn with_apdu_response(self, response: &[u8]) -> Self {
        *self.apdu_response.lock() = Bytes::copy_from_slice(response);
        self
    }

    /// Pipes reported by the gate/pipe list
    pub fn with_pipes(self, pipes: Vec<PipeInfo>) -> Self {
        *self.pipes.lock() = pipes;
        self
    }

    /// Queue a scripted reply for the next command of `kind`
    pub fn reply(&self, kind: CommandKind, reply: Reply) {
        self.replies.entry(kind).or_default().push_back(reply);
    }

    /// Inject an unsolicited event
    pub fn emit(&self, event: ControllerEvent) {
        self.deliver(vec![event]);
    }

    /// Get sent commands
    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().clone()
    }

    /// Get sent commands of one kind
    pub fn sent_of(&self, kind: CommandKind) -> Vec<Command> {
        self.sent.lock().iter().filter(|c| c.kind() == kind).cloned().collect()
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.sent.lock().iter().filter(|c| c.kind() == kind).count()
    }

    /// Clear sent commands
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn ees(&self) -> Vec<EeInfo> {
        self.ees.lock().clone()
    }

    pub fn set_ee_status(&self, handle: EeHandle, status: EeStatus) {
        if let Some(ee) = self.ees.lock().iter_mut().find(|ee| ee.handle == handle) {
            ee.status = status;
        }
    }

    /// Simulate a failing EE info query
    pub fn set_ee_info_available(&self, available: bool) {
        self.ee_info_available.store(available, Ordering::Relaxed);
    }

    pub fn ee_info_calls(&self) -> usize {
        self.ee_info_calls.load(Ordering::Relaxed)
    }

    pub fn staged_routes(&self) -> Vec<RoutingEntry> {
        self.staged.lock().clone()
    }

    /// Routes pushed by the last routing update
    pub fn committed_routes(&self) -> Vec<RoutingEntry> {
        self.committed.lock().clone()
    }

    fn dispatch(&self, command: Command) -> Result<(), CommandError> {
        let kind = command.kind();
        self.sent.lock().push(command.clone());

        let scripted = self.replies.get_mut(&kind).and_then(|mut queue| queue.pop_front());
        let events = match scripted {
            Some(Reply::Reject(e)) => return Err(e),
            Some(Reply::Silent) => Vec::new(),
            Some(Reply::Events(events)) => events,
            None => self.default_reply(&command)?,
        };

        self.deliver(events);
        Ok(())
    }

    fn default_reply(&self, command: &Command) -> Result<Vec<ControllerEvent>, CommandError> {
        let ok = NfcStatus::Ok;
        let event = match command {
            Command::RequestDiscovery => ControllerEvent::EeDiscovered(self.ees()),
            Command::ModeSet { handle, enable } => {
                let mut ees = self.ees.lock();
                let event = match ees.iter_mut().find(|ee| ee.handle == *handle) {
                    Some(ee) => {
                        ee.status = if *enable { EeStatus::Active } else { EeStatus::Inactive };
                        ControllerEvent::ModeSet { handle: *handle, status: ok, ee_status: ee.status }
                    }
                    None => ControllerEvent::ModeSet {
                        handle: *handle,
                        status: NfcStatus::Failed,
                        ee_status: EeStatus::Removed,
                    },
                };
                event
            }
            Command::PowerLink { handle, .. } => ControllerEvent::PowerLinkSet { handle: *handle, status: ok },
            Command::AddAid { handle, aid, power, info } => {
                let mut staged = self.staged.lock();
                staged.retain(|e| !matches!(e, RoutingEntry::Aid { aid: a, .. } if a[..] == aid[..]));
                staged.push(RoutingEntry::Aid {
                    aid: Bytes::copy_from_slice(aid),
                    info: *info,
                    destination: *handle,
                    power: *power,
                });
                ControllerEvent::AidAdded { status: ok }
            }
            Command::RemoveAid { aid } => {
                let mut staged = self.staged.lock();
                let before = staged.len();
                staged.retain(|e| !matches!(e, RoutingEntry::Aid { aid: a, .. } if a[..] == aid[..]));
                let status = if staged.len() < before { ok } else { NfcStatus::Failed };
                ControllerEvent::AidRemoved { status }
            }
            Command::SetTechRoute { handle, technology, power } => {
                let mut staged = self.staged.lock();
                for bit in technology.iter() {
                    staged.retain(|e| {
                        !matches!(e, RoutingEntry::Technology { technology: t, destination, .. }
                            if *destination == *handle && *t == bit)
                    });
                    staged.push(RoutingEntry::Technology { technology: bit, destination: *handle, power: *power });
                }
                ControllerEvent::RouteConfigured { status: ok }
            }
            Command::ClearTechRoute { handle, technology } => {
                self.staged.lock().retain(|e| {
                    !matches!(e, RoutingEntry::Technology { technology: t, destination, .. }
                        if *destination == *handle && technology.contains(*t))
                });
                ControllerEvent::RouteConfigured { status: ok }
            }
            Command::SetProtoRoute { handle, protocol, power } => {
                let mut staged = self.staged.lock();
                for bit in protocol.iter() {
                    staged.retain(|e| {
                        !matches!(e, RoutingEntry::Protocol { protocol: p, destination, .. }
                            if *destination == *handle && *p == bit)
                    });
                    staged.push(RoutingEntry::Protocol { protocol: bit, destination: *handle, power: *power });
                }
                ControllerEvent::RouteConfigured { status: ok }
            }
            Command::ClearProtoRoute { handle, protocol } => {
                self.staged.lock().retain(|e| {
                    !matches!(e, RoutingEntry::Protocol { protocol: p, destination, .. }
                        if *destination == *handle && protocol.contains(*p))
                });
                ControllerEvent::RouteConfigured { status: ok }
            }
            Command::AddSystemCode { handle, system_code, power } => {
                if !self.scbr_supported.load(Ordering::Relaxed) {
                    return Err(CommandError::NotSupported);
                }
                let mut staged = self.staged.lock();
                staged.retain(|e| !matches!(e, RoutingEntry::SystemCode { system_code: c, .. } if c == system_code));
                staged.push(RoutingEntry::SystemCode {
                    system_code: *system_code,
                    destination: *handle,
                    power: *power,
                });
                ControllerEvent::RouteConfigured { status: ok }
            }
            Command::RemoveSystemCode { system_code } => {
                if !self.scbr_supported.load(Ordering::Relaxed) {
                    return Err(CommandError::NotSupported);
                }
                self.staged
                    .lock()
                    .retain(|e| !matches!(e, RoutingEntry::SystemCode { system_code: c, .. } if c == system_code));
                ControllerEvent::RouteConfigured { status: ok }
            }
            Command::ListenTech { .. } => ControllerEvent::RouteConfigured { status: ok },
            Command::UpdateRouting => {
                *self.committed.lock() = self.staged.lock().clone();
                ControllerEvent::RoutingUpdated { status: ok }
            }
            Command::GetListenRouting => match encode_entries(&self.committed.lock()) {
                Ok(tlvs) => ControllerEvent::ListenRouting { status: ok, tlvs },
                Err(_) => ControllerEvent::ListenRouting { status: NfcStatus::Failed, tlvs: Bytes::new() },
            },
            Command::RegisterT3t { .. } => ControllerEvent::T3tRegistered {
                status: ok,
                handle: self.next_t3t.fetch_add(1, Ordering::Relaxed),
            },
            Command::DeregisterT3t { .. } => ControllerEvent::T3tDeregistered { status: ok },
            Command::RfDiscovery { enable } => ControllerEvent::RfDiscovery { status: ok, started: *enable },
            Command::SendApdu { .. } => ControllerEvent::ApduResponse {
                status: ok,
                data: self.apdu_response.lock().clone(),
            },
            Command::AbortApdu { .. } => ControllerEvent::AbortResponse {
                status: ok,
                data: self.atr.lock().clone(),
            },
            Command::SendHciEvent { .. } => ControllerEvent::HciEventSent { status: ok },
            Command::AllocateGate { gate } => ControllerEvent::GateAllocated { status: ok, gate: *gate },
            Command::GatePipeList => ControllerEvent::PipeList {
                status: ok,
                pipes: self.pipes.lock().clone(),
            },
            Command::WriteRaw { .. } => ControllerEvent::RawResponse {
                status: ok,
                data: Bytes::from_static(SET_CONFIG_OK),
            },
        };
        Ok(vec![event])
    }

    fn deliver(&self, events: Vec<ControllerEvent>) {
        if events.is_empty() {
            return;
        }
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        let Some(sink) = sink else {
            debug!(count = events.len(), "no event sink registered, dropping events");
            return;
        };

        if self.latency.is_zero() {
            for event in events {
                sink.on_event(event);
            }
        } else {
            let latency = self.latency;
            tokio::spawn(async move {
                sleep(latency).await;
                for event in events {
                    sink.on_event(event);
                }
            });
        }
    }
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControllerStack for MockController {
    fn register(&self, sink: Weak<dyn EventSink>) {
        *self.sink.lock() = Some(sink);
    }

    async fn ee_info(&self) -> Result<Vec<EeInfo>, CommandError> {
        self.ee_info_calls.fetch_add(1, Ordering::Relaxed);
        if !self.ee_info_available.load(Ordering::Relaxed) {
            return Err(CommandError::Unavailable);
        }
        Ok(self.ees())
    }

    async fn request_discovery(&self) -> Result<(), CommandError> {
        self.dispatch(Command::RequestDiscovery)
    }

    async fn mode_set(&self, handle: EeHandle, enable: bool) -> Result<(), CommandError> {
        self.dispatch(Command::ModeSet { handle, enable })
    }

    async fn power_link(&self, handle: EeHandle, config: PowerLink) -> Result<(), CommandError> {
        self.dispatch(Command::PowerLink { handle, config })
    }

    async fn add_aid_route(
        &self,
        handle: EeHandle,
        aid: &[u8],
        power: PowerStates,
        info: AidInfo,
    ) -> Result<(), CommandError> {
        self.dispatch(Command::AddAid { handle, aid: aid.to_vec(), power, info })
    }

    async fn remove_aid_route(&self, aid: &[u8]) -> Result<(), CommandError> {
        self.dispatch(Command::RemoveAid { aid: aid.to_vec() })
    }

    async fn set_default_tech_route(
        &self,
        handle: EeHandle,
        technology: TechMask,
        power: PowerStates,
    ) -> Result<(), CommandError> {
        self.dispatch(Command::SetTechRoute { handle, technology, power })
    }

    async fn clear_default_tech_route(&self, handle: EeHandle, technology: TechMask) -> Result<(), CommandError> {
        self.dispatch(Command::ClearTechRoute { handle, technology })
    }

    async fn set_default_proto_route(
        &self,
        handle: EeHandle,
        protocol: ProtoMask,
        power: PowerStates,
    ) -> Result<(), CommandError> {
        self.dispatch(Command::SetProtoRoute { handle, protocol, power })
    }

    async fn clear_default_proto_route(&self, handle: EeHandle, protocol: ProtoMask) -> Result<(), CommandError> {
        self.dispatch(Command::ClearProtoRoute { handle, protocol })
    }

    async fn add_system_code_route(
        &self,
        handle: EeHandle,
        system_code: u16,
        power: PowerStates,
    ) -> Result<(), CommandError> {
        self.dispatch(Command::AddSystemCode { handle, system_code, power })
    }

    async fn remove_system_code_route(&self, system_code: u16) -> Result<(), CommandError> {
        self.dispatch(Command::RemoveSystemCode { system_code })
    }

    async fn set_listen_tech(&self, handle: EeHandle, technology: TechMask) -> Result<(), CommandError> {
        self.dispatch(Command::ListenTech { handle, technology })
    }

    async fn update_routing(&self) -> Result<(), CommandError> {
        self.dispatch(Command::UpdateRouting)
    }

    async fn get_listen_routing(&self) -> Result<(), CommandError> {
        self.dispatch(Command::GetListenRouting)
    }

    async fn register_felica_system_code(
        &self,
        system_code: u16,
        nfcid2: [u8; 8],
        pmm: [u8; 8],
    ) -> Result<(), CommandError> {
        self.dispatch(Command::RegisterT3t { system_code, nfcid2, pmm })
    }

    async fn deregister_felica_system_code(&self, handle: u16) -> Result<(), CommandError> {
        self.dispatch(Command::DeregisterT3t { handle })
    }

    async fn set_rf_discovery(&self, enable: bool) -> Result<(), CommandError> {
        self.dispatch(Command::RfDiscovery { enable })
    }

    async fn send_apdu(&self, handle: EeHandle, apdu: &[u8], _timeout: Duration) -> Result<(), CommandError> {
        self.dispatch(Command::SendApdu { handle, apdu: apdu.to_vec() })
    }

    async fn abort_apdu(&self, handle: EeHandle, _timeout: Duration) -> Result<(), CommandError> {
        self.dispatch(Command::AbortApdu { handle })
    }

    async fn send_hci_event(&self, pipe: u8, event: u8) -> Result<(), CommandError> {
        self.dispatch(Command::SendHciEvent { pipe, event })
    }

    async fn allocate_gate(&self, gate: u8) -> Result<(), CommandError> {
        self.dispatch(Command::AllocateGate { gate })
    }

    async fn gate_pipe_list(&self) -> Result<(), CommandError> {
        self.dispatch(Command::GatePipeList)
    }

    async fn write_raw(&self, command: &[u8]) -> Result<(), CommandError> {
        self.dispatch(Command::WriteRaw { command: command.to_vec() })
    }
}
