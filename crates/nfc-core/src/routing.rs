//! Listen-mode routing table manager.
//!
//! Computes technology, protocol, system-code and AID routes from the
//! configuration and the EE directory, stages them in the controller and
//! commits them with a single routing update.
//!
//! Every controller command is awaited: the manager arms the waiter of the
//! command's completion kind, issues the command and waits for the
//! acknowledgment with a bound. Rejections and failed completions surface
//! to the caller and are never retried here.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use nfc_hal::{
    decode_entries, AidInfo, CommandError, ControllerStack, EeHandle, EntryKind, NfcStatus, PowerStates,
    ProtoMask, RoutingEntry, TechMask, NCI_MAX_AID_LEN,
};

use crate::config::NfcConfig;
use crate::directory::Directory;
use crate::errors::RoutingError;
use crate::table::RoutingTable;
use crate::types::{AidMatchingMode, FallbackPolicy, GenericSeId, NciVersion};
use crate::waiter::Waiter;

/// Off-host protocol routes: every state but battery-off.
const OFFHOST_PROTO_POWER: PowerStates = PowerStates::SWITCH_ON
    .union(PowerStates::SWITCH_OFF)
    .union(PowerStates::SCREEN_LOCK)
    .union(PowerStates::SCREEN_OFF)
    .union(PowerStates::SCREEN_OFF_LOCK);

/// Power of system codes registered on the host for T3T emulation.
const HOST_SYSTEM_CODE_POWER: PowerStates = PowerStates::SWITCH_ON;

/// System code, NFCID2 and PMm.
const T3T_IDENTIFIER_LEN: usize = 18;

/// Effective power of an AID entry.
///
/// An empty request selects the destination's default. Host entries never
/// keep switch-off or battery-off; off-host entries are capped by the
/// configured ceiling. Secure mode leaves only switch-on.
pub fn effective_aid_power(is_host: bool, requested: PowerStates, ceiling: PowerStates, secure: bool) -> PowerStates {
    if secure {
        return PowerStates::SWITCH_ON;
    }
    match (is_host, requested.is_empty()) {
        (true, true) => PowerStates::HOST_DEFAULT,
        (true, false) => requested.for_host(),
        (false, true) => ceiling,
        (false, false) => requested.capped(ceiling),
    }
}

pub struct RoutingManager {
    controller: Arc<dyn ControllerStack>,
    directory: Arc<Directory>,
    config: NfcConfig,
    table: Mutex<RoutingTable>,

    // Completion waiters, one per completion kind
    route: Waiter<NfcStatus>,
    aid: Waiter<NfcStatus>,
    update: Waiter<NfcStatus>,
    listen: Waiter<(NfcStatus, Bytes)>,
    t3t: Waiter<(NfcStatus, u16)>,

    // Same-kind callers serialize on these
    route_lock: AsyncMutex<()>,
    aid_lock: AsyncMutex<()>,
    update_lock: AsyncMutex<()>,
    /// Multi-command table recomputations.
    table_lock: AsyncMutex<()>,

    secure: AtomicBool,
    /// System-code based routing support, probed once.
    scbr: RwLock<Option<bool>>,
    se_techs: RwLock<TechMask>,
    /// T3T registration handle to its routed system code.
    t3t_handles: DashMap<u16, u16>,
    ce_buffer: Mutex<BytesMut>,
    timeout: Duration,
}

impl RoutingManager {
    pub fn new(controller: Arc<dyn ControllerStack>, directory: Arc<Directory>, config: &NfcConfig) -> Self {
        Self {
            controller,
            directory,
            config: config.clone(),
            table: Mutex::new(RoutingTable::new()),
            route: Waiter::new("route configuration"),
            aid: Waiter::new("aid routing"),
            update: Waiter::new("routing update"),
            listen: Waiter::new("listen routing"),
            t3t: Waiter::new("t3t registration"),
            route_lock: AsyncMutex::new(()),
            aid_lock: AsyncMutex::new(()),
            update_lock: AsyncMutex::new(()),
            table_lock: AsyncMutex::new(()),
            secure: AtomicBool::new(false),
            scbr: RwLock::new(None),
            se_techs: RwLock::new(TechMask::empty()),
            t3t_handles: DashMap::new(),
            ce_buffer: Mutex::new(BytesMut::new()),
            timeout: config.completion_timeout(),
        }
    }

    // ========================================================================
    // Startup and full recomputation
    // ========================================================================

    /// Initial routing setup: waits for the first EE discovery when an SE is
    /// meant to own technologies, then computes every default route.
    pub async fn initialize(&self) -> Result<(), RoutingError> {
        let _guard = self.table_lock.lock().await;

        if self.config.has_offhost_route() && !self.directory.wait_for_discovery(self.config.recovery_timeout()).await {
            warn!("initializing routing without ee discovery");
            self.directory.refresh().await;
        }

        let iso_dep_techs = self.config.host_listen_tech_mask & (TechMask::A | TechMask::B);
        if !iso_dep_techs.is_empty() {
            if let Err(e) = self
                .configure("host iso-dep listen", self.controller.set_listen_tech(EeHandle::HOST, iso_dep_techs))
                .await
            {
                error!(error = %e, "failed to configure host iso-dep technologies");
            }
        }

        self.recompute().await
    }

    /// Technology, system-code, empty-AID and protocol routes, recomputed
    /// from scratch. Used after discovery changes.
    pub async fn update_routing_table(&self) -> Result<(), RoutingError> {
        let _guard = self.table_lock.lock().await;
        self.recompute().await
    }

    async fn recompute(&self) -> Result<(), RoutingError> {
        let techs = self.compute_technology_routes().await;
        let default = self.update_default_route().await;
        let proto = self.compute_default_protocol_route().await.map(|_| ());
        techs.map(|_| ()).and(default).and(proto)
    }

    // ========================================================================
    // Technology routes
    // ========================================================================

    /// Install technology routes on the SEs configured to own them.
    ///
    /// Returns the union of technologies now owned by SEs. The host loses
    /// the owned technologies it listens on; any other previous holder
    /// loses its entry.
    pub async fn compute_technology_routes(&self) -> Result<TechMask, RoutingError> {
        self.directory.take_dirty();

        let offhost = self.config.default_offhost_route.map(|g| self.directory.resolve(g));
        let felica = self.config.default_felica_route.map(|g| self.directory.resolve(g));
        if offhost.is_none() && felica.is_none() {
            return Ok(TechMask::empty());
        }

        let power = if self.is_secure() {
            PowerStates::SWITCH_ON
        } else {
            PowerStates::SWITCHED_ON_ANY.capped(self.config.offhost_aid_power_ceiling)
        };

        let mut owned = TechMask::empty();
        let mut first_error = None;

        for ee in self.directory.list().await {
            if ee.handle.is_host() {
                continue;
            }
            let mut techs = TechMask::empty();
            if offhost == Some(ee.handle) {
                techs |= ee.technologies & (TechMask::A | TechMask::B);
            }
            if felica == Some(ee.handle) {
                techs |= ee.technologies & TechMask::F;
            }
            techs &= self.config.offhost_listen_tech_mask;
            if techs.is_empty() {
                continue;
            }

            info!(handle = %ee.handle, technologies = ?techs, "routing technologies off host");
            if let Err(e) = self.configure("ee listen tech", self.controller.set_listen_tech(ee.handle, techs)).await {
                error!(handle = %ee.handle, error = %e, "failed to configure ee listen technologies");
            }
            if let Err(e) = self.clear_tech_entry(ee.handle, techs).await {
                error!(handle = %ee.handle, error = %e, "failed to clear ee technology routing");
            }
            match self.set_tech_entry(ee.handle, techs, power).await {
                Ok(()) => owned |= techs,
                Err(e) => {
                    error!(handle = %ee.handle, error = %e, "failed to configure ee technology routing");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !owned.is_empty() {
            let host_owned = owned & self.config.host_listen_tech_mask;
            if !host_owned.is_empty() {
                if let Err(e) = self.clear_tech_entry(EeHandle::HOST, host_owned).await {
                    error!(technologies = ?host_owned, error = %e, "failed to clear host technology routing");
                    first_error.get_or_insert(e);
                }
            }
            self.release_technologies(owned, offhost, felica).await;
        }

        *self.se_techs.write() = owned;
        match first_error {
            Some(e) => Err(e),
            None => Ok(owned),
        }
    }

    /// Clear stale holders of SE-owned technologies.
    async fn release_technologies(&self, owned: TechMask, offhost: Option<EeHandle>, felica: Option<EeHandle>) {
        let holders = self.table.lock().technology_holders(owned);
        for (handle, held) in holders {
            let mut stale = held;
            if offhost == Some(handle) {
                stale = stale - (TechMask::A | TechMask::B);
            }
            if felica == Some(handle) {
                stale = stale - TechMask::F;
            }
            if stale.is_empty() {
                continue;
            }
            debug!(handle = %handle, technologies = ?stale, "releasing technologies owned elsewhere");
            if let Err(e) = self.clear_tech_entry(handle, stale).await {
                warn!(handle = %handle, error = %e, "failed to release technology routing");
            }
        }
    }

    // ========================================================================
    // Protocol routes
    // ========================================================================

    /// Route ISO-DEP to its configured destination, or its fallback.
    ///
    /// A non-host destination without technology A or B cannot carry
    /// ISO-DEP; it is rejected and the host takes the route. T3T is routed
    /// by protocol only when the controller lacks system-code routing.
    pub async fn compute_default_protocol_route(&self) -> Result<EeHandle, RoutingError> {
        let secure = self.is_secure();

        let Some(mut handle) = self.check_and_update_alt_route(self.config.default_isodep_route).await else {
            warn!("iso-dep left unrouted, no destination available");
            return Err(RoutingError::Unrouted("iso-dep"));
        };

        if !handle.is_host() && !self.directory.capabilities(handle).await.0.supports_iso_dep() {
            let rejected = RoutingError::MissingIsoDepTech(handle);
            warn!(error = %rejected, "rejecting iso-dep route, routing to host");
            handle = EeHandle::HOST;
        }

        let power = match (secure, handle.is_host()) {
            (true, _) => PowerStates::SWITCH_ON,
            (false, true) => PowerStates::HOST_DEFAULT,
            (false, false) => OFFHOST_PROTO_POWER,
        };

        let holders = self.table.lock().protocol_holders(ProtoMask::ISO_DEP);
        for holder in holders.into_iter().filter(|h| *h != handle) {
            if let Err(e) = self.clear_proto_entry(holder, ProtoMask::ISO_DEP).await {
                warn!(handle = %holder, error = %e, "failed to clear previous iso-dep route");
            }
        }
        if let Err(e) = self.clear_proto_entry(handle, ProtoMask::ISO_DEP).await {
            debug!(handle = %handle, error = %e, "no iso-dep route to clear");
        }
        self.set_proto_entry(handle, ProtoMask::ISO_DEP, power).await?;
        info!(handle = %handle, power = %power, "default iso-dep route installed");

        if *self.scbr.read() == Some(false) {
            self.route_t3t_by_protocol(secure).await?;
        }

        Ok(handle)
    }

    async fn route_t3t_by_protocol(&self, secure: bool) -> Result<(), RoutingError> {
        let handle = self.directory.resolve(self.config.default_route);
        if handle.is_host() {
            return self.set_proto_entry(EeHandle::HOST, ProtoMask::T3T, PowerStates::SWITCH_ON).await;
        }
        let power = if secure {
            PowerStates::SWITCH_ON
        } else {
            PowerStates::SWITCHED_ON_ANY
        };
        if let Err(e) = self.clear_proto_entry(handle, ProtoMask::T3T).await {
            debug!(handle = %handle, error = %e, "no t3t route to clear");
        }
        self.set_proto_entry(handle, ProtoMask::T3T, power).await
    }

    /// Resolve a destination, applying the fallback policy when it is not
    /// active. Probes at most the target and the embedded SE.
    pub async fn check_and_update_alt_route(&self, route: GenericSeId) -> Option<EeHandle> {
        if route == GenericSeId::Host {
            return Some(EeHandle::HOST);
        }
        let handle = self.directory.resolve(route);
        if self.directory.is_active(handle).await {
            return Some(handle);
        }

        debug!(%route, policy = ?self.config.fallback_policy, "destination inactive, applying fallback");
        match self.config.fallback_policy {
            FallbackPolicy::Disabled => None,
            FallbackPolicy::Host => Some(EeHandle::HOST),
            FallbackPolicy::EmbeddedSe => {
                if route != GenericSeId::EmbeddedSe && self.directory.is_active(EeHandle::ESE).await {
                    Some(EeHandle::ESE)
                } else {
                    Some(EeHandle::HOST)
                }
            }
        }
    }

    // ========================================================================
    // Default routes (NCI 2.0)
    // ========================================================================

    /// Default system code and, when the default route differs from the
    /// ISO-DEP route, the empty-AID catch-all.
    ///
    /// The first system-code route doubles as the probe for system-code
    /// based routing support.
    pub async fn update_default_route(&self) -> Result<(), RoutingError> {
        if self.config.nci_version != NciVersion::V2 {
            return Ok(());
        }
        let secure = self.is_secure();

        if *self.scbr.read() != Some(false) {
            let handle = self.directory.resolve(self.config.default_syscode_route);
            let mut power = self.config.default_syscode_power;
            if handle.is_host() {
                power = power.for_host();
            }
            if secure {
                power = power & PowerStates::SWITCH_ON;
            }

            match self.add_syscode_entry(self.config.default_system_code, handle, power).await {
                Ok(()) => {
                    self.scbr.write().get_or_insert(true);
                    debug!(system_code = format_args!("{:#06x}", self.config.default_system_code), "default system code routed");
                }
                Err(RoutingError::Command(CommandError::NotSupported)) => {
                    info!("system-code based routing not supported");
                    *self.scbr.write() = Some(false);
                }
                Err(e) => {
                    error!(error = %e, "failed to route default system code");
                    self.scbr.write().get_or_insert(true);
                }
            }
        }

        if self.config.default_route != self.config.default_isodep_route {
            let power = if self.directory.resolve(self.config.default_route).is_host() {
                PowerStates::HOST_DEFAULT
            } else {
                self.config.offhost_aid_power_ceiling
            };
            self.set_empty_aid_entry(self.config.default_route, power).await?;
        }
        Ok(())
    }

    /// Install the zero-length AID catch-all at `route`.
    ///
    /// Skipped for destinations supporting neither technology A nor B.
    pub async fn set_empty_aid_entry(&self, route: GenericSeId, power: PowerStates) -> Result<(), RoutingError> {
        let handle = self.directory.resolve(route);
        if !handle.is_host() && !self.directory.capabilities(handle).await.0.supports_iso_dep() {
            debug!(handle = %handle, "skipping empty aid, no technology A or B");
            return Ok(());
        }

        let effective = effective_aid_power(
            handle.is_host(),
            power,
            self.config.offhost_aid_power_ceiling,
            self.is_secure(),
        );
        if power.is_empty() || effective.is_empty() {
            error!(handle = %handle, power = %power, "invalid power state for empty aid");
            return Err(RoutingError::InvalidPower(power.bits()));
        }

        self.add_aid_entry(handle, &[], effective, AidInfo::PREFIX).await
    }

    // ========================================================================
    // AID routes
    // ========================================================================

    pub async fn add_aid_route(
        &self,
        aid: &[u8],
        route: GenericSeId,
        power: PowerStates,
        info: AidInfo,
    ) -> Result<(), RoutingError> {
        if aid.len() > NCI_MAX_AID_LEN {
            return Err(RoutingError::InvalidAid(aid.len()));
        }
        let handle = self.directory.resolve(route);
        let effective = effective_aid_power(
            handle.is_host(),
            power,
            self.config.offhost_aid_power_ceiling,
            self.is_secure(),
        );
        if effective.is_empty() {
            warn!(aid = %hex::encode(aid), power = %power, "aid power routes nothing");
            return Err(RoutingError::InvalidPower(power.bits()));
        }

        self.add_aid_entry(handle, aid, effective, info).await
    }

    async fn add_aid_entry(
        &self,
        handle: EeHandle,
        aid: &[u8],
        power: PowerStates,
        info: AidInfo,
    ) -> Result<(), RoutingError> {
        let _guard = self.aid_lock.lock().await;
        self.await_completion(&self.aid, "add aid", self.controller.add_aid_route(handle, aid, power, info))
            .await?;
        self.table.lock().upsert_aid(aid, info, handle, power);
        debug!(aid = %hex::encode(aid), handle = %handle, power = %power, "routed aid");
        Ok(())
    }

    pub async fn remove_aid_route(&self, aid: &[u8]) -> Result<(), RoutingError> {
        let _guard = self.aid_lock.lock().await;
        self.await_completion(&self.aid, "remove aid", self.controller.remove_aid_route(aid))
            .await?;
        self.table.lock().remove_aid(aid);
        debug!(aid = %hex::encode(aid), "removed aid");
        Ok(())
    }

    async fn clear_aid_table(&self) -> Result<(), RoutingError> {
        let aids = self.table.lock().aids();
        let mut result = Ok(());
        for aid in aids {
            if let Err(e) = self.remove_aid_route(&aid).await {
                warn!(aid = %hex::encode(&aid), error = %e, "failed to clear aid");
                result = Err(e);
            }
        }
        result
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Push the staged table with one routing update and wait for it.
    ///
    /// Technology routes are recomputed first if discovery changed since
    /// they were last computed.
    pub async fn commit(&self) -> Result<(), RoutingError> {
        let _guard = self.update_lock.lock().await;

        if self.directory.is_dirty() {
            info!("ee discovery changed, recomputing technology routes");
            let _table = self.table_lock.lock().await;
            if let Err(e) = self.compute_technology_routes().await {
                warn!(error = %e, "technology routes incomplete");
            }
        }

        self.await_completion(&self.update, "routing update", self.controller.update_routing())
            .await?;
        debug!("routing committed");
        Ok(())
    }

    // ========================================================================
    // Host routing
    // ========================================================================

    /// Default host routes: ISO-DEP when the host is its default, T3T when
    /// routed by protocol, and every host listen technology no SE owns.
    pub async fn enable_routing_to_host(&self) -> Result<(), RoutingError> {
        let _guard = self.table_lock.lock().await;
        let secure = self.is_secure();
        let mut result = Ok(());

        if self.t3t_by_protocol_on_host() {
            if let Err(e) = self
                .set_proto_entry(EeHandle::HOST, ProtoMask::T3T, PowerStates::SWITCH_ON)
                .await
            {
                error!(error = %e, "failed to route t3t to host");
                result = Err(e);
            }
        }

        if self.config.default_isodep_route == GenericSeId::Host {
            let power = if secure {
                PowerStates::SWITCH_ON
            } else {
                PowerStates::HOST_DEFAULT
            };
            if let Err(e) = self.set_proto_entry(EeHandle::HOST, ProtoMask::ISO_DEP, power).await {
                error!(error = %e, "failed to route iso-dep to host");
                result = Err(e);
            }
        }

        let techs = self.host_only_techs();
        if !techs.is_empty() {
            let power = if secure {
                PowerStates::SWITCH_ON
            } else {
                PowerStates::SWITCHED_ON_ANY
            };
            if let Err(e) = self.set_tech_entry(EeHandle::HOST, techs, power).await {
                error!(technologies = ?techs, error = %e, "failed to route technologies to host");
                result = Err(e);
            }
        }
        result
    }

    pub async fn disable_routing_to_host(&self) -> Result<(), RoutingError> {
        let _guard = self.table_lock.lock().await;
        let mut result = Ok(());

        if self.config.default_isodep_route == GenericSeId::Host {
            if let Err(e) = self.clear_proto_entry(EeHandle::HOST, ProtoMask::ISO_DEP).await {
                error!(error = %e, "failed to clear host iso-dep route");
                result = Err(e);
            }
        }

        let techs = self.host_only_techs();
        if !techs.is_empty() {
            if let Err(e) = self.clear_tech_entry(EeHandle::HOST, techs).await {
                error!(technologies = ?techs, error = %e, "failed to clear host technology routes");
                result = Err(e);
            }
        }

        if self.t3t_by_protocol_on_host() {
            if let Err(e) = self.clear_proto_entry(EeHandle::HOST, ProtoMask::T3T).await {
                error!(error = %e, "failed to clear host t3t route");
                result = Err(e);
            }
        }
        result
    }

    fn host_only_techs(&self) -> TechMask {
        self.config.host_listen_tech_mask - *self.se_techs.read()
    }

    fn t3t_by_protocol_on_host(&self) -> bool {
        *self.scbr.read() == Some(false) && self.directory.resolve(self.config.default_route).is_host()
    }

    // ========================================================================
    // Generic entry mutation
    // ========================================================================

    /// Clear every entry of one category across the host and all usable EEs.
    pub async fn clear_routing_entry(&self, kind: EntryKind) -> Result<(), RoutingError> {
        let _guard = self.table_lock.lock().await;
        let mut handles = self.directory.ee_handle_list().await;
        handles.push(EeHandle::HOST);
        let mut result = Ok(());

        match kind {
            EntryKind::Technology => {
                for handle in handles {
                    if let Err(e) = self.clear_tech_entry(handle, TechMask::all()).await {
                        result = Err(e);
                    }
                }
            }
            EntryKind::Protocol => {
                for handle in handles {
                    if let Err(e) = self.clear_proto_entry(handle, ProtoMask::ISO_DEP).await {
                        result = Err(e);
                    }
                }
            }
            EntryKind::Aid => result = self.clear_aid_table().await,
            EntryKind::SystemCode => {
                let codes = self.table.lock().system_codes();
                for code in codes {
                    if let Err(e) = self.remove_syscode_entry(code).await {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Install one entry of `kind` at `route` (after fallback).
    ///
    /// `value` is a technology or protocol mask, or a system code. AID
    /// entries install the empty-AID catch-all.
    pub async fn set_routing_entry(
        &self,
        kind: EntryKind,
        value: u16,
        route: GenericSeId,
        power: PowerStates,
    ) -> Result<(), RoutingError> {
        let _guard = self.table_lock.lock().await;
        let Some(handle) = self.check_and_update_alt_route(route).await else {
            return Err(RoutingError::Unrouted("routing entry"));
        };
        let power = if self.is_secure() {
            power & PowerStates::SWITCH_ON
        } else {
            power
        };

        match kind {
            EntryKind::Technology => {
                let supported = self.directory.capabilities(handle).await.0;
                let techs = TechMask::from_bits_truncate(value as u8) & supported;
                if techs.is_empty() {
                    debug!(handle = %handle, "no supported technology to route");
                    return Ok(());
                }
                let holders = self.table.lock().technology_holders(techs);
                for (holder, held) in holders.into_iter().filter(|(h, _)| *h != handle) {
                    self.clear_tech_entry(holder, held & techs).await?;
                }
                self.set_tech_entry(handle, techs, power).await
            }
            EntryKind::Protocol => {
                let protocol = ProtoMask::from_bits_truncate(value as u8);
                let power = if handle.is_host() { power.for_host() } else { power };
                if protocol.contains(ProtoMask::ISO_DEP)
                    && !handle.is_host()
                    && !self.directory.capabilities(handle).await.0.supports_iso_dep()
                {
                    warn!(handle = %handle, "rejecting iso-dep entry");
                    return Err(RoutingError::MissingIsoDepTech(handle));
                }
                self.set_proto_entry(handle, protocol, power).await
            }
            EntryKind::Aid => {
                let generic = self.directory.generic_for(handle).unwrap_or(GenericSeId::Host);
                self.set_empty_aid_entry(generic, power).await
            }
            EntryKind::SystemCode => {
                let power = if handle.is_host() { power.for_host() } else { power };
                self.add_syscode_entry(value, handle, power).await
            }
        }
    }

    // ========================================================================
    // T3T (Felica) identifiers
    // ========================================================================

    /// Register a Felica system code on the host and route it there.
    ///
    /// `identifier` is system code (2) || NFCID2 (8) || PMm (8).
    pub async fn register_t3t_identifier(&self, identifier: &[u8]) -> Result<u16, RoutingError> {
        if identifier.len() != T3T_IDENTIFIER_LEN {
            return Err(RoutingError::InvalidT3tIdentifier(identifier.len()));
        }
        let system_code = u16::from_be_bytes([identifier[0], identifier[1]]);
        let mut nfcid2 = [0u8; 8];
        let mut pmm = [0u8; 8];
        nfcid2.copy_from_slice(&identifier[2..10]);
        pmm.copy_from_slice(&identifier[10..18]);

        let handle = {
            let _guard = self.route_lock.lock().await;
            let pending = self.t3t.arm();
            self.controller.register_felica_system_code(system_code, nfcid2, pmm).await?;
            let (status, handle) = pending.wait(self.timeout).await?;
            if !status.is_ok() {
                error!(?status, "failed to register nfc-f system on host");
                return Err(RoutingError::Failed { op: "register t3t", status });
            }
            handle
        };
        debug!(handle, system_code = format_args!("{:#06x}", system_code), "registered nfc-f system on host");

        if *self.scbr.read() != Some(false) {
            self.add_syscode_entry(system_code, EeHandle::HOST, HOST_SYSTEM_CODE_POWER).await?;
            self.t3t_handles.insert(handle, system_code);
        }
        Ok(handle)
    }

    pub async fn deregister_t3t_identifier(&self, handle: u16) -> Result<(), RoutingError> {
        {
            let _guard = self.route_lock.lock().await;
            let pending = self.t3t.arm();
            self.controller.deregister_felica_system_code(handle).await?;
            let (status, _) = pending.wait(self.timeout).await?;
            if !status.is_ok() {
                error!(handle, ?status, "failed to deregister nfc-f system on host");
                return Err(RoutingError::Failed { op: "deregister t3t", status });
            }
        }

        match self.t3t_handles.remove(&handle) {
            Some((_, system_code)) => self.remove_syscode_entry(system_code).await,
            None if *self.scbr.read() == Some(false) => Ok(()),
            None => Err(RoutingError::UnknownT3tHandle(handle)),
        }
    }

    // ========================================================================
    // Shutdown and read-back
    // ========================================================================

    /// Deactivate every active EE reachable over a non-HCI interface.
    pub async fn on_nfcc_shutdown(&self) {
        if !self.config.has_offhost_route() {
            return;
        }
        let ees = match self.controller.ee_info().await {
            Ok(ees) => ees,
            Err(e) => {
                error!(error = %e, "failed to get ee info on shutdown");
                return;
            }
        };
        for ee in ees.iter().filter(|ee| ee.is_active() && !ee.hci_access_only && !ee.handle.is_host()) {
            debug!(handle = %ee.handle, "deactivating ee for shutdown");
            if let Err(e) = self.directory.set_mode(ee.handle, false).await {
                error!(handle = %ee.handle, error = %e, "failed to set ee inactive");
            }
        }
    }

    /// Read back the controller's committed table. NFC-DEP entries are not
    /// reported.
    pub async fn listen_routing(&self) -> Result<Vec<RoutingEntry>, RoutingError> {
        let (status, tlvs) = {
            let _guard = self.route_lock.lock().await;
            let pending = self.listen.arm();
            self.controller.get_listen_routing().await?;
            pending.wait(self.timeout).await?
        };
        if !status.is_ok() {
            return Err(RoutingError::Failed { op: "get listen routing", status });
        }

        let entries = decode_entries(&tlvs)?
            .into_iter()
            .filter(|e| !matches!(e, RoutingEntry::Protocol { protocol, .. } if *protocol == ProtoMask::NFC_DEP))
            .collect();
        Ok(entries)
    }

    // ========================================================================
    // Card emulation data
    // ========================================================================

    /// Accumulate card-emulation data; returns the packet once complete.
    pub fn on_ce_data(&self, status: NfcStatus, data: &[u8], more: bool) -> Option<Bytes> {
        let mut buffer = self.ce_buffer.lock();
        if !status.is_ok() {
            error!(?status, "card emulation data read failed");
            buffer.clear();
            return None;
        }
        buffer.extend_from_slice(data);
        if more {
            return None;
        }
        Some(buffer.split().freeze())
    }

    pub fn on_listen_deactivated(&self) {
        self.ce_buffer.lock().clear();
    }

    // ========================================================================
    // Settings and getters
    // ========================================================================

    pub fn set_nfc_secure(&self, enable: bool) {
        info!(enable, "nfc secure mode");
        self.secure.store(enable, Ordering::Relaxed);
    }

    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Relaxed)
    }

    pub fn scbr_supported(&self) -> Option<bool> {
        *self.scbr.read()
    }

    pub fn se_tech_mask(&self) -> TechMask {
        *self.se_techs.read()
    }

    /// Staged entries as acknowledged by the controller.
    pub fn staged(&self) -> RoutingTable {
        self.table.lock().clone()
    }

    pub fn default_route(&self) -> GenericSeId {
        self.config.default_route
    }

    pub fn default_offhost_route(&self) -> Option<GenericSeId> {
        self.config.default_offhost_route
    }

    pub fn default_isodep_route(&self) -> GenericSeId {
        self.config.default_isodep_route
    }

    pub fn offhost_uicc_destinations(&self) -> &[u8] {
        &self.config.offhost_uicc_destinations
    }

    pub fn offhost_ese_destinations(&self) -> &[u8] {
        &self.config.offhost_ese_destinations
    }

    pub fn aid_matching_mode(&self) -> AidMatchingMode {
        self.config.aid_matching_mode
    }

    // ========================================================================
    // Completions
    // ========================================================================

    pub fn on_route_configured(&self, status: NfcStatus) {
        self.route.complete(status);
    }

    pub fn on_aid_completed(&self, status: NfcStatus) {
        self.aid.complete(status);
    }

    pub fn on_routing_updated(&self, status: NfcStatus) {
        self.update.complete(status);
    }

    pub fn on_listen_routing(&self, status: NfcStatus, tlvs: Bytes) {
        self.listen.complete((status, tlvs));
    }

    pub fn on_t3t_completed(&self, status: NfcStatus, handle: u16) {
        self.t3t.complete((status, handle));
    }

    pub fn release_waiters(&self) {
        self.route.release();
        self.aid.release();
        self.update.release();
        self.listen.release();
        self.t3t.release();
    }

    // ========================================================================
    // Command plumbing
    // ========================================================================

    async fn await_completion<F>(&self, waiter: &Waiter<NfcStatus>, op: &'static str, command: F) -> Result<(), RoutingError>
    where
        F: Future<Output = Result<(), CommandError>>,
    {
        let pending = waiter.arm();
        if let Err(e) = command.await {
            waiter.release();
            warn!(op, error = %e, "routing command rejected");
            return Err(e.into());
        }
        match pending.wait(self.timeout).await {
            Ok(status) if status.is_ok() => Ok(()),
            Ok(status) => {
                warn!(op, ?status, "routing command failed");
                Err(RoutingError::Failed { op, status })
            }
            Err(e) => {
                warn!(op, error = %e, "routing command not acknowledged");
                Err(e.into())
            }
        }
    }

    async fn configure<F>(&self, op: &'static str, command: F) -> Result<(), RoutingError>
    where
        F: Future<Output = Result<(), CommandError>>,
    {
        let _guard = self.route_lock.lock().await;
        self.await_completion(&self.route, op, command).await
    }

    async fn set_tech_entry(&self, handle: EeHandle, techs: TechMask, power: PowerStates) -> Result<(), RoutingError> {
        self.configure("set tech route", self.controller.set_default_tech_route(handle, techs, power))
            .await?;
        self.table.lock().set_technology(handle, techs, power);
        Ok(())
    }

    async fn clear_tech_entry(&self, handle: EeHandle, techs: TechMask) -> Result<(), RoutingError> {
        self.configure("clear tech route", self.controller.clear_default_tech_route(handle, techs))
            .await?;
        self.table.lock().clear_technology(handle, techs);
        Ok(())
    }

    async fn set_proto_entry(&self, handle: EeHandle, protocol: ProtoMask, power: PowerStates) -> Result<(), RoutingError> {
        self.configure("set proto route", self.controller.set_default_proto_route(handle, protocol, power))
            .await?;
        self.table.lock().set_protocol(handle, protocol, power);
        Ok(())
    }

    async fn clear_proto_entry(&self, handle: EeHandle, protocol: ProtoMask) -> Result<(), RoutingError> {
        self.configure("clear proto route", self.controller.clear_default_proto_route(handle, protocol))
            .await?;
        self.table.lock().clear_protocol(handle, protocol);
        Ok(())
    }

    async fn add_syscode_entry(&self, system_code: u16, handle: EeHandle, power: PowerStates) -> Result<(), RoutingError> {
        self.configure("add system code", self.controller.add_system_code_route(handle, system_code, power))
            .await?;
        self.table.lock().set_system_code(system_code, handle, power);
        Ok(())
    }

    async fn remove_syscode_entry(&self, system_code: u16) -> Result<(), RoutingError> {
        self.configure("remove system code", self.controller.remove_system_code_route(system_code))
            .await?;
        self.table.lock().remove_system_code(system_code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_effective_power_defaults() {
        let ceiling = PowerStates::from_bits_truncate(0x3B);
        assert_eq!(
            effective_aid_power(true, PowerStates::empty(), ceiling, false),
            PowerStates::HOST_DEFAULT
        );
        assert_eq!(effective_aid_power(false, PowerStates::empty(), ceiling, false), ceiling);
        assert_eq!(
            effective_aid_power(false, PowerStates::all(), ceiling, true),
            PowerStates::SWITCH_ON
        );
    }

    fn manager() -> RoutingManager {
        let controller: Arc<dyn ControllerStack> = Arc::new(nfc_hal::MockController::new());
        let config = NfcConfig::default();
        let directory = Arc::new(Directory::new(controller.clone(), &config));
        RoutingManager::new(controller, directory, &config)
    }

    #[test]
    fn test_ce_data_reassembly() {
        let routing = manager();
        assert_eq!(routing.on_ce_data(NfcStatus::Ok, &[0x00, 0xA4], true), None);
        assert_eq!(routing.on_ce_data(NfcStatus::Ok, &[0x04, 0x00], true), None);
        assert_eq!(
            routing.on_ce_data(NfcStatus::Ok, &[0x07], false),
            Some(Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00, 0x07]))
        );

        // A failed read drops the partial packet
        routing.on_ce_data(NfcStatus::Ok, &[0x01], true);
        assert_eq!(routing.on_ce_data(NfcStatus::Failed, &[0x02], false), None);
        assert_eq!(
            routing.on_ce_data(NfcStatus::Ok, &[0x03], false),
            Some(Bytes::from_static(&[0x03]))
        );

        routing.on_ce_data(NfcStatus::Ok, &[0x04], true);
        routing.on_listen_deactivated();
        assert_eq!(
            routing.on_ce_data(NfcStatus::Ok, &[0x05], false),
            Some(Bytes::from_static(&[0x05]))
        );
    }

    #[tokio::test]
    async fn test_oversized_aid_rejected_before_any_command() {
        let routing = manager();
        let aid = [0xA0u8; 17];
        let result = routing
            .add_aid_route(&aid, GenericSeId::Host, PowerStates::empty(), AidInfo::empty())
            .await;
        assert_eq!(result, Err(RoutingError::InvalidAid(17)));
    }

    #[tokio::test]
    async fn test_short_t3t_identifier_rejected() {
        let routing = manager();
        assert_eq!(
            routing.register_t3t_identifier(&[0x12, 0xFC]).await,
            Err(RoutingError::InvalidT3tIdentifier(2))
        );
    }

    proptest! {
        #[test]
        fn prop_offhost_power_is_request_and_ceiling(requested in 1u8..=0x3F, ceiling in 1u8..=0x3F) {
            let requested = PowerStates::from_bits_truncate(requested);
            let ceiling = PowerStates::from_bits_truncate(ceiling);
            prop_assert_eq!(effective_aid_power(false, requested, ceiling, false), requested & ceiling);
        }

        #[test]
        fn prop_host_power_never_unreachable(requested in 0u8..=0x3F, ceiling in 0u8..=0x3F, secure in any::<bool>()) {
            let power = effective_aid_power(
                true,
                PowerStates::from_bits_truncate(requested),
                PowerStates::from_bits_truncate(ceiling),
                secure,
            );
            prop_assert!(!power.switch_off());
            prop_assert!(!power.battery_off());
        }
    }
}
