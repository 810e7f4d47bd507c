//! Integration tests for listen-mode routing through the host bridge.

use bytes::Bytes;

use nfc_core::bridge::HostNotification;
use nfc_core::harness::{reference_ees, Harness};
use nfc_core::types::{FallbackPolicy, GenericSeId};
use nfc_core::NfcConfig;
use nfc_hal::{
    AidInfo, Command, CommandKind, ControllerEvent, EeHandle, EeInfo, EeStatus, EntryKind, MockController, NfcStatus,
    PowerStates, ProtoMask, RoutingEntry, TechMask,
};

fn tech_destinations(routes: &[RoutingEntry], technology: TechMask) -> Vec<EeHandle> {
    routes
        .iter()
        .filter_map(|entry| match entry {
            RoutingEntry::Technology { technology: t, destination, .. } if t.intersects(technology) => Some(*destination),
            _ => None,
        })
        .collect()
}

fn proto_destinations(routes: &[RoutingEntry], protocol: ProtoMask) -> Vec<EeHandle> {
    routes
        .iter()
        .filter_map(|entry| match entry {
            RoutingEntry::Protocol { protocol: p, destination, .. } if p.intersects(protocol) => Some(*destination),
            _ => None,
        })
        .collect()
}

fn aid_entry<'a>(routes: &'a [RoutingEntry], aid: &[u8]) -> Option<&'a RoutingEntry> {
    routes
        .iter()
        .find(|entry| matches!(entry, RoutingEntry::Aid { aid: a, .. } if a[..] == aid[..]))
}

fn assert_exclusive(routes: &[RoutingEntry]) {
    for bit in TechMask::all().iter() {
        let holders = tech_destinations(routes, bit);
        assert!(holders.len() <= 1, "{bit:?} routed to {holders:?}");
    }
}

async fn initialized(config: NfcConfig, mock: MockController) -> Harness {
    let harness = Harness::new(&config, mock);
    assert!(harness.bridge.request_ee_discovery().await);
    assert!(harness.bridge.initialize().await);
    harness
}

#[tokio::test]
async fn test_commit_scenario_routes_iso_dep_and_technologies_to_ese() {
    let config = NfcConfig {
        default_offhost_route: Some(GenericSeId::EmbeddedSe),
        default_isodep_route: GenericSeId::EmbeddedSe,
        ..Default::default()
    };
    let harness = initialized(config, MockController::new().with_ees(reference_ees())).await;
    let committed = harness.mock.committed_routes();

    assert_eq!(tech_destinations(&committed, TechMask::A), vec![EeHandle::ESE]);
    assert_eq!(tech_destinations(&committed, TechMask::B), vec![EeHandle::ESE]);
    assert!(!tech_destinations(&committed, TechMask::A | TechMask::B).contains(&EeHandle::HOST));
    assert_eq!(proto_destinations(&committed, ProtoMask::ISO_DEP), vec![EeHandle::ESE]);
    assert_eq!(harness.bridge.routing().se_tech_mask(), TechMask::A | TechMask::B);

    // The UICC only supports A and is not the off-host route
    assert!(!committed.iter().any(|e| e.destination() == EeHandle::UICC));
    assert_eq!(harness.mock.count(CommandKind::UpdateRouting), 1);
}

#[tokio::test]
async fn test_iso_dep_never_routed_to_ee_without_a_or_b() {
    let config = NfcConfig {
        default_isodep_route: GenericSeId::EmbeddedSe,
        ..Default::default()
    };
    let ees = vec![EeInfo::new(EeHandle::ESE, EeStatus::Active).with_technologies(TechMask::F)];
    let harness = initialized(config, MockController::new().with_ees(ees)).await;
    let committed = harness.mock.committed_routes();

    assert_eq!(proto_destinations(&committed, ProtoMask::ISO_DEP), vec![EeHandle::HOST]);
    assert!(!committed
        .iter()
        .any(|e| matches!(e, RoutingEntry::Protocol { destination, .. } if *destination == EeHandle::ESE)));
}

#[tokio::test]
async fn test_technology_exclusivity_after_host_routing() {
    let harness = Harness::new(&NfcConfig::default(), MockController::new().with_ees(reference_ees()));
    assert!(harness.bridge.enable_routing_to_host().await);
    assert!(harness.bridge.request_ee_discovery().await);
    assert!(harness.bridge.initialize().await);

    let committed = harness.mock.committed_routes();
    assert_exclusive(&committed);
    assert_eq!(tech_destinations(&committed, TechMask::A), vec![EeHandle::ESE]);
    assert_eq!(tech_destinations(&committed, TechMask::F), vec![EeHandle::HOST]);
    assert!(harness.bridge.routing().staged().is_exclusive());
}

#[tokio::test]
async fn test_host_routing_skips_se_owned_technologies() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    harness.mock.clear_sent();

    assert!(harness.bridge.enable_routing_to_host().await);
    let host_techs: Vec<TechMask> = harness
        .mock
        .sent_of(CommandKind::SetTechRoute)
        .into_iter()
        .filter_map(|c| match c {
            Command::SetTechRoute { handle, technology, .. } if handle == EeHandle::HOST => Some(technology),
            _ => None,
        })
        .collect();
    assert_eq!(host_techs, vec![TechMask::F]);

    assert!(harness.bridge.disable_routing_to_host().await);
    assert!(harness.bridge.commit_routing().await);
    let committed = harness.mock.committed_routes();
    assert!(tech_destinations(&committed, TechMask::F).is_empty());
    assert!(proto_destinations(&committed, ProtoMask::ISO_DEP).is_empty());
}

#[tokio::test]
async fn test_host_clear_limited_to_host_listen_technologies() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    let host_clears: Vec<TechMask> = harness
        .mock
        .sent_of(CommandKind::ClearTechRoute)
        .into_iter()
        .filter_map(|c| match c {
            Command::ClearTechRoute { handle, technology } if handle == EeHandle::HOST => Some(technology),
            _ => None,
        })
        .collect();

    // ESE owns A and B, the host listens on A and F
    assert!(host_clears.contains(&TechMask::A));
    assert!(host_clears.iter().all(|t| !t.intersects(TechMask::B)));
    assert_exclusive(&harness.mock.committed_routes());
}

#[tokio::test]
async fn test_aid_power_is_masked_per_destination() {
    let config = NfcConfig {
        offhost_aid_power_ceiling: PowerStates::from_bits_truncate(0x3B),
        ..Default::default()
    };
    let harness = initialized(config, MockController::new().with_ees(reference_ees())).await;
    let aid = [0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10];

    assert!(harness.bridge.route_aid(&aid, GenericSeId::EmbeddedSe, PowerStates::all(), AidInfo::empty()).await);
    let staged = harness.mock.staged_routes();
    assert_eq!(aid_entry(&staged, &aid).map(|e| e.power().bits()), Some(0x3B));

    assert!(harness.bridge.route_aid(&aid, GenericSeId::Host, PowerStates::all(), AidInfo::empty()).await);
    let staged = harness.mock.staged_routes();
    let entry = aid_entry(&staged, &aid).cloned();
    assert_eq!(entry.as_ref().map(RoutingEntry::destination), Some(EeHandle::HOST));
    let power = entry.map(|e| e.power()).unwrap_or_else(PowerStates::empty);
    assert!(!power.switch_off());
    assert!(!power.battery_off());
    assert_eq!(power.bits(), 0x39);
}

#[tokio::test]
async fn test_secure_mode_keeps_only_switch_on() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    assert!(harness.bridge.set_nfc_secure(true));
    let aid = [0xA0, 0x00, 0x00, 0x00, 0x03];
    assert!(harness.bridge.route_aid(&aid, GenericSeId::Host, PowerStates::all(), AidInfo::empty()).await);
    let staged = harness.mock.staged_routes();
    assert_eq!(aid_entry(&staged, &aid).map(RoutingEntry::power), Some(PowerStates::SWITCH_ON));
}

#[tokio::test]
async fn test_add_remove_commit_leaves_aid_absent() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    let aid = [0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10];

    assert!(harness.bridge.route_aid(&aid, GenericSeId::EmbeddedSe, PowerStates::empty(), AidInfo::PREFIX).await);
    assert!(harness.bridge.unroute_aid(&aid).await);
    assert!(harness.bridge.commit_routing().await);

    assert!(aid_entry(&harness.mock.committed_routes(), &aid).is_none());
    assert!(!harness.bridge.routing().staged().contains_aid(&aid));
}

#[tokio::test]
async fn test_removing_unknown_aid_fails() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    assert!(!harness.bridge.unroute_aid(&[0xA0, 0x01]).await);
}

#[tokio::test]
async fn test_each_commit_sends_one_update() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    harness.mock.clear_sent();

    assert!(harness.bridge.commit_routing().await);
    assert!(harness.bridge.commit_routing().await);
    assert_eq!(harness.mock.count(CommandKind::UpdateRouting), 2);
}

#[tokio::test]
async fn test_commit_recomputes_technologies_after_discovery_change() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    harness.mock.clear_sent();

    harness.mock.emit(ControllerEvent::EeDiscovered(reference_ees()));
    assert!(harness.bridge.commit_routing().await);
    assert!(harness.mock.count(CommandKind::SetTechRoute) > 0);

    harness.mock.clear_sent();
    assert!(harness.bridge.commit_routing().await);
    assert_eq!(harness.mock.count(CommandKind::SetTechRoute), 0);
}

#[tokio::test]
async fn test_rejected_update_fails_commit() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    harness.mock.reply(
        CommandKind::UpdateRouting,
        nfc_hal::Reply::Reject(nfc_hal::CommandError::Rejected(NfcStatus::Failed)),
    );
    assert!(!harness.bridge.commit_routing().await);
    assert!(harness.bridge.commit_routing().await);
}

#[tokio::test]
async fn test_fallback_resolves_within_two_probes() {
    let ees = vec![
        EeInfo::new(EeHandle::ESE, EeStatus::Active).with_technologies(TechMask::A | TechMask::B),
        EeInfo::new(EeHandle::UICC, EeStatus::Inactive).with_technologies(TechMask::A),
    ];
    let harness = Harness::new(&NfcConfig::default(), MockController::new().with_ees(ees));
    let routing = harness.bridge.routing();
    let directory = harness.bridge.directory();

    let before = directory.probe_count();
    assert_eq!(routing.check_and_update_alt_route(GenericSeId::Uicc).await, Some(EeHandle::ESE));
    assert!(directory.probe_count() - before <= 2);

    harness.mock.set_ee_status(EeHandle::ESE, EeStatus::Inactive);
    directory.refresh().await;
    let before = directory.probe_count();
    assert_eq!(routing.check_and_update_alt_route(GenericSeId::Uicc).await, Some(EeHandle::HOST));
    assert!(directory.probe_count() - before <= 2);
}

#[tokio::test]
async fn test_fallback_policies() {
    let ees = vec![EeInfo::new(EeHandle::UICC, EeStatus::Inactive)];

    let config = NfcConfig {
        fallback_policy: FallbackPolicy::Disabled,
        ..Default::default()
    };
    let harness = Harness::new(&config, MockController::new().with_ees(ees.clone()));
    assert_eq!(harness.bridge.routing().check_and_update_alt_route(GenericSeId::Uicc).await, None);

    let config = NfcConfig {
        fallback_policy: FallbackPolicy::Host,
        ..Default::default()
    };
    let harness = Harness::new(&config, MockController::new().with_ees(ees));
    assert_eq!(
        harness.bridge.routing().check_and_update_alt_route(GenericSeId::Uicc).await,
        Some(EeHandle::HOST)
    );
}

#[tokio::test]
async fn test_unrouted_iso_dep_with_disabled_fallback() {
    let config = NfcConfig {
        default_isodep_route: GenericSeId::Uicc,
        fallback_policy: FallbackPolicy::Disabled,
        ..Default::default()
    };
    let ees = vec![EeInfo::new(EeHandle::UICC, EeStatus::Inactive).with_technologies(TechMask::A)];
    let harness = Harness::new(&config, MockController::new().with_ees(ees));
    assert!(harness.bridge.request_ee_discovery().await);
    assert!(harness.bridge.routing().compute_default_protocol_route().await.is_err());
    assert!(proto_destinations(&harness.mock.staged_routes(), ProtoMask::ISO_DEP).is_empty());
}

#[tokio::test]
async fn test_system_code_routing_probed_once() {
    let harness = initialized(
        NfcConfig::default(),
        MockController::new().with_ees(reference_ees()).without_system_code_routing(),
    )
    .await;
    let routing = harness.bridge.routing();
    assert_eq!(routing.scbr_supported(), Some(false));
    assert_eq!(harness.mock.count(CommandKind::AddSystemCode), 1);

    // T3T is routed by protocol instead
    let committed = harness.mock.committed_routes();
    assert_eq!(proto_destinations(&committed, ProtoMask::T3T), vec![EeHandle::HOST]);

    assert!(harness.bridge.update_routing_table().await);
    assert_eq!(harness.mock.count(CommandKind::AddSystemCode), 1);
}

#[tokio::test]
async fn test_default_system_code_uses_configured_power() {
    let config = NfcConfig {
        offhost_aid_power_ceiling: PowerStates::SWITCH_ON,
        ..Default::default()
    };
    let harness = initialized(config, MockController::new().with_ees(reference_ees())).await;
    let system_code = harness.mock.committed_routes().into_iter().find_map(|e| match e {
        RoutingEntry::SystemCode { system_code, destination, power } => Some((system_code, destination, power.bits())),
        _ => None,
    });
    assert_eq!(system_code, Some((0xFEFE, EeHandle::ESE, 0x19)));
}

#[tokio::test]
async fn test_empty_aid_installed_when_default_route_differs() {
    let config = NfcConfig {
        default_isodep_route: GenericSeId::EmbeddedSe,
        ..Default::default()
    };
    let harness = initialized(config, MockController::new().with_ees(reference_ees())).await;
    let committed = harness.mock.committed_routes();
    let entry = aid_entry(&committed, &[]);
    assert_eq!(entry.map(RoutingEntry::destination), Some(EeHandle::HOST));
    assert_eq!(entry.map(|e| e.power().bits()), Some(0x11));
}

#[tokio::test]
async fn test_clear_routing_entries_by_kind() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    assert!(harness.bridge.route_aid(&[0xA0, 0x02], GenericSeId::Host, PowerStates::empty(), AidInfo::empty()).await);

    assert!(harness.bridge.clear_routing_entry(EntryKind::Technology).await);
    assert!(harness.bridge.clear_routing_entry(EntryKind::Aid).await);
    assert!(harness.bridge.commit_routing().await);

    let committed = harness.mock.committed_routes();
    assert!(!committed.iter().any(|e| e.kind() == EntryKind::Technology));
    assert!(!committed.iter().any(|e| e.kind() == EntryKind::Aid));
}

#[tokio::test]
async fn test_set_routing_entry_moves_technology() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    assert!(
        harness
            .bridge
            .set_routing_entry(EntryKind::Technology, TechMask::A.bits() as u16, GenericSeId::Uicc, PowerStates::SWITCH_ON)
            .await
    );
    assert!(harness.bridge.commit_routing().await);
    let committed = harness.mock.committed_routes();
    assert_eq!(tech_destinations(&committed, TechMask::A), vec![EeHandle::UICC]);
    assert_exclusive(&committed);
}

#[tokio::test]
async fn test_t3t_registration_routes_system_code_to_host() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    let mut identifier = vec![0x12, 0xFC];
    identifier.extend_from_slice(&[0x02, 0xFE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
    identifier.extend_from_slice(&[0xFF; 8]);

    let handle = harness.bridge.register_t3t_identifier(&identifier).await;
    assert_eq!(handle, Some(1));
    assert!(harness.mock.staged_routes().contains(&RoutingEntry::SystemCode {
        system_code: 0x12FC,
        destination: EeHandle::HOST,
        power: PowerStates::SWITCH_ON,
    }));

    assert!(harness.bridge.deregister_t3t_identifier(1).await);
    assert!(!harness
        .mock
        .staged_routes()
        .iter()
        .any(|e| matches!(e, RoutingEntry::SystemCode { system_code: 0x12FC, .. })));
    assert!(!harness.bridge.deregister_t3t_identifier(1).await);
}

#[tokio::test]
async fn test_routing_dump_reads_back_committed_table() {
    let config = NfcConfig {
        default_isodep_route: GenericSeId::EmbeddedSe,
        ..Default::default()
    };
    let harness = initialized(config, MockController::new().with_ees(reference_ees())).await;
    let dump = harness.bridge.routing_dump().await;
    assert_eq!(dump.len(), harness.mock.committed_routes().len());
    assert_eq!(proto_destinations(&dump, ProtoMask::ISO_DEP), vec![EeHandle::ESE]);
}

#[tokio::test]
async fn test_ce_data_forwarded_once_complete() {
    let harness = Harness::reference();
    harness.mock.emit(ControllerEvent::ListenActivated { technology: TechMask::A });
    harness.mock.emit(ControllerEvent::CeData {
        status: NfcStatus::Ok,
        technology: TechMask::A,
        data: Bytes::from_static(&[0x00, 0xA4]),
        more: true,
    });
    harness.mock.emit(ControllerEvent::CeData {
        status: NfcStatus::Ok,
        technology: TechMask::A,
        data: Bytes::from_static(&[0x04, 0x00]),
        more: false,
    });
    harness.mock.emit(ControllerEvent::RfField { on: false });

    assert_eq!(
        harness.notifier.received(),
        vec![
            HostNotification::ListenActivated { technology: TechMask::A },
            HostNotification::CeData {
                technology: TechMask::A,
                data: Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00]),
            },
            HostNotification::RfField { on: false },
        ]
    );
}

#[tokio::test]
async fn test_shutdown_deactivates_active_ees() {
    let harness = initialized(NfcConfig::default(), MockController::new().with_ees(reference_ees())).await;
    harness.mock.clear_sent();
    harness.bridge.shutdown().await;

    let disabled: Vec<EeHandle> = harness
        .mock
        .sent_of(CommandKind::ModeSet)
        .into_iter()
        .filter_map(|c| match c {
            Command::ModeSet { handle, enable: false } => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(disabled, vec![EeHandle::ESE, EeHandle::UICC]);
}
