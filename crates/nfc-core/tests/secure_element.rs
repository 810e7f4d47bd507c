//! Integration tests for wired secure element sessions.

use std::time::Duration;

use bytes::Bytes;

use nfc_core::harness::{ese_pipe, reference_ees, Harness};
use nfc_core::recovery::EVT_END_OF_APDU_TRANSFER;
use nfc_core::se::SessionState;
use nfc_core::types::GenericSeId;
use nfc_core::NfcConfig;
use nfc_hal::{
    Command, CommandKind, ControllerEvent, EeHandle, EeStatus, MockController, NfcStatus, PowerLink, Reply,
};

const SELECT_EMPTY: [u8; 5] = [0x00, 0xA4, 0x04, 0x00, 0x00];
const GET_DATA: [u8; 5] = [0x80, 0xCA, 0x9F, 0x7F, 0x00];

fn harness() -> Harness {
    Harness::reference()
}

fn disabled_count(harness: &Harness) -> usize {
    harness
        .mock
        .sent_of(CommandKind::ModeSet)
        .iter()
        .filter(|c| matches!(c, Command::ModeSet { enable: false, .. }))
        .count()
}

fn power_links(harness: &Harness) -> Vec<PowerLink> {
    harness
        .mock
        .sent_of(CommandKind::PowerLink)
        .into_iter()
        .filter_map(|c| match c {
            Command::PowerLink { config, .. } => Some(config),
            _ => None,
        })
        .collect()
}

async fn open(harness: &Harness) -> EeHandle {
    let handle = harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await;
    assert_eq!(handle, EeHandle::ESE);
    harness.mock.clear_sent();
    handle
}

#[tokio::test]
async fn test_open_transceive_close() {
    let harness = harness();
    let handle = harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await;
    assert_eq!(handle, EeHandle::ESE);

    let se = harness.bridge.secure_element();
    assert_eq!(se.state(), SessionState::Open);
    assert_eq!(&harness.bridge.get_atr(handle)[..], &[0x3B, 0x8A, 0x80, 0x01]);
    assert_eq!(power_links(&harness)[0], PowerLink::ALWAYS_ON_LINK_ACTIVE);

    let outcome = harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 256).await;
    assert!(outcome.success);
    assert_eq!(&outcome.response[..], &[0x90, 0x00]);

    assert!(harness.bridge.close_secure_element().await);
    assert_eq!(se.state(), SessionState::Closed);
    assert!(harness.mock.sent().contains(&Command::SendHciEvent {
        pipe: ese_pipe().pipe_id,
        event: EVT_END_OF_APDU_TRANSFER,
    }));
    assert_eq!(power_links(&harness).last(), Some(&PowerLink::ALWAYS_ON));

    // Second close is a no-op
    assert!(!harness.bridge.close_secure_element().await);
}

#[tokio::test]
async fn test_second_open_refused() {
    let harness = harness();
    open(&harness).await;
    assert_eq!(
        harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await,
        EeHandle::INVALID
    );
    assert_eq!(harness.mock.count(CommandKind::ModeSet), 0);
}

#[tokio::test]
async fn test_open_recovers_after_mode_set_failure() {
    let harness = harness();
    harness.mock.reply(
        CommandKind::ModeSet,
        Reply::Events(vec![
            ControllerEvent::ModeSet {
                handle: EeHandle::ESE,
                status: NfcStatus::Failed,
                ee_status: EeStatus::Inactive,
            },
            ControllerEvent::EeRecoveryComplete,
        ]),
    );

    let handle = harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await;
    assert_eq!(handle, EeHandle::ESE);
    assert_eq!(harness.bridge.secure_element().state(), SessionState::Open);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_fails_without_recovery_signal() {
    let harness = harness();
    harness.mock.reply(
        CommandKind::ModeSet,
        Reply::Events(vec![ControllerEvent::ModeSet {
            handle: EeHandle::ESE,
            status: NfcStatus::Failed,
            ee_status: EeStatus::Inactive,
        }]),
    );

    let handle = harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await;
    assert_eq!(handle, EeHandle::INVALID);
    assert_eq!(harness.bridge.secure_element().state(), SessionState::Closed);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 0);
}

#[tokio::test]
async fn test_gate_reset_retries_invalid_param() {
    let harness = harness();
    let invalid = || {
        Reply::Events(vec![ControllerEvent::AbortResponse {
            status: NfcStatus::InvalidParam,
            data: Bytes::new(),
        }])
    };
    harness.mock.reply(CommandKind::AbortApdu, invalid());
    harness.mock.reply(CommandKind::AbortApdu, invalid());

    assert_eq!(harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await, EeHandle::ESE);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 3);
}

#[tokio::test]
async fn test_gate_reset_gives_up_after_three_invalid_param() {
    let config = NfcConfig {
        error_recovery: false,
        ..Default::default()
    };
    let harness = Harness::new(&config, MockController::new().with_ees(reference_ees()));
    for _ in 0..3 {
        harness.mock.reply(
            CommandKind::AbortApdu,
            Reply::Events(vec![ControllerEvent::AbortResponse {
                status: NfcStatus::InvalidParam,
                data: Bytes::new(),
            }]),
        );
    }

    assert_eq!(harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await, EeHandle::INVALID);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 3);
    assert_eq!(disabled_count(&harness), 1);
    assert_eq!(harness.bridge.secure_element().state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_gate_reset_wtx_power_cycles_then_retries() {
    let harness = harness();
    harness.mock.reply(
        CommandKind::AbortApdu,
        Reply::Events(vec![ControllerEvent::AbortResponse {
            status: NfcStatus::WtxTimeout,
            data: Bytes::new(),
        }]),
    );

    assert_eq!(harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await, EeHandle::ESE);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 2);
    assert_eq!(disabled_count(&harness), 1);
    assert_eq!(
        power_links(&harness),
        vec![
            PowerLink::ALWAYS_ON_LINK_ACTIVE,
            PowerLink::NFCC_DECIDES,
            PowerLink::ALWAYS_ON_LINK_ACTIVE,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_gate_reset_timeout_runs_session_reset() {
    let harness = harness();
    harness.mock.reply(
        CommandKind::AbortApdu,
        Reply::Events(vec![ControllerEvent::AbortResponse {
            status: NfcStatus::Timeout,
            data: Bytes::new(),
        }]),
    );

    assert_eq!(harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await, EeHandle::ESE);

    let sent = harness.mock.sent();
    let position = |kind: CommandKind| sent.iter().position(|c| c.kind() == kind);
    let stop = sent.iter().position(|c| matches!(c, Command::RfDiscovery { enable: false }));
    let restart = sent.iter().position(|c| matches!(c, Command::RfDiscovery { enable: true }));
    assert!(stop < position(CommandKind::WriteRaw));
    assert!(position(CommandKind::WriteRaw) < restart);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 2);
    assert!(power_links(&harness).contains(&PowerLink::ALWAYS_ON));
}

#[tokio::test(start_paused = true)]
async fn test_transceive_refused_during_gate_reset() {
    let harness = harness();
    harness.mock.reply(CommandKind::AbortApdu, Reply::Silent);

    let bridge = harness.bridge.clone();
    let opening = tokio::spawn(async move { bridge.open_secure_element(GenericSeId::EmbeddedSe).await });
    for _ in 0..100 {
        if harness.mock.count(CommandKind::AbortApdu) > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    let se = harness.bridge.secure_element();
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 1);
    assert_eq!(se.state(), SessionState::Opening);
    assert!(!se.is_open());

    let outcome = harness
        .bridge
        .transceive(EeHandle::ESE, &GET_DATA, Duration::from_secs(1), 256)
        .await;
    assert!(!outcome.success);
    assert_eq!(harness.mock.count(CommandKind::SendApdu), 0);

    let handle = opening.await.unwrap_or_else(|e| panic!("open task failed: {e}"));
    assert_eq!(handle, EeHandle::ESE);
    assert!(se.is_open());
    assert!(harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 256).await.success);
}

#[tokio::test]
async fn test_gate_reset_unrecoverable_waits_for_recovery() {
    let harness = harness();
    harness.mock.reply(
        CommandKind::AbortApdu,
        Reply::Events(vec![
            ControllerEvent::AbortResponse {
                status: NfcStatus::Unrecoverable,
                data: Bytes::new(),
            },
            ControllerEvent::EeRecoveryComplete,
        ]),
    );

    assert_eq!(harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await, EeHandle::ESE);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 2);
}

#[tokio::test]
async fn test_gate_reset_without_error_recovery_fails() {
    let config = NfcConfig {
        error_recovery: false,
        ..Default::default()
    };
    let harness = Harness::new(&config, MockController::new().with_ees(reference_ees()));
    harness.mock.reply(
        CommandKind::AbortApdu,
        Reply::Events(vec![ControllerEvent::AbortResponse {
            status: NfcStatus::WtxTimeout,
            data: Bytes::new(),
        }]),
    );

    assert_eq!(harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await, EeHandle::INVALID);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 1);
}

#[tokio::test(start_paused = true)]
async fn test_plain_timeout_power_cycles_once_when_ee_recovers() {
    let harness = harness();
    let handle = open(&harness).await;
    harness.mock.reply(
        CommandKind::SendApdu,
        Reply::Events(vec![ControllerEvent::ApduResponse {
            status: NfcStatus::Timeout,
            data: Bytes::new(),
        }]),
    );

    let outcome = harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 256).await;
    assert!(!outcome.success);
    assert!(outcome.response.is_empty());
    assert_eq!(disabled_count(&harness), 1);
    assert_eq!(
        power_links(&harness),
        vec![PowerLink::ALWAYS_ON, PowerLink::ALWAYS_ON_LINK_ACTIVE]
    );
    assert!(harness.mock.sent().contains(&Command::SendHciEvent {
        pipe: ese_pipe().pipe_id,
        event: EVT_END_OF_APDU_TRANSFER,
    }));
    assert_eq!(harness.bridge.secure_element().state(), SessionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_plain_timeout_power_cycles_twice_when_ee_stays_inactive() {
    let harness = harness();
    let handle = open(&harness).await;
    harness.mock.reply(
        CommandKind::SendApdu,
        Reply::Events(vec![ControllerEvent::ApduResponse {
            status: NfcStatus::Timeout,
            data: Bytes::from_static(&[0x61]),
        }]),
    );

    // The first cycle leaves the EE inactive
    harness.mock.set_ee_status(EeHandle::ESE, EeStatus::Inactive);
    for _ in 0..2 {
        harness.mock.reply(
            CommandKind::ModeSet,
            Reply::Events(vec![ControllerEvent::ModeSet {
                handle: EeHandle::ESE,
                status: NfcStatus::Ok,
                ee_status: EeStatus::Inactive,
            }]),
        );
    }

    let outcome = harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 256).await;
    assert!(!outcome.success);
    assert_eq!(&outcome.response[..], &[0x61]);
    assert_eq!(disabled_count(&harness), 2);
    assert_eq!(
        power_links(&harness),
        vec![
            PowerLink::ALWAYS_ON,
            PowerLink::ALWAYS_ON_LINK_ACTIVE,
            PowerLink::NFCC_DECIDES,
            PowerLink::ALWAYS_ON_LINK_ACTIVE,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_wtx_unanswered_abort_power_cycles() {
    let harness = harness();
    let handle = open(&harness).await;
    harness.mock.reply(
        CommandKind::SendApdu,
        Reply::Events(vec![ControllerEvent::ApduResponse {
            status: NfcStatus::WtxTimeout,
            data: Bytes::new(),
        }]),
    );
    harness.mock.reply(CommandKind::AbortApdu, Reply::Silent);

    let outcome = harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 256).await;
    assert!(!outcome.success);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 1);
    assert_eq!(disabled_count(&harness), 1);
    assert_eq!(power_links(&harness)[0], PowerLink::NFCC_DECIDES);
}

#[tokio::test]
async fn test_wtx_answered_abort_skips_power_cycle() {
    let harness = harness();
    let handle = open(&harness).await;
    harness.mock.reply(
        CommandKind::SendApdu,
        Reply::Events(vec![ControllerEvent::ApduResponse {
            status: NfcStatus::WtxTimeout,
            data: Bytes::new(),
        }]),
    );

    let outcome = harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 256).await;
    assert!(!outcome.success);
    assert_eq!(harness.mock.count(CommandKind::AbortApdu), 1);
    assert_eq!(disabled_count(&harness), 0);
}

#[tokio::test]
async fn test_oversized_apdu_answered_locally() {
    let harness = harness();
    let handle = open(&harness).await;
    let apdu = vec![0u8; 0x800C];

    let outcome = harness.bridge.transceive(handle, &apdu, Duration::from_secs(1), 256).await;
    assert_eq!(&outcome.response[..], &[0x67, 0x00]);
    assert_eq!(harness.mock.count(CommandKind::SendApdu), 0);
}

#[tokio::test]
async fn test_response_truncated_to_caller_buffer() {
    let mock = MockController::new()
        .with_ees(reference_ees())
        .with_pipes(vec![ese_pipe()])
        .with_apdu_response(&[0x01, 0x02, 0x03, 0x90, 0x00]);
    let harness = Harness::new(&NfcConfig::default(), mock);
    let handle = open(&harness).await;

    let outcome = harness.bridge.transceive(handle, &GET_DATA, Duration::from_secs(1), 3).await;
    assert!(outcome.success);
    assert_eq!(&outcome.response[..], &[0x01, 0x02, 0x03]);
}

#[tokio::test]
async fn test_empty_select_uses_default_aid() {
    let config = NfcConfig {
        default_se_aid: Some("A000000151000000".into()),
        ..Default::default()
    };
    let mock = MockController::new().with_ees(reference_ees()).with_pipes(vec![ese_pipe()]);
    let harness = Harness::new(&config, mock);
    let handle = open(&harness).await;

    assert!(harness.bridge.transceive(handle, &SELECT_EMPTY, Duration::from_secs(1), 256).await.success);
    let sent = harness.mock.sent_of(CommandKind::SendApdu);
    assert_eq!(
        sent,
        vec![Command::SendApdu {
            handle,
            apdu: vec![0x00, 0xA4, 0x04, 0x00, 0x08, 0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00, 0x00, 0x00],
        }]
    );
}

#[tokio::test]
async fn test_transceive_on_wrong_handle_fails() {
    let harness = harness();
    open(&harness).await;
    let outcome = harness
        .bridge
        .transceive(EeHandle::UICC, &GET_DATA, Duration::from_secs(1), 256)
        .await;
    assert!(!outcome.success);
    assert_eq!(harness.mock.count(CommandKind::SendApdu), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_pending_transceive() {
    let harness = harness();
    let handle = open(&harness).await;
    harness.mock.reply(CommandKind::SendApdu, Reply::Silent);

    let bridge = harness.bridge.clone();
    let exchange = tokio::spawn(async move { bridge.transceive(handle, &GET_DATA, Duration::from_secs(30), 256).await });
    tokio::task::yield_now().await;

    harness.bridge.shutdown().await;
    let outcome = exchange.await.unwrap_or_else(|e| panic!("transceive task failed: {e}"));
    assert!(!outcome.success);
    assert_eq!(harness.bridge.secure_element().state(), SessionState::Closed);
    assert_eq!(
        harness.bridge.open_secure_element(GenericSeId::EmbeddedSe).await,
        EeHandle::INVALID
    );
}

#[tokio::test(start_paused = true)]
async fn test_rf_field_debounce_through_bridge() {
    let harness = harness();
    harness.mock.emit(ControllerEvent::RfField { on: true });
    assert!(harness.bridge.is_rf_field_on());
    harness.mock.emit(ControllerEvent::RfField { on: false });
    assert!(harness.bridge.is_rf_field_on());
    tokio::time::advance(Duration::from_millis(60)).await;
    assert!(!harness.bridge.is_rf_field_on());
}

#[tokio::test]
async fn test_active_secure_elements() {
    let harness = harness();
    assert_eq!(
        harness.bridge.active_secure_elements().await,
        vec![GenericSeId::EmbeddedSe, GenericSeId::Uicc]
    );
}
