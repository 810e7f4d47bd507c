//! Diagnostic commands run against the simulated controller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::info;

use nfc_core::types::GenericSeId;
use nfc_core::{HostBridge, HostNotification, HostNotifier};
use nfc_hal::{ControllerStack, EeHandle, RoutingEntry};

use crate::config::AgentConfig;

/// Largest response accepted from the SE: extended length plus status word.
pub const MAX_RESPONSE_LEN: usize = 65_538;

/// Notifier logging every host notification.
pub struct LogNotifier;

impl HostNotifier for LogNotifier {
    fn notify(&self, notification: HostNotification) {
        match notification {
            HostNotification::RfField { on } => info!(on, "rf field"),
            HostNotification::ListenActivated { technology } => info!(%technology, "listen activated"),
            HostNotification::ListenDeactivated { technology } => info!(%technology, "listen deactivated"),
            HostNotification::CeData { technology, data } => {
                info!(%technology, data = %hex::encode(&data), "card emulation data")
            }
        }
    }
}

/// Services over a freshly built simulated controller.
pub fn start(config: &AgentConfig) -> anyhow::Result<Arc<HostBridge>> {
    let controller: Arc<dyn ControllerStack> = Arc::new(config.simulation.build()?);
    Ok(HostBridge::new(&config.nfc, controller, Arc::new(LogNotifier)))
}

/// Discover EEs, compute and commit the routing table, and read it back.
pub async fn plan(config: &AgentConfig) -> anyhow::Result<Vec<RoutingEntry>> {
    let bridge = start(config)?;
    if !bridge.request_ee_discovery().await {
        bail!("ee discovery failed");
    }
    if !bridge.initialize().await {
        bail!("routing table commit failed");
    }
    let entries = bridge.routing_dump().await;
    info!(entries = entries.len(), "routing table committed");
    bridge.shutdown().await;
    Ok(entries)
}

#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub command: String,
    pub response: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub se: GenericSeId,
    pub handle: EeHandle,
    pub atr: String,
    pub exchanges: Vec<Exchange>,
}

/// Open a wired session to `se`, send each APDU in order and close it.
pub async fn se_session(
    config: &AgentConfig,
    se: GenericSeId,
    apdus: &[Vec<u8>],
    timeout: Duration,
) -> anyhow::Result<SessionReport> {
    let bridge = start(config)?;
    if !bridge.request_ee_discovery().await {
        bail!("ee discovery failed");
    }

    let handle = bridge.open_secure_element(se).await;
    if handle == EeHandle::INVALID {
        bridge.shutdown().await;
        bail!("could not open a wired session to {}", se);
    }
    let atr = hex::encode(bridge.get_atr(handle));
    info!(%se, %handle, %atr, "wired session open");

    let mut exchanges = Vec::with_capacity(apdus.len());
    for apdu in apdus {
        let outcome = bridge.transceive(handle, apdu, timeout, MAX_RESPONSE_LEN).await;
        exchanges.push(Exchange {
            command: hex::encode(apdu),
            response: hex::encode(&outcome.response),
            success: outcome.success,
        });
        if !outcome.success {
            break;
        }
    }

    let closed = bridge.close_secure_element().await;
    bridge.shutdown().await;
    if !closed {
        bail!("wired session to {} did not close", se);
    }

    Ok(SessionReport {
        se,
        handle,
        atr,
        exchanges,
    })
}

/// Parse hex APDUs given on the command line.
pub fn parse_apdus(values: &[String]) -> anyhow::Result<Vec<Vec<u8>>> {
    values
        .iter()
        .map(|value| {
            let compact: String = value.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
            hex::decode(&compact).with_context(|| format!("apdu is not hex: {}", value))
        })
        .collect()
}
