//! Simulated controller stack.
//!
//! The agent runs the core services over the in-process mock controller,
//! seeded from the `[simulation]` configuration section.

use serde::{Deserialize, Serialize};

use nfc_core::harness::reference_ees;
use nfc_core::recovery::APDU_GATE;
use nfc_hal::{EeHandle, EeInfo, MockController, PipeInfo};

use crate::config::ConfigError;

/// First HCI pipe id handed to a simulated EE.
const FIRST_PIPE_ID: u8 = 0x19;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// EEs reported by discovery.
    pub ees: Vec<EeInfo>,
    /// Hex ATR returned when a wired session opens.
    pub atr: String,
    /// Hex response returned to every APDU.
    pub apdu_response: String,
    pub system_code_routing: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ees: reference_ees(),
            atr: "3B8A8001".to_string(),
            apdu_response: "9000".to_string(),
            system_code_routing: true,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        decode("atr", &self.atr)?;
        let response = decode("apdu_response", &self.apdu_response)?;
        if response.len() < 2 {
            return Err(ConfigError::ValidationError(
                "apdu_response must end with a two-byte status word".to_string(),
            ));
        }
        if self.ees.iter().any(|ee| ee.handle == EeHandle::HOST || ee.handle == EeHandle::INVALID) {
            return Err(ConfigError::ValidationError(
                "simulated ees must not use the host or invalid handle".to_string(),
            ));
        }
        Ok(())
    }

    /// One APDU pipe per simulated EE, numbered from 0x19.
    pub fn pipes(&self) -> Vec<PipeInfo> {
        self.ees
            .iter()
            .zip(FIRST_PIPE_ID..)
            .map(|(ee, pipe_id)| PipeInfo {
                pipe_id,
                local_gate: APDU_GATE,
                dest_host: ee.handle.nfcee_id(),
                dest_gate: APDU_GATE,
            })
            .collect()
    }

    /// Mock controller answering like the configured hardware.
    pub fn build(&self) -> Result<MockController, ConfigError> {
        let controller = MockController::new()
            .with_ees(self.ees.clone())
            .with_pipes(self.pipes())
            .with_atr(&decode("atr", &self.atr)?)
            .with_apdu_response(&decode("apdu_response", &self.apdu_response)?);
        Ok(if self.system_code_routing {
            controller
        } else {
            controller.without_system_code_routing()
        })
    }
}

fn decode(key: &str, value: &str) -> Result<Vec<u8>, ConfigError> {
    hex::decode(value).map_err(|e| ConfigError::ValidationError(format!("{} is not hex: {}", key, e)))
}
