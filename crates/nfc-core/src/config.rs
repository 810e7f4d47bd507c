//! Routing and secure element configuration.
//!
//! Read once at startup. Every key has a default so a partial TOML file or
//! an empty environment yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use nfc_hal::{PowerStates, TechMask, NCI_MAX_AID_LEN};

use crate::types::{AidMatchingMode, FallbackPolicy, GenericSeId, NciVersion, UiccSlot};

/// Lower bound for wired-mode transceive timeouts.
pub const MIN_TRANSCEIVE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("config parse error: {0}")]
    ParseError(String),
    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NfcConfig {
    // Default routes
    /// Destination of AIDs nobody registered (empty-AID entry).
    pub default_route: GenericSeId,
    /// Owner of technologies A and B when an SE supports them.
    pub default_offhost_route: Option<GenericSeId>,
    /// Owner of technology F.
    pub default_felica_route: Option<GenericSeId>,
    pub default_isodep_route: GenericSeId,
    pub default_syscode_route: GenericSeId,
    /// Independent of the off-host AID ceiling.
    pub default_syscode_power: PowerStates,
    pub default_system_code: u16,

    // Listen technologies and power
    pub offhost_listen_tech_mask: TechMask,
    pub host_listen_tech_mask: TechMask,
    pub offhost_aid_power_ceiling: PowerStates,
    pub fallback_policy: FallbackPolicy,

    // Controller
    pub uicc_slot: UiccSlot,
    pub nci_version: NciVersion,
    pub aid_matching_mode: AidMatchingMode,
    /// Raw NFCEE ids offered to the host for off-host UICC services.
    pub offhost_uicc_destinations: Vec<u8>,
    pub offhost_ese_destinations: Vec<u8>,

    // Wired sessions
    /// Hex AID substituted into empty SELECT commands.
    pub default_se_aid: Option<String>,
    pub transceive_timeout_ms: u64,
    /// Run the recovery sequence and retry when the gate reset gets no ATR.
    pub error_recovery: bool,

    // Completion bounds
    pub completion_timeout_ms: u64,
    pub recovery_timeout_ms: u64,
}

impl Default for NfcConfig {
    fn default() -> Self {
        Self {
            default_route: GenericSeId::Host,
            default_offhost_route: Some(GenericSeId::EmbeddedSe),
            default_felica_route: None,
            default_isodep_route: GenericSeId::Host,
            default_syscode_route: GenericSeId::EmbeddedSe,
            default_syscode_power: PowerStates::SWITCH_ON
                .union(PowerStates::SCREEN_OFF)
                .union(PowerStates::SCREEN_LOCK),
            default_system_code: 0xFEFE,
            offhost_listen_tech_mask: TechMask::all(),
            host_listen_tech_mask: TechMask::A | TechMask::F,
            offhost_aid_power_ceiling: PowerStates::SWITCH_ON,
            fallback_policy: FallbackPolicy::EmbeddedSe,
            uicc_slot: UiccSlot::Slot2,
            nci_version: NciVersion::V2,
            aid_matching_mode: AidMatchingMode::Prefix,
            offhost_uicc_destinations: Vec::new(),
            offhost_ese_destinations: Vec::new(),
            default_se_aid: None,
            transceive_timeout_ms: MIN_TRANSCEIVE_TIMEOUT_MS,
            error_recovery: true,
            completion_timeout_ms: 1000,
            recovery_timeout_ms: 5000,
        }
    }
}

impl NfcConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileNotFound(format!("{}: {}", path.display(), e)))?;

        let config: NfcConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `NFC_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn load_from_env() -> Self {
        let mut config = Self::default();

        if let Some(route) = env_generic("NFC_DEFAULT_ROUTE") {
            config.default_route = route;
        }
        if let Some(route) = env_generic("NFC_DEFAULT_OFFHOST_ROUTE") {
            config.default_offhost_route = Some(route);
        }
        if let Some(route) = env_generic("NFC_DEFAULT_FELICA_ROUTE") {
            config.default_felica_route = Some(route);
        }
        if let Some(route) = env_generic("NFC_DEFAULT_ISODEP_ROUTE") {
            config.default_isodep_route = route;
        }
        if let Some(route) = env_generic("NFC_DEFAULT_SYSCODE_ROUTE") {
            config.default_syscode_route = route;
        }
        if let Some(bits) = env_u8("NFC_DEFAULT_SYSCODE_POWER") {
            config.default_syscode_power = PowerStates::from_bits_truncate(bits);
        }
        if let Some(bits) = env_u8("NFC_OFFHOST_LISTEN_TECH_MASK") {
            config.offhost_listen_tech_mask = TechMask::from_bits_truncate(bits);
        }
        if let Some(bits) = env_u8("NFC_HOST_LISTEN_TECH_MASK") {
            config.host_listen_tech_mask = TechMask::from_bits_truncate(bits);
        }
        if let Some(bits) = env_u8("NFC_OFFHOST_AID_POWER_CEILING") {
            config.offhost_aid_power_ceiling = PowerStates::from_bits_truncate(bits);
        }
        if let Ok(aid) = std::env::var("NFC_DEFAULT_SE_AID") {
            config.default_se_aid = Some(aid);
        }
        if let Ok(ms) = std::env::var("NFC_TRANSCEIVE_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => config.transceive_timeout_ms = ms,
                Err(_) => warn!(value = %ms, "ignoring NFC_TRANSCEIVE_TIMEOUT_MS"),
            }
        }
        if let Ok(flag) = std::env::var("NFC_ERROR_RECOVERY") {
            config.error_recovery = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offhost_aid_power_ceiling.is_empty() {
            return Err(ConfigError::ValidationError(
                "offhost_aid_power_ceiling must allow at least one power state".to_string(),
            ));
        }
        if self.completion_timeout_ms == 0 || self.recovery_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "completion and recovery timeouts must be non-zero".to_string(),
            ));
        }
        if let Some(aid) = &self.default_se_aid {
            let bytes = hex::decode(aid)
                .map_err(|e| ConfigError::ValidationError(format!("default_se_aid is not hex: {}", e)))?;
            if bytes.is_empty() || bytes.len() > NCI_MAX_AID_LEN {
                return Err(ConfigError::ValidationError(format!(
                    "default_se_aid must be 1 to {} bytes",
                    NCI_MAX_AID_LEN
                )));
            }
        }
        if self.default_isodep_route == GenericSeId::T4tNfcee {
            return Err(ConfigError::ValidationError(
                "default_isodep_route cannot be the T4T NFCEE".to_string(),
            ));
        }
        Ok(())
    }

    /// AID substituted into empty SELECT commands, if configured and valid.
    pub fn default_se_aid_bytes(&self) -> Option<Vec<u8>> {
        let aid = hex::decode(self.default_se_aid.as_deref()?).ok()?;
        (!aid.is_empty() && aid.len() <= NCI_MAX_AID_LEN).then_some(aid)
    }

    /// Configured transceive timeout, clamped to the wired-mode minimum.
    pub fn transceive_timeout(&self) -> Duration {
        Duration::from_millis(self.transceive_timeout_ms.max(MIN_TRANSCEIVE_TIMEOUT_MS))
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Whether any technology is meant to be owned by an SE.
    pub fn has_offhost_route(&self) -> bool {
        self.default_offhost_route.is_some() || self.default_felica_route.is_some()
    }
}

fn env_generic(key: &str) -> Option<GenericSeId> {
    let value = std::env::var(key).ok()?;
    let parsed = parse_u8(&value).and_then(GenericSeId::from_id);
    if parsed.is_none() {
        warn!(key, value = %value, "ignoring unknown generic SE id");
    }
    parsed
}

fn env_u8(key: &str) -> Option<u8> {
    let value = std::env::var(key).ok()?;
    let parsed = parse_u8(&value);
    if parsed.is_none() {
        warn!(key, value = %value, "ignoring non-numeric value");
    }
    parsed
}

fn parse_u8(value: &str) -> Option<u8> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
