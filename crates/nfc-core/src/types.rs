//! Identifiers and configuration enums shared across the core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable logical name of an execution environment.
///
/// The native handle behind a generic id can change at runtime (UICC slot
/// selection), so callers resolve it through the directory on every use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenericSeId {
    Host,
    EmbeddedSe,
    Uicc,
    Uicc2,
    Uicc3,
    T4tNfcee,
    Euicc,
    Euicc2,
}

impl GenericSeId {
    pub const ALL: [GenericSeId; 8] = [
        GenericSeId::Host,
        GenericSeId::EmbeddedSe,
        GenericSeId::Uicc,
        GenericSeId::Uicc2,
        GenericSeId::Uicc3,
        GenericSeId::T4tNfcee,
        GenericSeId::Euicc,
        GenericSeId::Euicc2,
    ];

    /// Numeric id used by the host application layer.
    pub fn id(self) -> u8 {
        match self {
            GenericSeId::Host => 0x00,
            GenericSeId::EmbeddedSe => 0x01,
            GenericSeId::Uicc => 0x02,
            GenericSeId::Uicc2 => 0x03,
            GenericSeId::Uicc3 => 0x04,
            GenericSeId::T4tNfcee => 0x7F,
            GenericSeId::Euicc => 0xC1,
            GenericSeId::Euicc2 => 0xC2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|generic| generic.id() == id)
    }

    pub fn is_uicc(self) -> bool {
        matches!(self, GenericSeId::Uicc | GenericSeId::Uicc2 | GenericSeId::Uicc3)
    }
}

impl fmt::Display for GenericSeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenericSeId::Host => "host",
            GenericSeId::EmbeddedSe => "ese",
            GenericSeId::Uicc => "uicc",
            GenericSeId::Uicc2 => "uicc2",
            GenericSeId::Uicc3 => "uicc3",
            GenericSeId::T4tNfcee => "t4t",
            GenericSeId::Euicc => "euicc",
            GenericSeId::Euicc2 => "euicc2",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for GenericSeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|generic| generic.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown secure element: {s}"))
    }
}

/// Removable SE slot currently wired to the secondary UICC ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiccSlot {
    #[default]
    Slot2,
    Slot3,
}

/// NCI generation of the controller; decides the first UICC handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NciVersion {
    #[serde(rename = "1.0")]
    V1,
    #[default]
    #[serde(rename = "2.0")]
    V2,
}

/// Where a category goes when its configured destination is inactive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Leave the category unrouted.
    Disabled,
    Host,
    /// The embedded SE if active, else the host.
    #[default]
    EmbeddedSe,
}

/// AID matching capability advertised to the host application layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AidMatchingMode {
    Exact,
    ExactOrPrefix,
    #[default]
    Prefix,
    ExactOrSubsetOrPrefix,
}

impl AidMatchingMode {
    pub fn value(self) -> u8 {
        match self {
            AidMatchingMode::Exact => 0x00,
            AidMatchingMode::ExactOrPrefix => 0x01,
            AidMatchingMode::Prefix => 0x02,
            AidMatchingMode::ExactOrSubsetOrPrefix => 0x03,
        }
    }
}

/// UICC state as reported to the host application layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiccStatus {
    Enabled,
    Disabled,
    Removed,
}
