//! Error types for the NFC core.
//!
//! Every failure below degrades to a boolean or empty result at the host
//! bridge; nothing here is fatal to the process.

use thiserror::Error;

use nfc_hal::{CommandError, EeHandle, LmrtError, NfcStatus};

use crate::config::ConfigError;
use crate::types::GenericSeId;

// ============================================================================
// Wait correlation
// ============================================================================

/// Failure of a bounded wait for a controller completion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// No completion within the bound
    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),

    /// The waiter was released by close or shutdown
    #[error("wait for {0} was released")]
    Released(&'static str),
}

// ============================================================================
// Component errors
// ============================================================================

/// Execution-environment directory errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EeError {
    #[error("ee command rejected: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    /// Mode set completed with a failure status
    #[error("mode set on {handle} failed: {status:?}")]
    ModeSetFailed { handle: EeHandle, status: NfcStatus },
}

/// Routing table manager errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("routing command rejected: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Ee(#[from] EeError),

    /// Completion arrived with a failure status
    #[error("{op} failed: {status:?}")]
    Failed { op: &'static str, status: NfcStatus },

    /// Neither the configured destination nor its fallback is available
    #[error("no destination available for {0}")]
    Unrouted(&'static str),

    /// ISO-DEP needs technology A or B on the destination
    #[error("{0} supports neither technology A nor B")]
    MissingIsoDepTech(EeHandle),

    #[error("power state {0:#04x} routes nothing")]
    InvalidPower(u8),

    #[error("AID of {0} bytes exceeds the NCI maximum")]
    InvalidAid(usize),

    #[error("T3T identifier must be 18 bytes, got {0}")]
    InvalidT3tIdentifier(usize),

    #[error("unknown T3T handle {0}")]
    UnknownT3tHandle(u16),

    #[error("malformed listen routing: {0}")]
    Lmrt(#[from] LmrtError),
}

/// Secure element session errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SeError {
    #[error("wired session already open")]
    AlreadyOpen,

    #[error("wired session not open")]
    NotOpen,

    /// NFC is being disabled
    #[error("nfc disabling")]
    Disabling,

    #[error("no execution environment behind {0}")]
    UnknownSe(GenericSeId),

    #[error("{op} failed: {status:?}")]
    Failed { op: &'static str, status: NfcStatus },

    /// The EE never reported recovery after an unrecoverable error
    #[error("ee recovery did not complete")]
    RecoveryTimeout,

    /// Gate reset exhausted its attempts without an ATR
    #[error("apdu gate reset failed: {0:?}")]
    GateReset(NfcStatus),

    #[error("se command rejected: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Ee(#[from] EeError),
}

// ============================================================================
// Unified error
// ============================================================================

/// Unified error type for NFC core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NfcError {
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("secure element error: {0}")]
    Se(#[from] SeError),

    #[error("ee error: {0}")]
    Ee(#[from] EeError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl NfcError {
    /// Closest controller status for reporting upward.
    pub fn status(&self) -> NfcStatus {
        match self {
            NfcError::Routing(RoutingError::Command(e))
            | NfcError::Se(SeError::Command(e))
            | NfcError::Ee(EeError::Command(e)) => e.status(),
            NfcError::Routing(RoutingError::Failed { status, .. })
            | NfcError::Se(SeError::Failed { status, .. })
            | NfcError::Se(SeError::GateReset(status))
            | NfcError::Ee(EeError::ModeSetFailed { status, .. }) => *status,
            NfcError::Routing(RoutingError::Wait(WaitError::TimedOut(_)))
            | NfcError::Se(SeError::Wait(WaitError::TimedOut(_)))
            | NfcError::Ee(EeError::Wait(WaitError::TimedOut(_)))
            | NfcError::Se(SeError::RecoveryTimeout) => NfcStatus::Timeout,
            NfcError::Routing(RoutingError::InvalidPower(_))
            | NfcError::Routing(RoutingError::InvalidAid(_))
            | NfcError::Routing(RoutingError::InvalidT3tIdentifier(_))
            | NfcError::Routing(RoutingError::UnknownT3tHandle(_))
            | NfcError::Config(_) => NfcStatus::InvalidParam,
            _ => NfcStatus::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, NfcError>;

// ============================================================================
// Unit Tests
// ============================================================================
