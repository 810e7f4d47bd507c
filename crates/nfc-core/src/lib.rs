//! NFC Core - listen-mode routing and secure element sessions.
//!
//! This crate implements:
//! - Execution-environment directory and generic SE id resolution
//! - Routing table manager (technology, protocol, system-code and AID routes)
//! - Secure element wired session controller with timeout recovery
//! - Host application bridge dispatching controller events

#![forbid(unsafe_code)]

// Core services
pub mod directory;
pub mod routing;
pub mod se;

// Host surface
pub mod bridge;

// Supporting modules
pub mod config;
pub mod errors;
pub mod recovery;
pub mod rf_field;
pub mod table;
pub mod types;
pub mod waiter;
pub mod harness;

pub use bridge::{HostBridge, HostNotification, HostNotifier};
pub use config::{ConfigError, NfcConfig};
pub use errors::{NfcError, Result};
