//! NFC Agent - diagnostics over the routing and secure element core.
//!
//! Loads configuration, installs logging and runs the core services against
//! a simulated controller.

pub mod commands;
pub mod config;
pub mod logging;
pub mod simulate;
