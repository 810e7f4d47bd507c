//! Controller stack abstractions for the NFC routing core.
//!
//! This crate describes the asynchronous command/completion interface of an
//! NFC controller (NFCC) without tying it to a particular vendor stack:
//! commands are accepted or rejected immediately, and every accepted command
//! is answered later by exactly one [`ControllerEvent`] delivered to the
//! registered [`EventSink`].

#[macro_use]
mod mask;

pub mod types;
pub mod power;
pub mod entry;
pub mod traits;
pub mod testing;

pub use types::*;
pub use power::*;
pub use entry::*;
pub use traits::*;
pub use testing::*;
