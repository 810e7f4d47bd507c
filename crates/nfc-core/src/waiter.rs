//! Wait-correlation between an issued controller command and its
//! asynchronous completion.
//!
//! Each operation kind owns one [`Waiter`]. The caller arms it before issuing
//! the command, the event sink completes it from the controller's callback
//! context, and the caller awaits the armed [`PendingWait`] with a bound.
//! Completions are matched by kind only; the protocol never has more than one
//! outstanding completion per kind, and callers of the same kind serialize on
//! their own guard.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::errors::WaitError;

/// Result slot for one operation kind.
pub struct Waiter<T> {
    name: &'static str,
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Waiter<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Arm the waiter. Must happen before the command is issued so that a
    /// completion delivered synchronously is not lost.
    pub fn arm(&self) -> PendingWait<T> {
        let (tx, rx) = oneshot::channel();
        if self.slot.lock().replace(tx).is_some() {
            debug!(waiter = self.name, "replacing stale waiter");
        }
        PendingWait { name: self.name, rx }
    }

    /// Deliver a completion. Returns false if nobody is waiting.
    pub fn complete(&self, value: T) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                trace!(waiter = self.name, "completion without waiter");
                false
            }
        }
    }

    /// Wake the armed waiter, if any, with [`WaitError::Released`].
    pub fn release(&self) -> bool {
        self.slot.lock().take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Receiving half of an armed [`Waiter`].
#[must_use = "an armed wait does nothing unless awaited"]
pub struct PendingWait<T> {
    name: &'static str,
    rx: oneshot::Receiver<T>,
}

impl<T> PendingWait<T> {
    pub async fn wait(self, limit: Duration) -> Result<T, WaitError> {
        match timeout(limit, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WaitError::Released(self.name)),
            Err(_) => Err(WaitError::TimedOut(self.name)),
        }
    }
}
