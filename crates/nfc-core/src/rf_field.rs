//! Debounced RF field state.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A field-off shorter than this does not count as the field being off.
pub const RF_FIELD_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
struct FieldState {
    on: bool,
    /// Last field event, on or off. None until the first one.
    changed: Option<Instant>,
}

/// Tracks the external reader field reported by the controller.
#[derive(Debug)]
pub struct RfFieldTracker {
    state: Mutex<FieldState>,
}

impl RfFieldTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FieldState {
                on: false,
                changed: None,
            }),
        }
    }

    pub fn notify(&self, on: bool) {
        let mut state = self.state.lock();
        state.on = on;
        state.changed = Some(Instant::now());
    }

    /// True while the field is on, or went off less than the debounce ago.
    pub fn is_on(&self) -> bool {
        let state = *self.state.lock();
        state.on || state.changed.is_some_and(|at| at.elapsed() < RF_FIELD_DEBOUNCE)
    }
}

impl Default for RfFieldTracker {
    fn default() -> Self {
        Self::new()
    }
}
