//! One-shot completion event carrying success or an error.
//!
//! The first `set_*` call wins; any later call is a no-op. `is_set` is a
//! non-blocking read, and `wait` suspends until the event resolves, then
//! yields the stored outcome. Waiters that arrive after resolution return
//! immediately.

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

pub struct CompletionEvent {
    state: Mutex<Option<Result<()>>>,
    notify: Notify,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Resolve the event with success. Returns whether this call was the
    /// one that resolved it.
    pub fn set_success(&self) -> bool {
        self.set(Ok(()))
    }

    /// Resolve the event with an error. Returns whether this call was the
    /// one that resolved it.
    pub fn set_error(&self, error: Error) -> bool {
        self.set(Err(error))
    }

    fn set(&self, outcome: Result<()>) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
        }
        self.notify.notify_waiters();
        true
    }

    /// Non-blocking: has the event resolved?
    pub fn is_set(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Suspend until the event resolves, then return the stored outcome.
    pub async fn wait(&self) -> Result<()> {
        loop {
            // Arm the notification before checking state so a `set` racing
            // with this check cannot be missed.
            let notified = self.notify.notified();
            if let Some(outcome) = self.state.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}
