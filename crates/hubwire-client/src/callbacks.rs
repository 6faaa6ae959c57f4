//! Invocation callback tracking.
//!
//! Every blocking invocation registers a continuation here under a fresh
//! id; the matching completion frame resolves it. On disconnection the
//! whole table is cleared, delivering a "connection stopped" error to every
//! in-flight invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// The outcome delivered to an invoker: a value, a hub error, or a
/// connection-level error.
pub type InvocationOutcome = Result<Value>;

pub struct CallbackManager {
    pending: Mutex<HashMap<String, oneshot::Sender<InvocationOutcome>>>,
    next_id: AtomicU64,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a continuation; returns the fresh invocation id and the
    /// receiver that resolves with the outcome.
    ///
    /// Ids are generated from a monotonic counter, so they cannot collide
    /// for the life of one connection.
    pub fn register(&self) -> (String, oneshot::Receiver<InvocationOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        let prev = self.pending.lock().insert(id.clone(), tx);
        debug_assert!(prev.is_none(), "invocation id collision: {id}");
        (id, rx)
    }

    /// Resolve and erase the continuation for `id`. Returns whether an
    /// entry existed.
    pub fn complete(&self, id: &str, outcome: InvocationOutcome) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => {
                // The invoker may have given up waiting; a dropped receiver
                // is not an error.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Erase the continuation for `id` without resolving it.
    pub fn remove(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Resolve every pending continuation with a connection-stopped error
    /// and empty the table.
    pub fn clear(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ConnectionStopped(reason.to_owned())));
        }
        if count > 0 {
            tracing::debug!(cleared = count, "cleared pending invocations");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_resolves_the_registered_receiver() {
        let manager = CallbackManager::new();
        let (id, rx) = manager.register();

        assert!(manager.complete(&id, Ok(json!(5))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(5));
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn complete_unknown_id_returns_false() {
        let manager = CallbackManager::new();
        assert!(!manager.complete("404", Ok(json!(null))));
    }

    #[test]
    fn ids_are_unique() {
        let manager = CallbackManager::new();
        let (a, _rx_a) = manager.register();
        let (b, _rx_b) = manager.register();
        assert_ne!(a, b);
        assert_eq!(manager.pending_count(), 2);
    }

    #[tokio::test]
    async fn clear_delivers_connection_stopped_to_everyone() {
        let manager = CallbackManager::new();
        let (_, rx_a) = manager.register();
        let (_, rx_b) = manager.register();

        manager.clear("connection was stopped before invocation result was received");

        for rx in [rx_a, rx_b] {
            match rx.await.unwrap() {
                Err(Error::ConnectionStopped(reason)) => {
                    assert!(reason.contains("stopped"));
                }
                other => panic!("expected ConnectionStopped, got {other:?}"),
            }
        }
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn remove_leaves_receiver_unresolved() {
        let manager = CallbackManager::new();
        let (id, rx) = manager.register();
        manager.remove(&id);

        // The sender is gone, so the receiver errors rather than hanging.
        assert!(rx.await.is_err());
        assert!(!manager.complete(&id, Ok(json!(1))));
    }
}
