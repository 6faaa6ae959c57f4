//! Cancellation source/token pair with registered-callback semantics.
//!
//! A [`CancellationTokenSource`] owns the canceled state; consumers hold a
//! [`CancellationToken`] derived from it. Callbacks registered on either
//! side run exactly once: synchronously on the thread that calls
//! [`cancel`](CancellationTokenSource::cancel), or immediately on the
//! registering thread if the source is already canceled. Cancellation is
//! idempotent.
//!
//! The awaitable side is backed by `tokio_util`'s token so cooperative
//! waits compose with `select!`.

use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    token: tokio_util::sync::CancellationToken,
    // The callback list lock also serializes against `cancel`, so a
    // registration cannot be both deferred and missed.
    callbacks: Mutex<Vec<Callback>>,
}

/// Owns the cancellation state and fans out to registered callbacks.
pub struct CancellationTokenSource {
    shared: Arc<Shared>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                token: tokio_util::sync::CancellationToken::new(),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Derive a token handle for consumers.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Signal cancellation. Idempotent: callbacks run on the first call
    /// only, synchronously on this thread.
    pub fn cancel(&self) {
        let callbacks = {
            let mut callbacks = self.shared.callbacks.lock();
            if self.shared.token.is_cancelled() {
                return;
            }
            self.shared.token.cancel();
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Register an action to run on cancellation. If the source is already
    /// canceled, the action runs immediately on the calling thread.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.token().register_callback(callback)
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer-side handle to a [`CancellationTokenSource`].
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// Non-blocking read of the canceled state.
    pub fn is_canceled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Wait until the source is canceled.
    pub async fn canceled(&self) {
        self.shared.token.cancelled().await
    }

    /// Register an action to run on cancellation (immediately if already
    /// canceled).
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let callback: Callback = Box::new(callback);
        let run_now = {
            let mut callbacks = self.shared.callbacks.lock();
            if self.shared.token.is_cancelled() {
                Some(callback)
            } else {
                callbacks.push(callback);
                None
            }
        };
        if let Some(callback) = run_now {
            callback();
        }
    }
}
