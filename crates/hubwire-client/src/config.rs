//! Client configuration: timing knobs, reconnect policy, HTTP headers, and
//! the lazily created scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::logging::TraceLevel;
use crate::scheduler::Scheduler;

fn default_reconnect_delays() -> Vec<Duration> {
    // Matches the established clients' default backoff sequence.
    vec![
        Duration::ZERO,
        Duration::from_secs(2),
        Duration::from_secs(10),
        Duration::from_secs(30),
    ]
}

/// Configuration bound to a hub connection at build time.
///
/// The scheduler is created lazily on first access so configs can be
/// cloned and replaced without spinning up idle worker pools.
#[derive(Clone)]
pub struct ClientConfig {
    /// Headers added to every outbound HTTP request.
    pub http_headers: HashMap<String, String>,
    /// Upper bound on the handshake wait.
    pub handshake_timeout: Duration,
    /// Maximum server silence before a hard stop.
    pub server_timeout: Duration,
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// Whether the client reconnects automatically after a failure.
    pub auto_reconnect_enabled: bool,
    /// Backoff delays indexed by reconnect attempt; the last entry repeats.
    pub reconnect_delays: Vec<Duration>,
    /// Reconnect attempt cap; `-1` means infinite.
    pub max_reconnect_attempts: i32,
    /// Bound on the inbound message queue; oldest messages are dropped on
    /// overflow.
    pub message_queue_capacity: usize,
    /// Upper bound on the websocket open.
    pub connect_timeout: Duration,
    /// Per-request HTTP timeout (negotiation).
    pub http_request_timeout: Duration,
    /// Log filter bound by
    /// [`with_logging`](crate::builder::HubConnectionBuilder::with_logging).
    pub trace_level: TraceLevel,

    scheduler: Arc<Mutex<Option<Arc<Scheduler>>>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_headers: HashMap::new(),
            handshake_timeout: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            auto_reconnect_enabled: false,
            reconnect_delays: default_reconnect_delays(),
            max_reconnect_attempts: -1,
            message_queue_capacity: 50,
            connect_timeout: Duration::from_secs(10),
            http_request_timeout: Duration::from_secs(10),
            trace_level: TraceLevel::Info,
            scheduler: Arc::new(Mutex::new(None)),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scheduler shared by this config's timers, created on first
    /// access.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler
            .lock()
            .get_or_insert_with(|| Arc::new(Scheduler::new()))
            .clone()
    }

    /// Inject a scheduler (e.g. a shared one across several connections).
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        *self.scheduler.lock() = Some(scheduler);
    }

    // ── Validated setters ────────────────────────────────────────────

    pub fn set_handshake_timeout(&mut self, timeout: Duration) -> Result<()> {
        Self::require_positive(timeout, "handshake timeout")?;
        self.handshake_timeout = timeout;
        Ok(())
    }

    pub fn set_server_timeout(&mut self, timeout: Duration) -> Result<()> {
        Self::require_positive(timeout, "server timeout")?;
        self.server_timeout = timeout;
        Ok(())
    }

    pub fn set_keepalive_interval(&mut self, interval: Duration) -> Result<()> {
        Self::require_positive(interval, "keepalive interval")?;
        self.keepalive_interval = interval;
        Ok(())
    }

    pub fn set_message_queue_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(Error::Logic(
                "message queue capacity must be greater than 0".into(),
            ));
        }
        self.message_queue_capacity = capacity;
        Ok(())
    }

    fn require_positive(value: Duration, what: &str) -> Result<()> {
        if value.is_zero() {
            return Err(Error::Logic(format!("{what} must be greater than 0")));
        }
        Ok(())
    }

    /// The backoff delay for a reconnect attempt (1-based), clamping past
    /// the end of the sequence to its last entry.
    pub fn reconnect_delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.reconnect_delays.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.reconnect_delays.len() - 1);
        self.reconnect_delays[index]
    }

    /// Whether another reconnect attempt is allowed after `attempts`
    /// completed ones.
    pub fn reconnect_attempts_remaining(&self, attempts: u32) -> bool {
        self.max_reconnect_attempts < 0 || (attempts as i64) < self.max_reconnect_attempts as i64
    }
}
