//! Builder pattern for constructing a [`HubConnection`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::http::{HttpClientFactory, ReqwestHttpClient};
use crate::hub_connection::HubConnection;
use crate::logging::{self, LogWriter, TraceLevel};
use crate::transport::{default_transport_factory, TungsteniteClient, WebsocketFactory};

/// Fluent builder for [`HubConnection`].
///
/// # Example
///
/// ```rust,no_run
/// # use hubwire_client::HubConnectionBuilder;
/// # use std::time::Duration;
/// let hub = HubConnectionBuilder::new()
///     .with_url("wss://device-hub.example.com/telemetry")
///     .skip_negotiation()
///     .with_automatic_reconnect(None)
///     .with_server_timeout(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// ```
pub struct HubConnectionBuilder {
    url: Option<String>,
    skip_negotiation: bool,
    config: ClientConfig,
    http_client_factory: Option<HttpClientFactory>,
    websocket_factory: Option<WebsocketFactory>,
    log_writer: Option<Arc<dyn LogWriter>>,
}

impl HubConnectionBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            skip_negotiation: false,
            config: ClientConfig::default(),
            http_client_factory: None,
            websocket_factory: None,
            log_writer: None,
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// The hub's base URL (e.g. `https://host/hub`, or `wss://host/hub`
    /// with negotiation skipped).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    // ── Connection behavior ──────────────────────────────────────────

    /// Skip the negotiate exchange and open the websocket directly.
    pub fn skip_negotiation(mut self) -> Self {
        self.skip_negotiation = true;
        self
    }

    /// Enable automatic reconnection. `delays` overrides the default
    /// backoff sequence (`0s, 2s, 10s, 30s`; the last entry repeats).
    pub fn with_automatic_reconnect(mut self, delays: Option<Vec<Duration>>) -> Self {
        self.config.auto_reconnect_enabled = true;
        if let Some(delays) = delays {
            self.config.reconnect_delays = delays;
        }
        self
    }

    /// Cap the number of reconnect attempts; `-1` means unlimited.
    pub fn with_max_reconnect_attempts(mut self, max_attempts: i32) -> Self {
        self.config.max_reconnect_attempts = max_attempts;
        self
    }

    /// Headers added to every outbound HTTP request.
    pub fn with_http_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.config.http_headers = headers;
        self
    }

    // ── Timing ───────────────────────────────────────────────────────

    /// Upper bound on the handshake wait (default 15 s).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        // Validation happens in build so the fluent chain stays infallible.
        self.config.handshake_timeout = timeout;
        self
    }

    /// Maximum server silence before a hard stop (default 30 s).
    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.config.server_timeout = timeout;
        self
    }

    /// Interval between keepalive pings (default 15 s).
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    // ── Capacity ─────────────────────────────────────────────────────

    /// Bound on the inbound message queue (default 50); the oldest message
    /// is dropped on overflow.
    pub fn with_message_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.message_queue_capacity = capacity;
        self
    }

    // ── Injection ────────────────────────────────────────────────────

    /// Supply the HTTP client used for negotiation.
    pub fn with_http_client_factory(mut self, factory: HttpClientFactory) -> Self {
        self.http_client_factory = Some(factory);
        self
    }

    /// Supply the websocket layer underneath the transport adapter.
    pub fn with_websocket_factory(mut self, factory: WebsocketFactory) -> Self {
        self.websocket_factory = Some(factory);
        self
    }

    // ── Logging ──────────────────────────────────────────────────────

    /// Route the client's log output: `build` installs a global `tracing`
    /// subscriber filtering at `level` and handing every formatted entry
    /// to `writer` (e.g. [`StdoutLogWriter`](crate::logging::StdoutLogWriter)).
    ///
    /// Skip this to keep logging under the embedder's control — the
    /// client emits through `tracing` either way, and installation is a
    /// no-op when a global subscriber already exists.
    pub fn with_logging(mut self, level: TraceLevel, writer: Arc<dyn LogWriter>) -> Self {
        self.config.trace_level = level;
        self.log_writer = Some(writer);
        self
    }

    /// Validate the accumulated options and build the hub connection.
    pub fn build(self) -> Result<HubConnection> {
        let url = match self.url {
            Some(url) if !url.is_empty() => url,
            _ => return Err(Error::Logic("a url is required to build a hub connection".into())),
        };

        let mut config = self.config;
        // Route the timing fields through the validated setters.
        config.set_handshake_timeout(config.handshake_timeout)?;
        config.set_server_timeout(config.server_timeout)?;
        config.set_keepalive_interval(config.keepalive_interval)?;
        config.set_message_queue_capacity(config.message_queue_capacity)?;

        if let Some(writer) = self.log_writer {
            logging::init_with_writer(config.trace_level, writer);
        }

        let http_factory = self
            .http_client_factory
            .unwrap_or_else(ReqwestHttpClient::factory);
        let websocket_factory = self
            .websocket_factory
            .unwrap_or_else(TungsteniteClient::factory);
        let transport_factory = default_transport_factory(websocket_factory);

        Ok(HubConnection::new(
            url,
            self.skip_negotiation,
            config,
            http_factory,
            transport_factory,
        ))
    }
}

impl Default for HubConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
