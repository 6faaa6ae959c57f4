//! The hub connection: handshake, message pump, invocation tracking,
//! keepalive, and automatic reconnection on top of the connection core.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use hubwire_protocol::{
    handshake, HubMessage, HubProtocol, JsonHubProtocol, TransferFormat, RECORD_SEPARATOR_CHAR,
};

use crate::callbacks::CallbackManager;
use crate::cancellation::CancellationTokenSource;
use crate::completion::CompletionEvent;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::http::HttpClientFactory;
use crate::registry::HandlerRegistry;
use crate::scheduler::timer;
use crate::transport::TransportFactory;

/// Overall bound on one reconnect attempt (backoff excluded).
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

const CALLBACKS_CLEARED_REASON: &str =
    "connection was stopped before invocation result was received";

/// Guarded by the reconnect lock — the outermost lock in the client.
struct ReconnectState {
    reconnecting: bool,
    attempts: u32,
    cts: Option<CancellationTokenSource>,
    /// Set by a user-initiated stop; suppresses further attempts until the
    /// next explicit start.
    user_stopped: bool,
}

pub(crate) struct HubInner {
    connection: Connection,
    protocol: Arc<dyn HubProtocol>,
    callbacks: CallbackManager,
    subscriptions: HandlerRegistry,
    config: ClientConfig,
    /// Serialized once; ping frames never change.
    cached_ping: String,

    handshake_received: AtomicBool,
    handshake_event: Mutex<Arc<CompletionEvent>>,
    disconnect_cts: Mutex<Arc<CancellationTokenSource>>,

    /// Keepalive deadlines in milliseconds on the `clock` timeline.
    next_send_ping: AtomicI64,
    next_server_timeout: AtomicI64,
    clock: Instant,

    user_disconnected: Mutex<Option<Arc<dyn Fn(Option<Error>) + Send + Sync>>>,
    reconnect: Mutex<ReconnectState>,
}

impl HubInner {
    fn now_millis(&self) -> i64 {
        self.clock.elapsed().as_millis() as i64
    }

    fn reset_send_ping(&self) {
        let deadline = self.now_millis() + self.config.keepalive_interval.as_millis() as i64;
        self.next_send_ping.store(deadline, Ordering::Relaxed);
    }

    fn reset_server_timeout(&self) {
        let deadline = self.now_millis() + self.config.server_timeout.as_millis() as i64;
        self.next_server_timeout.store(deadline, Ordering::Relaxed);
    }

    fn current_handshake_event(&self) -> Arc<CompletionEvent> {
        self.handshake_event.lock().clone()
    }

    fn current_disconnect_cts(&self) -> Arc<CancellationTokenSource> {
        self.disconnect_cts.lock().clone()
    }

    /// Wire the connection core's callbacks to this hub through weak
    /// back-references, so core-held callbacks never extend our lifetime.
    fn initialize(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.connection.set_message_handler(Arc::new(move |message| {
            if let Some(hub) = weak.upgrade() {
                hub.process_message(message);
            }
        }));

        let weak = Arc::downgrade(self);
        self.connection
            .set_disconnected_handler(Arc::new(move |error| {
                if let Some(hub) = weak.upgrade() {
                    hub.handle_disconnected(error);
                }
            }));
    }

    // ── Start ────────────────────────────────────────────────────────

    /// One start attempt: core start, handshake rendezvous, keepalive.
    /// Used by both the public `start` and the reconnect loop.
    async fn start_session(self: &Arc<Self>) -> Result<()> {
        if self.connection.state() != ConnectionState::Disconnected {
            return Err(Error::Logic(
                "the connection can only be started if it is in the disconnected state".into(),
            ));
        }

        // Fresh rendezvous state for this session.
        let handshake_event = Arc::new(CompletionEvent::new());
        let disconnect_cts = Arc::new(CancellationTokenSource::new());
        *self.handshake_event.lock() = handshake_event.clone();
        *self.disconnect_cts.lock() = disconnect_cts.clone();
        self.handshake_received.store(false, Ordering::Release);

        // The core enforces the disconnected-only precondition.
        self.connection.start().await?;

        // Three producers race to resolve the handshake event; it is
        // one-shot, so whichever fires first wins and the rest no-op.
        //
        // 1. A timer enforcing the handshake timeout.
        let timeout = self.config.handshake_timeout;
        {
            let event = handshake_event.clone();
            timer(&self.config.scheduler(), move |elapsed| {
                if event.is_set() {
                    return true;
                }
                if elapsed < timeout {
                    return false;
                }
                event.set_error(Error::HandshakeTimeout);
                true
            });
        }

        // 2. The connection closing before the handshake resolves.
        {
            let event = handshake_event.clone();
            disconnect_cts.register_callback(move || {
                event.set_error(Error::ConnectionStopped(
                    "connection closed while handshake was in progress".into(),
                ));
            });
        }

        // 3. The handshake request send itself.
        let request = handshake::write_handshake(self.protocol.as_ref());
        if let Err(e) = self
            .connection
            .send(request, self.protocol.transfer_format())
            .await
        {
            handshake_event.set_error(e);
        }

        match handshake_event.wait().await {
            Ok(()) => {
                tracing::info!("handshake succeeded, starting keepalive");
                self.reconnect.lock().attempts = 0;
                self.start_keepalive();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed, stopping connection");
                let _ = self.connection.stop_with_error(Some(e.clone())).await;
                Err(e)
            }
        }
    }

    // ── Message pump ─────────────────────────────────────────────────

    fn process_message(self: &Arc<Self>, message: String) {
        if let Err(error) = self.try_process(message) {
            tracing::error!(error = %error, "error occurred when parsing response");
            let hub = self.clone();
            tokio::spawn(async move {
                let _ = hub.connection.stop_with_error(Some(error)).await;
            });
        }
    }

    fn try_process(&self, message: String) -> Result<()> {
        let mut remaining = message;

        if !self.handshake_received.load(Ordering::Acquire) {
            // The transport strips record separators while framing; the
            // handshake parser wants one, so re-append when missing.
            let mut frame = remaining;
            if !frame.contains(RECORD_SEPARATOR_CHAR) {
                frame.push(RECORD_SEPARATOR_CHAR);
            }

            let (leftover, response) = handshake::parse_handshake(&frame)?;

            if let Some(error) = response.get("error").and_then(Value::as_str) {
                tracing::error!(error = %error, "handshake rejected by server");
                self.current_handshake_event()
                    .set_error(Error::HandshakeRejected(error.to_owned()));
                return Ok(());
            }
            if response.contains_key("type") {
                self.current_handshake_event().set_error(Error::ProtocolViolation(
                    "received an unexpected message while waiting for the handshake response"
                        .into(),
                ));
                return Ok(());
            }

            self.handshake_received.store(true, Ordering::Release);
            self.current_handshake_event().set_success();

            if leftover.is_empty() {
                return Ok(());
            }
            remaining = leftover;
        }

        // Any frame from the server counts as a sign of life.
        self.reset_server_timeout();

        for message in self.protocol.parse_messages(&remaining)? {
            match message {
                HubMessage::Invocation {
                    target, arguments, ..
                } => {
                    self.subscriptions.dispatch(&target, &arguments);
                }
                HubMessage::Completion {
                    invocation_id,
                    error,
                    result,
                } => {
                    let outcome = match error {
                        Some(text) => Err(Error::Hub(text)),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    if !self.callbacks.complete(&invocation_id, outcome) {
                        tracing::info!(
                            invocation_id = %invocation_id,
                            "no callback found for completion"
                        );
                    }
                }
                HubMessage::Ping => {
                    tracing::debug!("ping message received");
                }
                HubMessage::Close {
                    error,
                    allow_reconnect,
                } => {
                    // allowReconnect is not honored in this revision.
                    tracing::debug!(
                        error = ?error,
                        allow_reconnect = ?allow_reconnect,
                        "close message received"
                    );
                }
                HubMessage::StreamItem { .. } => {
                    // Streaming is unsupported; items are dropped.
                }
                HubMessage::StreamInvocation { .. } => {
                    return Err(Error::ProtocolViolation(
                        "received unexpected message type 'StreamInvocation'".into(),
                    ));
                }
                HubMessage::CancelInvocation { .. } => {
                    return Err(Error::ProtocolViolation(
                        "received unexpected message type 'CancelInvocation'".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    // ── Keepalive ────────────────────────────────────────────────────

    fn start_keepalive(self: &Arc<Self>) {
        tracing::info!("starting keepalive timer");
        self.send_ping();
        self.reset_server_timeout();

        let server_timeout_ms = self.config.server_timeout.as_millis() as u64;
        let weak = Arc::downgrade(self);
        timer(&self.config.scheduler(), move |_| {
            let Some(hub) = weak.upgrade() else {
                return true;
            };
            if hub.connection.state() != ConnectionState::Connected {
                return true;
            }

            let now = hub.now_millis();

            if now > hub.next_server_timeout.load(Ordering::Relaxed) {
                tracing::warn!(
                    timeout_ms = server_timeout_ms,
                    "server timeout elapsed without receiving a message from the server"
                );
                let hub = hub.clone();
                tokio::spawn(async move {
                    let _ = hub
                        .connection
                        .stop_with_error(Some(Error::ServerTimeout(server_timeout_ms)))
                        .await;
                });
                // The state check stops the timer on the next tick.
                return false;
            }

            if now > hub.next_send_ping.load(Ordering::Relaxed) {
                tracing::debug!("sending ping to server");
                hub.send_ping();
            }
            false
        });
    }

    fn send_ping(self: &Arc<Self>) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            let format = hub.protocol.transfer_format();
            match hub.connection.send(hub.cached_ping.clone(), format).await {
                Ok(()) => hub.reset_send_ping(),
                Err(e) => tracing::warn!(error = %e, "failed to send ping"),
            }
        });
    }

    // ── Send / invoke ────────────────────────────────────────────────

    async fn invoke_hub_method(
        self: &Arc<Self>,
        target: &str,
        arguments: Vec<Value>,
        invocation_id: Option<String>,
    ) -> Result<()> {
        let message = HubMessage::Invocation {
            invocation_id: invocation_id.clone(),
            target: target.to_owned(),
            arguments,
        };
        let frame = self.protocol.write_message(&message);

        if let Err(e) = self
            .connection
            .send(frame, self.protocol.transfer_format())
            .await
        {
            if let Some(id) = invocation_id {
                self.callbacks.remove(&id);
            }
            tracing::warn!(error = %e, target = %target, "failed to send invocation");
            return Err(e);
        }

        self.reset_send_ping();
        Ok(())
    }

    // ── Disconnection ────────────────────────────────────────────────

    fn handle_disconnected(self: &Arc<Self>, error: Option<Error>) {
        // Start may be waiting on the handshake; resolve it (no-op when
        // the handshake already finished).
        self.current_handshake_event()
            .set_error(Error::ConnectionStopped(
                "connection closed while handshake was in progress".into(),
            ));

        self.current_disconnect_cts().cancel();

        self.callbacks.clear(CALLBACKS_CLEARED_REASON);

        let should_reconnect = match &error {
            // Graceful stops and legacy-server detection never reconnect.
            None | Some(Error::LegacyServerDetected) => false,
            Some(_) => {
                self.config.auto_reconnect_enabled && {
                    let state = self.reconnect.lock();
                    !state.user_stopped
                        && !state.reconnecting
                        && self.config.reconnect_attempts_remaining(state.attempts)
                }
            }
        };
        if should_reconnect {
            self.schedule_reconnect();
        }

        let handler = self.user_disconnected.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    // ── Reconnect ────────────────────────────────────────────────────

    fn schedule_reconnect(self: &Arc<Self>) {
        let (attempt, delay, token) = {
            let mut state = self.reconnect.lock();
            if state.user_stopped {
                return;
            }
            state.reconnecting = true;
            state.attempts += 1;
            let attempt = state.attempts;
            let delay = self.config.reconnect_delay_for_attempt(attempt);
            let cts = CancellationTokenSource::new();
            let token = cts.token();
            state.cts = Some(cts);
            (attempt, delay, token)
        };

        tracing::info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect attempt"
        );

        // Each attempt runs on its own task so it never inherits a caller
        // that might be torn down mid-attempt.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.canceled() => {
                    tracing::info!(attempt, "reconnect canceled during backoff");
                    return;
                }
            }

            let Some(hub) = weak.upgrade() else {
                return;
            };
            if token.is_canceled() {
                return;
            }

            tracing::info!(attempt, "reconnecting");
            let outcome =
                tokio::time::timeout(RECONNECT_ATTEMPT_TIMEOUT, hub.start_session()).await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    let mut state = hub.reconnect.lock();
                    state.reconnecting = false;
                    state.cts = None;
                    tracing::info!(attempt, "reconnected");
                    None
                }
                Ok(Err(e)) => Some(e),
                Err(_) => Some(Error::Transport(format!(
                    "reconnect attempt timed out after {} s",
                    RECONNECT_ATTEMPT_TIMEOUT.as_secs()
                ))),
            };

            if let Some(error) = failure {
                tracing::warn!(attempt, error = %error, "reconnect attempt failed");
                let retry = {
                    let mut state = hub.reconnect.lock();
                    state.reconnecting = false;
                    state.cts = None;
                    !state.user_stopped
                        && !token.is_canceled()
                        && hub.config.reconnect_attempts_remaining(state.attempts)
                };
                if retry {
                    hub.schedule_reconnect();
                } else {
                    tracing::warn!(
                        attempts = hub.reconnect.lock().attempts,
                        "giving up on automatic reconnection"
                    );
                }
            }
        });
    }
}

/// A connection to a hub. Built via
/// [`HubConnectionBuilder`](crate::builder::HubConnectionBuilder).
pub struct HubConnection {
    inner: Arc<HubInner>,
}

impl HubConnection {
    pub(crate) fn new(
        url: String,
        skip_negotiation: bool,
        config: ClientConfig,
        http_factory: HttpClientFactory,
        transport_factory: TransportFactory,
    ) -> Self {
        Self::with_protocol(
            url,
            skip_negotiation,
            config,
            Arc::new(JsonHubProtocol::new()),
            http_factory,
            transport_factory,
        )
    }

    pub(crate) fn with_protocol(
        url: String,
        skip_negotiation: bool,
        config: ClientConfig,
        protocol: Arc<dyn HubProtocol>,
        http_factory: HttpClientFactory,
        transport_factory: TransportFactory,
    ) -> Self {
        let connection = Connection::new(
            url,
            skip_negotiation,
            config.clone(),
            &http_factory,
            transport_factory,
        );
        let cached_ping = protocol.write_message(&HubMessage::Ping);

        let inner = Arc::new(HubInner {
            connection,
            protocol,
            callbacks: CallbackManager::new(),
            subscriptions: HandlerRegistry::new(),
            config,
            cached_ping,
            handshake_received: AtomicBool::new(false),
            handshake_event: Mutex::new(Arc::new(CompletionEvent::new())),
            disconnect_cts: Mutex::new(Arc::new(CancellationTokenSource::new())),
            next_send_ping: AtomicI64::new(i64::MAX),
            next_server_timeout: AtomicI64::new(i64::MAX),
            clock: Instant::now(),
            user_disconnected: Mutex::new(None),
            reconnect: Mutex::new(ReconnectState {
                reconnecting: false,
                attempts: 0,
                cts: None,
                user_stopped: false,
            }),
        });
        inner.initialize();

        Self { inner }
    }

    /// Start the connection: negotiate, open the transport, complete the
    /// handshake, and arm the keepalive. Resolves once the hub is usable.
    pub async fn start(&self) -> Result<()> {
        self.inner.reconnect.lock().user_stopped = false;
        self.inner.start_session().await
    }

    /// Stop the connection. Cancels any in-flight reconnect attempt and
    /// suppresses further ones. Concurrent stops join the in-flight one;
    /// stopping an already-disconnected hub succeeds immediately.
    pub async fn stop(&self) -> Result<()> {
        let cts = {
            let mut state = self.inner.reconnect.lock();
            state.user_stopped = true;
            state.reconnecting = false;
            state.attempts = 0;
            state.cts.take()
        };
        if let Some(cts) = cts {
            cts.cancel();
        }
        self.inner.connection.stop().await
    }

    /// Invoke a hub method and wait for its completion frame.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value> {
        let (id, receiver) = self.inner.callbacks.register();
        self.inner
            .invoke_hub_method(target, arguments, Some(id))
            .await?;

        match receiver.await {
            Ok(outcome) => outcome,
            // The manager dropped the sender without resolving it; only
            // possible when the hub itself went away.
            Err(_) => Err(Error::ConnectionStopped(
                "connection went out of scope before invocation result was received".into(),
            )),
        }
    }

    /// Fire-and-forget a hub method: resolves on successful send, no
    /// completion frame is awaited.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        self.inner.invoke_hub_method(target, arguments, None).await
    }

    /// Register a handler for a server-invoked method. Only allowed while
    /// disconnected; duplicate targets and empty names fail.
    pub fn on(
        &self,
        method_name: &str,
        handler: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.inner.connection.state() != ConnectionState::Disconnected {
            return Err(Error::Logic(
                "can't register a handler unless the connection is in a disconnected state".into(),
            ));
        }
        self.inner.subscriptions.register(method_name, handler)
    }

    /// Install the disconnection callback. Fires at most once per
    /// disconnection, after the state has reached disconnected, with
    /// `None` for a graceful stop.
    pub fn set_disconnected(&self, handler: impl Fn(Option<Error>) + Send + Sync + 'static) {
        *self.inner.user_disconnected.lock() = Some(Arc::new(handler));
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection.connection_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
