//! Connection core: state machine, negotiation, transport lifecycle, and
//! the message-receive loop.
//!
//! The core owns the transport and publishes `state` and `connection_id`.
//! The hub layer above installs `on_message_received` / `on_disconnected`
//! handlers; every callback the core hands to the transport captures a
//! `Weak` back-reference and no-ops if the core is gone, which is what
//! breaks the core → transport → delivery-task → core reference cycle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use hubwire_protocol::TransferFormat;

use crate::cancellation::CancellationTokenSource;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpClientFactory};
use crate::negotiate;
use crate::transport::{Transport, TransportFactory};

/// The connection lifecycle states. Transitions form a simple cycle; the
/// only shortcut is `Connecting → Disconnected` on a failed start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

pub(crate) type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;
pub(crate) type DisconnectedHandler = Arc<dyn Fn(Option<Error>) + Send + Sync>;

pub(crate) struct ConnectionInner {
    base_url: String,
    skip_negotiation: bool,
    config: ClientConfig,
    http: Arc<dyn HttpClient>,
    transport_factory: TransportFactory,

    state: Mutex<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connection_id: Mutex<Option<String>>,

    message_handler: Mutex<Option<MessageHandler>>,
    disconnected_handler: Mutex<Option<DisconnectedHandler>>,

    /// Joined completions for concurrent `stop` calls. Lock order: this
    /// lock sits below the hub's reconnect lock and above the transport's
    /// queue/pending locks.
    stop_waiters: Mutex<Vec<oneshot::Sender<Result<()>>>>,
    /// Cancels an in-flight negotiate when `stop` interrupts a start.
    start_cts: Mutex<Option<CancellationTokenSource>>,
    /// Guards the per-session `on_disconnected` fan-out. Starts true so
    /// nothing fires before a session exists.
    disconnected_fired: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn change_state(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            tracing::trace!(from = %from, to = %to, "state changed");
            *state = to;
            true
        } else {
            false
        }
    }

    fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.lock();
        tracing::trace!(from = %*state, to = %to, "state changed");
        *state = to;
    }

    async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.change_state(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(Error::Logic(
                "the connection can only be started if it is in the disconnected state".into(),
            ));
        }

        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Failed start: release whatever got as far as opening,
                // then fall straight back to disconnected.
                let transport = self.transport.lock().take();
                if let Some(transport) = transport {
                    let _ = transport.stop().await;
                }
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let cts = CancellationTokenSource::new();
        let cancel = cts.token();
        *self.start_cts.lock() = Some(cts);

        let (base_url, connection_token) = if self.skip_negotiation {
            (self.base_url.clone(), None)
        } else {
            let negotiated =
                negotiate::negotiate(&self.http, &self.base_url, &self.config, &cancel).await?;
            tracing::info!(
                connection_id = %negotiated.connection_id,
                "negotiation complete"
            );
            *self.connection_id.lock() = Some(negotiated.connection_id.clone());
            (negotiated.url, Some(negotiated.connection_token))
        };

        let url = build_transport_url(&base_url, connection_token.as_deref());
        tracing::debug!(url = %url, "starting transport");

        let transport = (self.transport_factory)(&self.config);
        transport.start(&url).await?;
        *self.transport.lock() = Some(transport);

        self.disconnected_fired.store(false, Ordering::Release);
        self.arm_receive();
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Install the next link of the message-receive loop: one `receive`
    /// per delivered message, re-armed from inside the delivery callback.
    fn arm_receive(self: &Arc<Self>) {
        let transport = match self.transport.lock().as_ref() {
            Some(transport) => transport.clone(),
            None => return,
        };

        let weak = Arc::downgrade(self);
        transport.receive(Box::new(move |outcome| {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(message) => {
                    let handler = connection.message_handler.lock().clone();
                    if let Some(handler) = handler {
                        handler(message);
                    }
                    connection.arm_receive();
                }
                Err(error) => connection.handle_receive_error(error),
            }
        }));
    }

    fn handle_receive_error(self: &Arc<Self>, error: Error) {
        // Graceful teardown also resolves the pending receive with an
        // error; only a failure while connected is a disconnection.
        if self.state() != ConnectionState::Connected {
            return;
        }
        tracing::warn!(error = %error, "receive failed, closing connection");
        let connection = self.clone();
        tokio::spawn(async move {
            let _ = connection.stop_with_error(Some(error)).await;
        });
    }

    pub(crate) async fn stop_with_error(self: &Arc<Self>, error: Option<Error>) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            tracing::debug!("stop ignored because the connection is already disconnected");
            return Ok(());
        }

        let joined = {
            let mut waiters = self.stop_waiters.lock();
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            if waiters.len() > 1 {
                Some(rx)
            } else {
                None
            }
        };

        if let Some(rx) = joined {
            tracing::info!("stop already in progress, waiting for it to finish");
            return rx.await.unwrap_or(Ok(()));
        }

        self.set_state(ConnectionState::Disconnecting);

        if let Some(cts) = self.start_cts.lock().take() {
            cts.cancel();
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.stop().await {
                tracing::warn!(error = %e, "transport stop reported an error");
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.fire_disconnected(error);

        let waiters = std::mem::take(&mut *self.stop_waiters.lock());
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        Ok(())
    }

    /// Fan out `on_disconnected` at most once per session, strictly after
    /// the state reached disconnected.
    fn fire_disconnected(&self, error: Option<Error>) {
        if self.disconnected_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let handler = self.disconnected_handler.lock().clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}

/// The connection core handle.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        base_url: impl Into<String>,
        skip_negotiation: bool,
        config: ClientConfig,
        http_factory: &HttpClientFactory,
        transport_factory: TransportFactory,
    ) -> Self {
        let http = http_factory(&config);
        Self {
            inner: Arc::new(ConnectionInner {
                base_url: base_url.into(),
                skip_negotiation,
                config,
                http,
                transport_factory,
                state: Mutex::new(ConnectionState::Disconnected),
                transport: Mutex::new(None),
                connection_id: Mutex::new(None),
                message_handler: Mutex::new(None),
                disconnected_handler: Mutex::new(None),
                stop_waiters: Mutex::new(Vec::new()),
                start_cts: Mutex::new(None),
                disconnected_fired: AtomicBool::new(true),
            }),
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.inner.stop_with_error(None).await
    }

    pub(crate) async fn stop_with_error(&self, error: Option<Error>) -> Result<()> {
        self.inner.stop_with_error(error).await
    }

    pub async fn send(&self, payload: String, format: TransferFormat) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::Transport(format!(
                "cannot send because the connection is in the {} state",
                self.state()
            )));
        }
        let transport = self.inner.transport.lock().as_ref().cloned();
        match transport {
            Some(transport) => transport.send(payload, format).await,
            None => Err(Error::Transport(
                "cannot send because the connection has no transport".into(),
            )),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id.lock().clone()
    }

    pub(crate) fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.message_handler.lock() = Some(handler);
    }

    pub(crate) fn set_disconnected_handler(&self, handler: DisconnectedHandler) {
        *self.inner.disconnected_handler.lock() = Some(handler);
    }
}

/// The websocket URL: the (possibly redirected) base with an `http(s)`
/// scheme mapped to `ws(s)` and the connection token appended as `id=`.
fn build_transport_url(base_url: &str, connection_token: Option<&str>) -> String {
    let mut url = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_owned()
    };

    if let Some(token) = connection_token {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("id=");
        url.push_str(token);
    }
    url
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
