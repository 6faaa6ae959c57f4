//! The event-driven websocket layer.
//!
//! [`WebsocketClient`] models the underlying socket the way network stacks
//! deliver it: frames arrive as events on the reader's task, not as values
//! a caller pulls. The bridge in [`super::bridge`] converts that into the
//! hub's pull-style contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hubwire_protocol::TransferFormat;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// An event fired by the websocket layer.
pub enum WebsocketEvent {
    /// A chunk of inbound text. May hold a fragment of a frame, one frame,
    /// or several; the bridge's reassembler sorts that out.
    Data(String),
    /// The socket is gone: peer close, read error, or end of stream.
    Closed(Error),
}

/// Receives [`WebsocketEvent`]s. Runs on the socket's reader task, so it
/// must stay cheap: enqueue and signal, nothing more.
pub type EventHandler = Arc<dyn Fn(WebsocketEvent) + Send + Sync>;

/// The event-driven websocket contract.
#[async_trait]
pub trait WebsocketClient: Send + Sync {
    /// Connect and begin delivering events to `handler`. Resolves once the
    /// socket is open or with an error (including connect timeout).
    async fn start(&self, url: &str, handler: EventHandler) -> Result<()>;

    /// Close the socket and stop delivering events.
    async fn stop(&self) -> Result<()>;

    /// Send one frame, as text or binary per `format`.
    async fn send(&self, payload: String, format: TransferFormat) -> Result<()>;
}

/// Builds the websocket client bound to a connection attempt.
pub type WebsocketFactory = Arc<dyn Fn(&ClientConfig) -> Arc<dyn WebsocketClient> + Send + Sync>;

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

struct Active {
    sink: WsSink,
    reader: tokio::task::JoinHandle<()>,
}

/// The default tokio-tungstenite client.
pub struct TungsteniteClient {
    connect_timeout: Duration,
    active: tokio::sync::Mutex<Option<Active>>,
}

impl TungsteniteClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// The default [`WebsocketFactory`].
    pub fn factory() -> WebsocketFactory {
        Arc::new(|config| {
            Arc::new(TungsteniteClient::new(config.connect_timeout)) as Arc<dyn WebsocketClient>
        })
    }
}

impl Drop for TungsteniteClient {
    fn drop(&mut self) {
        // Best-effort: keep an orphaned reader from outliving the client.
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(active) = active.take() {
                active.reader.abort();
            }
        }
    }
}

#[async_trait]
impl WebsocketClient for TungsteniteClient {
    async fn start(&self, url: &str, handler: EventHandler) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::Logic("websocket client is already started".into()));
        }

        tracing::debug!(url = %url, "opening websocket");

        let connect = tokio_tungstenite::connect_async(url);
        let (stream, _response) = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(Error::Transport(format!("websocket connect failed: {e}")))
            }
            Err(_) => {
                return Err(Error::Transport(format!(
                    "websocket connect timed out after {} ms",
                    self.connect_timeout.as_millis()
                )))
            }
        };

        let (sink, mut read) = stream.split();

        // Reader task: translate frames into events. Fires exactly one
        // Closed event, then exits.
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => handler(WebsocketEvent::Data(text)),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => handler(WebsocketEvent::Data(text)),
                        Err(_) => {
                            break Error::Transport(
                                "received a binary frame that is not valid UTF-8".into(),
                            )
                        }
                    },
                    Some(Ok(Message::Close(_))) => {
                        break Error::Transport("websocket closed by the server".into())
                    }
                    // Control frames; tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Error::Transport(format!("websocket error: {e}")),
                    None => break Error::Transport("websocket stream ended".into()),
                }
            };
            handler(WebsocketEvent::Closed(reason));
        });

        *active = Some(Active { sink, reader });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(mut active) = active.take() {
            // A failed close frame just means the peer beat us to it.
            let _ = active.sink.send(Message::Close(None)).await;
            let _ = active.sink.close().await;
            active.reader.abort();
        }
        Ok(())
    }

    async fn send(&self, payload: String, format: TransferFormat) -> Result<()> {
        let message = match format {
            TransferFormat::Text => Message::Text(payload),
            TransferFormat::Binary => Message::Binary(payload.into_bytes()),
        };
        let mut active = self.active.lock().await;
        match active.as_mut() {
            Some(active) => active
                .sink
                .send(message)
                .await
                .map_err(|e| Error::Transport(format!("websocket send failed: {e}"))),
            None => Err(Error::Transport("websocket is not connected".into())),
        }
    }
}
