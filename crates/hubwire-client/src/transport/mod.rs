//! Transport layer: the hub-facing pull-style contract and the adapter
//! that bridges it to the event-driven websocket client underneath.

pub mod bridge;
pub mod websocket;

use std::sync::Arc;

use async_trait::async_trait;

use hubwire_protocol::TransferFormat;

use crate::config::ClientConfig;
use crate::error::Result;

pub use bridge::WebsocketTransport;
pub use websocket::{TungsteniteClient, WebsocketClient, WebsocketEvent, WebsocketFactory};

/// A one-shot continuation installed by [`Transport::receive`]. Fires
/// exactly once with the next complete message or an error.
pub type ReceiveCallback = Box<dyn FnOnce(Result<String>) + Send + 'static>;

/// The hub-facing transport contract.
///
/// `receive` is pull-style: each call installs a one-shot continuation for
/// the *next* message; after it fires, the caller re-arms by calling
/// `receive` again. The adapter must never fire a continuation twice.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the transport. Resolves when the underlying socket is up or
    /// with an error (including connect timeout).
    async fn start(&self, url: &str) -> Result<()>;

    /// Drain and shut down. Resolves once resources are released.
    async fn stop(&self) -> Result<()>;

    /// Send one payload in the given transfer format; resolves on
    /// acknowledgement or error.
    async fn send(&self, payload: String, format: TransferFormat) -> Result<()>;

    /// Install the one-shot continuation for the next message.
    fn receive(&self, callback: ReceiveCallback);
}

/// Builds the transport bound to a connection attempt.
pub type TransportFactory = Arc<dyn Fn(&ClientConfig) -> Arc<dyn Transport> + Send + Sync>;

/// The default factory: a [`WebsocketTransport`] over the websocket client
/// produced by `websocket_factory`.
pub fn default_transport_factory(websocket_factory: WebsocketFactory) -> TransportFactory {
    Arc::new(move |config| {
        let client = websocket_factory(config);
        Arc::new(WebsocketTransport::new(client, config)) as Arc<dyn Transport>
    })
}
