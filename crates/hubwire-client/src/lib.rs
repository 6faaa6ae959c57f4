//! `hubwire-client` — a SignalR-compatible hub client.
//!
//! The client speaks the Core hub protocol over WebSocket: it negotiates a
//! connection, completes the JSON handshake, invokes server methods,
//! dispatches server-to-client invocations to registered handlers, keeps
//! the connection healthy with pings and a server-timeout watchdog, and
//! (when enabled) reconnects automatically with backoff after failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ HubConnection      handshake · invocations · keepalive ·     │
//! │                    reconnect loop                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Connection         negotiate · state machine · receive loop  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ WebsocketTransport bounded queue · pending-receive slot ·    │
//! │                    delivery task · 0x1E reassembly           │
//! ├──────────────────────────────────────────────────────────────┤
//! │ WebsocketClient    event-driven socket (tokio-tungstenite)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), hubwire_client::Error> {
//! use hubwire_client::HubConnectionBuilder;
//! use serde_json::json;
//!
//! let hub = HubConnectionBuilder::new()
//!     .with_url("https://example.com/chathub")
//!     .with_automatic_reconnect(None)
//!     .build()?;
//!
//! hub.on("ReceiveMessage", |args| {
//!     println!("message: {args:?}");
//! })?;
//!
//! hub.start().await?;
//! let sum = hub.invoke("Add", vec![json!(2), json!(3)]).await?;
//! assert_eq!(sum, json!(5));
//! hub.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Not supported
//!
//! Server-to-client streaming (stream items are silently dropped),
//! client-to-server streaming, and the message-pack protocol. Connecting
//! to a legacy (ASP.NET) SignalR server fails with
//! [`Error::LegacyServerDetected`] rather than falling back.

pub mod builder;
pub mod callbacks;
pub mod cancellation;
pub mod completion;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod hub_connection;
pub mod logging;
pub mod negotiate;
pub mod registry;
pub mod scheduler;
pub mod transport;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::HubConnectionBuilder;
pub use config::ClientConfig;
pub use connection::ConnectionState;
pub use error::{Error, Result};
pub use hub_connection::HubConnection;
pub use logging::{LogWriter, StdoutLogWriter, TraceLevel};

// Re-export the wire-format crate so embedders never need a direct
// dependency on it.
pub use hubwire_protocol as protocol;

pub use hubwire_protocol::{HubMessage, RECORD_SEPARATOR};
