//! Wire format for the hubwire client: hub message model, the JSON hub
//! protocol, and handshake frames.
//!
//! This crate is the **single source of truth** for the client ↔ hub wire
//! format. The client crate never builds protocol JSON by hand — it only
//! goes through the types and codecs defined here.
//!
//! # Framing
//!
//! Messages on the wire are delimited by a single record-separator byte
//! ([`RECORD_SEPARATOR`], `0x1E`). The handshake is one such frame
//! (`{"protocol":"json","version":1}\x1E`), and every hub message after it
//! is another. [`JsonHubProtocol::parse_messages`] tolerates input with or
//! without a trailing separator so callers that strip separators while
//! reassembling frames don't have to special-case the last frame.
//!
//! # Message model
//!
//! [`HubMessage`] is a tagged union over the hub protocol's message types.
//! The tag is the integer `type` field (1 invocation, 2 stream item,
//! 3 completion, 4 stream invocation, 5 cancel invocation, 6 ping,
//! 7 close). Stream-related messages are modeled so they can be recognized
//! and rejected or ignored — this client does not implement streaming.

pub mod error;
pub mod handshake;
pub mod json;
pub mod message;

pub use error::ProtocolError;
pub use handshake::{parse_handshake, write_handshake, HandshakeRequest};
pub use json::{HubProtocol, JsonHubProtocol, TransferFormat};
pub use message::{HubMessage, MessageType};

/// The record separator delimiting every frame on the wire.
///
/// This is a protocol constant, not configuration.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// [`RECORD_SEPARATOR`] as a `char`, for string scanning.
pub const RECORD_SEPARATOR_CHAR: char = '\u{1e}';
