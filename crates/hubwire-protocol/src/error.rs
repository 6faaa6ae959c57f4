//! Protocol-level decode errors.

/// Errors produced while encoding or decoding wire frames.
///
/// Every variant maps to a `protocol_violation` at the connection layer:
/// a peer that sends malformed frames gets disconnected, not worked around.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed JSON frame: {0}")]
    MalformedJson(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("message is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unknown message type {0}")]
    UnknownMessageType(i64),

    #[error("message has no 'type' field")]
    MissingType,

    #[error("handshake frame is not terminated by a record separator")]
    UnterminatedHandshake,
}
