//! The client-wide error type.
//!
//! Errors are `Clone` because a single failure fans out to several waiters:
//! every joined `stop` caller gets the same outcome, and clearing the
//! invocation table delivers one error to every in-flight invocation.

/// Errors surfaced by the hubwire client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// API contract violation — fatal to the caller, the client stays
    /// usable (e.g. `start` while connected, duplicate handler, empty
    /// method name).
    #[error("logic error: {0}")]
    Logic(String),

    /// Negotiate returned a non-200 status or unusable body.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Negotiate answered with an `error` field.
    #[error("negotiation rejected by server: {0}")]
    NegotiationRejected(String),

    /// The server speaks the legacy (ASP.NET) variant of the protocol.
    /// Fatal: never reconnect, never fall back.
    #[error("detected a legacy SignalR server; this client only supports the Core protocol")]
    LegacyServerDetected,

    /// Underlying socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The handshake did not resolve within the configured timeout.
    #[error("timed out waiting for the server to respond to the handshake message")]
    HandshakeTimeout,

    /// The server rejected the handshake.
    #[error("received an error during handshake: {0}")]
    HandshakeRejected(String),

    /// Unexpected frame type, malformed JSON, or unknown message type.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Keepalive expired without hearing from the server.
    #[error("server timeout ({0} ms) elapsed without receiving a message from the server")]
    ServerTimeout(u64),

    /// The operation was canceled.
    #[error("the operation was canceled")]
    Canceled,

    /// A server-supplied invocation error, delivered to the invoker.
    #[error("{0}")]
    Hub(String),

    /// The connection stopped before an in-flight operation completed.
    #[error("{0}")]
    ConnectionStopped(String),
}

impl From<hubwire_protocol::ProtocolError> for Error {
    fn from(e: hubwire_protocol::ProtocolError) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}

/// Convenience alias used throughout the client crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            Error::Logic("x".into()).to_string(),
            "logic error: x"
        );
        assert_eq!(
            Error::ServerTimeout(30_000).to_string(),
            "server timeout (30000 ms) elapsed without receiving a message from the server"
        );
        assert_eq!(Error::Hub("denied".into()).to_string(), "denied");
    }

    #[test]
    fn protocol_error_converts_to_violation() {
        let e: Error = hubwire_protocol::ProtocolError::MissingType.into();
        assert!(matches!(e, Error::ProtocolViolation(_)));
    }
}
