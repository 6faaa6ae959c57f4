//! Handshake frames: the first exchange after the transport opens.
//!
//! The client sends `{"protocol":"json","version":1}\x1E`; the server
//! answers with `{}\x1E` on success or `{"error":"..."}\x1E` on rejection.
//! Anything after the server's handshake frame is regular messages and is
//! returned to the caller as leftover input.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::json::HubProtocol;
use crate::RECORD_SEPARATOR_CHAR;

/// The client's handshake request body.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

/// Produce the handshake frame for the given protocol, separator included.
pub fn write_handshake(protocol: &dyn HubProtocol) -> String {
    let request = HandshakeRequest {
        protocol: protocol.name().to_owned(),
        version: protocol.version(),
    };
    // Serializing a two-field struct cannot fail.
    let mut frame = serde_json::to_string(&request).expect("handshake serialization");
    frame.push(RECORD_SEPARATOR_CHAR);
    frame
}

/// Consume one separator-terminated handshake frame from `input`.
///
/// Returns the remaining input (regular messages that arrived in the same
/// read) and the parsed response object. Interpreting the object — the
/// `error` field, an unexpected `type` field — is the connection layer's
/// job.
pub fn parse_handshake(input: &str) -> Result<(String, Map<String, Value>), ProtocolError> {
    let separator = input
        .find(RECORD_SEPARATOR_CHAR)
        .ok_or(ProtocolError::UnterminatedHandshake)?;

    let frame = &input[..separator];
    let leftover = input[separator + 1..].to_owned();

    let value: Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    match value {
        Value::Object(obj) => Ok((leftover, obj)),
        _ => Err(ProtocolError::NotAnObject),
    }
}
