//! The JSON hub protocol: text frames, one JSON object per record.
//!
//! [`HubProtocol`] is the seam a second protocol implementation would plug
//! into; [`JsonHubProtocol`] is the only one shipped.

use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::HubMessage;
use crate::RECORD_SEPARATOR_CHAR;

/// Whether a protocol's frames are text or binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// A hub protocol: encodes and decodes [`HubMessage`]s to and from wire
/// frames.
pub trait HubProtocol: Send + Sync {
    /// Protocol name advertised in the handshake (e.g. `"json"`).
    fn name(&self) -> &'static str;

    /// Protocol version advertised in the handshake.
    fn version(&self) -> u32;

    fn transfer_format(&self) -> TransferFormat;

    /// Produce one wire frame, record separator included.
    fn write_message(&self, message: &HubMessage) -> String;

    /// Parse every complete message in `input`.
    ///
    /// Frames are split on the record separator. A missing trailing
    /// separator is tolerated: the final segment is parsed as a frame of
    /// its own. Empty segments (e.g. from a trailing separator) are
    /// skipped.
    fn parse_messages(&self, input: &str) -> Result<Vec<HubMessage>, ProtocolError>;
}

/// The standard text JSON protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> String {
        let mut frame = message.to_value().to_string();
        frame.push(RECORD_SEPARATOR_CHAR);
        frame
    }

    fn parse_messages(&self, input: &str) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        for frame in input.split(RECORD_SEPARATOR_CHAR) {
            if frame.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(frame)
                .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
            messages.push(HubMessage::from_value(value)?);
        }
        Ok(messages)
    }
}
