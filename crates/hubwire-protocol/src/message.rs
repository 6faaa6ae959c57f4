//! Hub message model and its JSON object mapping.
//!
//! The hub protocol tags each message with an integer `type` field, which
//! serde's string-keyed enum tagging cannot express, so conversion goes
//! through `serde_json::Value` in [`HubMessage::from_value`] /
//! [`HubMessage::to_value`]. Field names follow the established hub
//! protocol spec: `invocationId`, `target`, `arguments`, `result`, `error`,
//! `allowReconnect`.

use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// The integer message-type tags of the hub protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }
}

/// A decoded hub protocol message.
///
/// Stream-related variants exist so the connection layer can recognize them:
/// stream items are ignored, stream invocations and cancel invocations are
/// server-bound only and treated as protocol violations when received.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A method invocation. `invocation_id` is present for blocking
    /// invocations that expect a completion, absent for fire-and-forget.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// A single item of a server-to-client stream. Accepted, ignored.
    StreamItem { invocation_id: String, item: Value },
    /// The result of an invocation: either a value or an error, never both.
    Completion {
        invocation_id: String,
        error: Option<String>,
        result: Option<Value>,
    },
    /// Client-to-server only.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },
    /// Client-to-server only.
    CancelInvocation { invocation_id: String },
    /// Keepalive.
    Ping,
    /// Connection close notice from the server.
    Close {
        error: Option<String>,
        allow_reconnect: Option<bool>,
    },
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation { .. } => MessageType::Invocation,
            Self::StreamItem { .. } => MessageType::StreamItem,
            Self::Completion { .. } => MessageType::Completion,
            Self::StreamInvocation { .. } => MessageType::StreamInvocation,
            Self::CancelInvocation { .. } => MessageType::CancelInvocation,
            Self::Ping => MessageType::Ping,
            Self::Close { .. } => MessageType::Close,
        }
    }

    /// Encode this message as a JSON object.
    ///
    /// Optional fields are omitted rather than serialized as `null`, and an
    /// empty `invocation_id` on an invocation means fire-and-forget, so the
    /// field is left out entirely.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut obj = json!({
                    "type": MessageType::Invocation as i64,
                    "target": target,
                    "arguments": arguments,
                });
                if let Some(id) = non_empty(invocation_id) {
                    obj["invocationId"] = json!(id);
                }
                obj
            }
            Self::StreamItem {
                invocation_id,
                item,
            } => json!({
                "type": MessageType::StreamItem as i64,
                "invocationId": invocation_id,
                "item": item,
            }),
            Self::Completion {
                invocation_id,
                error,
                result,
            } => {
                let mut obj = json!({
                    "type": MessageType::Completion as i64,
                    "invocationId": invocation_id,
                });
                if let Some(e) = error {
                    obj["error"] = json!(e);
                } else if let Some(r) = result {
                    obj["result"] = r.clone();
                }
                obj
            }
            Self::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => json!({
                "type": MessageType::StreamInvocation as i64,
                "invocationId": invocation_id,
                "target": target,
                "arguments": arguments,
            }),
            Self::CancelInvocation { invocation_id } => json!({
                "type": MessageType::CancelInvocation as i64,
                "invocationId": invocation_id,
            }),
            Self::Ping => json!({ "type": MessageType::Ping as i64 }),
            Self::Close {
                error,
                allow_reconnect,
            } => {
                let mut obj = json!({ "type": MessageType::Close as i64 });
                if let Some(e) = error {
                    obj["error"] = json!(e);
                }
                if let Some(ar) = allow_reconnect {
                    obj["allowReconnect"] = json!(ar);
                }
                obj
            }
        }
    }

    /// Decode a message from a parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(ProtocolError::NotAnObject),
        };

        let tag = obj
            .get("type")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingType)?;
        let message_type =
            MessageType::from_i64(tag).ok_or(ProtocolError::UnknownMessageType(tag))?;

        match message_type {
            MessageType::Invocation => Ok(Self::Invocation {
                invocation_id: opt_string(&obj, "invocationId"),
                target: req_string(&obj, "target")?,
                arguments: arguments(&obj),
            }),
            MessageType::StreamItem => Ok(Self::StreamItem {
                invocation_id: req_string(&obj, "invocationId")?,
                item: obj.get("item").cloned().unwrap_or(Value::Null),
            }),
            MessageType::Completion => Ok(Self::Completion {
                invocation_id: req_string(&obj, "invocationId")?,
                error: opt_string(&obj, "error"),
                result: obj.get("result").cloned(),
            }),
            MessageType::StreamInvocation => Ok(Self::StreamInvocation {
                invocation_id: req_string(&obj, "invocationId")?,
                target: req_string(&obj, "target")?,
                arguments: arguments(&obj),
            }),
            MessageType::CancelInvocation => Ok(Self::CancelInvocation {
                invocation_id: req_string(&obj, "invocationId")?,
            }),
            MessageType::Ping => Ok(Self::Ping),
            MessageType::Close => Ok(Self::Close {
                error: opt_string(&obj, "error"),
                allow_reconnect: obj.get("allowReconnect").and_then(Value::as_bool),
            }),
        }
    }
}

fn non_empty(id: &Option<String>) -> Option<&String> {
    id.as_ref().filter(|s| !s.is_empty())
}

fn opt_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn req_string(obj: &Map<String, Value>, key: &'static str) -> Result<String, ProtocolError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtocolError::MissingField(key))
}

fn arguments(obj: &Map<String, Value>) -> Vec<Value> {
    match obj.get("arguments") {
        Some(Value::Array(args)) => args.clone(),
        _ => Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    // ── Golden encodings ───────────────────────────────────────────
    // These lock the exact JSON shape so accidental field renames or tag
    // changes cause immediate test failures.

    #[test]
    fn golden_blocking_invocation() {
        let msg = HubMessage::Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![json!(2), json!(3)],
        };
        let v = msg.to_value();
        assert_eq!(v["type"], 1);
        assert_eq!(v["invocationId"], "1");
        assert_eq!(v["target"], "Add");
        assert_eq!(v["arguments"], json!([2, 3]));
    }

    #[test]
    fn golden_nonblocking_invocation_omits_id() {
        let msg = HubMessage::Invocation {
            invocation_id: None,
            target: "Notify".into(),
            arguments: vec![],
        };
        let v = msg.to_value();
        assert!(v.get("invocationId").is_none());

        // An explicitly empty id also means fire-and-forget.
        let msg = HubMessage::Invocation {
            invocation_id: Some(String::new()),
            target: "Notify".into(),
            arguments: vec![],
        };
        assert!(msg.to_value().get("invocationId").is_none());
    }

    #[test]
    fn golden_ping() {
        assert_eq!(HubMessage::Ping.to_value(), json!({ "type": 6 }));
    }

    #[test]
    fn golden_completion_error_wins_over_result() {
        let msg = HubMessage::Completion {
            invocation_id: "7".into(),
            error: Some("boom".into()),
            result: Some(json!(42)),
        };
        let v = msg.to_value();
        assert_eq!(v["error"], "boom");
        assert!(v.get("result").is_none());
    }

    // ── Decoding ───────────────────────────────────────────────────

    #[test]
    fn decode_completion_with_result() {
        let v = json!({ "type": 3, "invocationId": "1", "result": 5 });
        let msg = HubMessage::from_value(v).unwrap();
        assert_eq!(
            msg,
            HubMessage::Completion {
                invocation_id: "1".into(),
                error: None,
                result: Some(json!(5)),
            }
        );
    }

    #[test]
    fn decode_invocation_without_arguments_defaults_empty() {
        let v = json!({ "type": 1, "target": "X" });
        match HubMessage::from_value(v).unwrap() {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                assert_eq!(target, "X");
                assert!(arguments.is_empty());
            }
            other => panic!("expected Invocation, got {other:?}"),
        }
    }

    #[test]
    fn decode_close_with_allow_reconnect() {
        let v = json!({ "type": 7, "error": "going away", "allowReconnect": true });
        assert_eq!(
            HubMessage::from_value(v).unwrap(),
            HubMessage::Close {
                error: Some("going away".into()),
                allow_reconnect: Some(true),
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let v = json!({ "type": 42 });
        assert_eq!(
            HubMessage::from_value(v),
            Err(ProtocolError::UnknownMessageType(42))
        );
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert_eq!(
            HubMessage::from_value(json!({ "target": "X" })),
            Err(ProtocolError::MissingType)
        );
    }

    #[test]
    fn decode_rejects_non_object() {
        assert_eq!(
            HubMessage::from_value(json!([1, 2, 3])),
            Err(ProtocolError::NotAnObject)
        );
    }

    #[test]
    fn decode_completion_requires_invocation_id() {
        assert_eq!(
            HubMessage::from_value(json!({ "type": 3, "result": 5 })),
            Err(ProtocolError::MissingField("invocationId"))
        );
    }

    // ── Round trips ────────────────────────────────────────────────

    #[test]
    fn invocation_round_trip() {
        let msg = HubMessage::Invocation {
            invocation_id: Some("19".into()),
            target: "Echo".into(),
            arguments: vec![json!("hi"), json!({"k": [1, 2]})],
        };
        assert_eq!(HubMessage::from_value(msg.to_value()).unwrap(), msg);
    }

    #[test]
    fn close_round_trip() {
        let msg = HubMessage::Close {
            error: None,
            allow_reconnect: None,
        };
        assert_eq!(HubMessage::from_value(msg.to_value()).unwrap(), msg);
    }
}
