//! Action Cable wire protocol: inbound frame classification and outbound commands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Values of the `type` field on server frames.
pub mod message_type {
    pub const WELCOME: &str = "welcome";
    pub const PING: &str = "ping";
    pub const CONFIRMATION: &str = "confirm_subscription";
    pub const REJECTION: &str = "reject_subscription";
    pub const DISCONNECT: &str = "disconnect";
}

/// Values of the `command` field on client frames.
pub mod command_type {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const MESSAGE: &str = "message";
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    identifier: Option<String>,
    message: Option<Value>,
    reason: Option<String>,
    reconnect: Option<bool>,
}

/// A parsed server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First frame of a session; the connection is now open.
    Welcome,
    /// Heartbeat. The server sends its clock in unix seconds.
    Ping { timestamp: Option<i64> },
    Confirmation { identifier: String },
    Rejection { identifier: String },
    /// The server is about to close the session.
    Disconnect {
        reason: Option<String>,
        reconnect: bool,
    },
    /// A broadcast for the channel named by `identifier`.
    Data { identifier: String, payload: Value },
}

impl Message {
    /// Classify a text frame.
    ///
    /// Frames without a recognised `type` are data frames as long as they
    /// carry an identifier. Anything else is a [`Error::Protocol`].
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid frame {text:?}: {e}")))?;
        if !value.is_object() {
            return Err(Error::Protocol(format!("frame is not an object: {text:?}")));
        }
        let raw: RawFrame = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("invalid frame {text:?}: {e}")))?;

        match raw.kind.as_deref() {
            Some(message_type::WELCOME) => Ok(Message::Welcome),
            Some(message_type::PING) => Ok(Message::Ping {
                timestamp: raw.message.as_ref().and_then(Value::as_i64),
            }),
            Some(message_type::CONFIRMATION) => Ok(Message::Confirmation {
                identifier: require_identifier(raw.identifier, message_type::CONFIRMATION)?,
            }),
            Some(message_type::REJECTION) => Ok(Message::Rejection {
                identifier: require_identifier(raw.identifier, message_type::REJECTION)?,
            }),
            Some(message_type::DISCONNECT) => Ok(Message::Disconnect {
                reason: raw.reason,
                reconnect: raw.reconnect.unwrap_or(true),
            }),
            other => match raw.identifier {
                Some(identifier) => Ok(Message::Data {
                    identifier,
                    payload: raw.message.unwrap_or(Value::Null),
                }),
                None => Err(Error::Protocol(format!(
                    "frame of type {other:?} has no identifier"
                ))),
            },
        }
    }
}

fn require_identifier(identifier: Option<String>, kind: &str) -> Result<String, Error> {
    identifier.ok_or_else(|| Error::Protocol(format!("{kind} frame without identifier")))
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A client frame addressed to one channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    command: &'static str,
    identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

impl Command {
    pub fn subscribe(identifier: &str) -> Self {
        Self::new(command_type::SUBSCRIBE, identifier, None)
    }

    pub fn unsubscribe(identifier: &str) -> Self {
        Self::new(command_type::UNSUBSCRIBE, identifier, None)
    }

    /// A `message` command. The server expects `data` as a JSON-encoded string.
    pub fn message(identifier: &str, data: &Value) -> Self {
        Self::new(command_type::MESSAGE, identifier, Some(data.to_string()))
    }

    fn new(command: &'static str, identifier: &str, data: Option<String>) -> Self {
        Self {
            command,
            identifier: identifier.to_string(),
            data,
        }
    }

    pub fn command(&self) -> &str {
        self.command
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTIFIER: &str = r#"{"channel":"CommentsChannel"}"#;

    #[test]
    fn parse_welcome() {
        let msg = Message::parse(r#"{"type":"welcome"}"#).unwrap();
        assert_eq!(msg, Message::Welcome);
    }

    #[test]
    fn parse_ping() {
        let msg = Message::parse(r#"{"type":"ping","message":1700000000}"#).unwrap();
        assert_eq!(
            msg,
            Message::Ping {
                timestamp: Some(1700000000)
            }
        );
    }

    #[test]
    fn parse_ping_without_timestamp() {
        let msg = Message::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, Message::Ping { timestamp: None });
    }

    #[test]
    fn parse_confirmation() {
        let frame = serde_json::json!({
            "type": "confirm_subscription",
            "identifier": IDENTIFIER,
        });
        let msg = Message::parse(&frame.to_string()).unwrap();
        assert_eq!(
            msg,
            Message::Confirmation {
                identifier: IDENTIFIER.to_string()
            }
        );
    }

    #[test]
    fn parse_rejection() {
        let frame = serde_json::json!({
            "type": "reject_subscription",
            "identifier": IDENTIFIER,
        });
        let msg = Message::parse(&frame.to_string()).unwrap();
        assert_eq!(
            msg,
            Message::Rejection {
                identifier: IDENTIFIER.to_string()
            }
        );
    }

    #[test]
    fn parse_confirmation_without_identifier_is_error() {
        let err = Message::parse(r#"{"type":"confirm_subscription"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn parse_disconnect() {
        let msg = Message::parse(
            r#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::Disconnect {
                reason: Some("unauthorized".to_string()),
                reconnect: false,
            }
        );
    }

    #[test]
    fn parse_disconnect_defaults_to_reconnect() {
        let msg = Message::parse(r#"{"type":"disconnect","reason":"restart"}"#).unwrap();
        assert!(matches!(msg, Message::Disconnect { reconnect: true, .. }));
    }

    #[test]
    fn parse_data() {
        let frame = serde_json::json!({
            "identifier": IDENTIFIER,
            "message": {"body": "hello", "id": 42},
        });
        let msg = Message::parse(&frame.to_string()).unwrap();
        assert_eq!(
            msg,
            Message::Data {
                identifier: IDENTIFIER.to_string(),
                payload: serde_json::json!({"body": "hello", "id": 42}),
            }
        );
    }

    #[test]
    fn parse_unknown_type_with_identifier_is_data() {
        let frame = serde_json::json!({
            "type": "something_new",
            "identifier": IDENTIFIER,
            "message": [1, 2, 3],
        });
        let msg = Message::parse(&frame.to_string()).unwrap();
        assert!(matches!(msg, Message::Data { ref payload, .. } if *payload == serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn parse_data_without_message_has_null_payload() {
        let frame = serde_json::json!({ "identifier": IDENTIFIER });
        let msg = Message::parse(&frame.to_string()).unwrap();
        assert!(matches!(msg, Message::Data { payload: Value::Null, .. }));
    }

    #[test]
    fn parse_malformed() {
        assert!(matches!(
            Message::parse("not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(Message::parse("[1,2]"), Err(Error::Protocol(_))));
        assert!(matches!(Message::parse("{}"), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_rejects_non_object_frames() {
        // Positional fields would otherwise line up with type/identifier/message.
        let array = r#"[null,"{\"channel\":\"X\"}",{"a":1}]"#;
        assert!(matches!(Message::parse(array), Err(Error::Protocol(_))));
        assert!(matches!(Message::parse("42"), Err(Error::Protocol(_))));
        assert!(matches!(Message::parse(r#""welcome""#), Err(Error::Protocol(_))));
        assert!(matches!(Message::parse("null"), Err(Error::Protocol(_))));
    }

    #[test]
    fn subscribe_wire_format() {
        let json = Command::subscribe(IDENTIFIER).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"command":"subscribe","identifier":"{\"channel\":\"CommentsChannel\"}"}"#
        );
    }

    #[test]
    fn unsubscribe_wire_format() {
        let json = Command::unsubscribe(IDENTIFIER).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"command":"unsubscribe","identifier":"{\"channel\":\"CommentsChannel\"}"}"#
        );
    }

    #[test]
    fn message_data_is_string_encoded() {
        let cmd = Command::message(IDENTIFIER, &serde_json::json!({"action": "speak"}));
        assert_eq!(cmd.command(), command_type::MESSAGE);
        assert_eq!(cmd.data(), Some(r#"{"action":"speak"}"#));

        let json: Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(json["command"], "message");
        assert_eq!(json["identifier"], IDENTIFIER);
        assert_eq!(json["data"], r#"{"action":"speak"}"#);
    }
}
