//! Hub client protocol
//!
//! JSON messages over the websocket, tagged by `type`. Clients manage
//! channel subscriptions and ping; the server pushes channel events and
//! answers requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event channels clients can subscribe to
pub mod channels {
    pub const STATE_CHANGED: &str = "device.state_changed";
    pub const HEALTH_CHANGED: &str = "device.health_changed";

    pub fn is_known(channel: &str) -> bool {
        channel == STATE_CHANGED || channel == HEALTH_CHANGED
    }
}

/// Client → server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channels: Vec<String>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

/// Server → client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Connected {
        session_id: String,
        version: String,
    },
    /// Channel event push
    Event {
        channel: String,
        data: Value,
    },
    /// Positive reply to a subscribe/unsubscribe request
    Response {
        /// Channels now active for the session
        channels: Vec<String>,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parses() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","channels":["device.state_changed"]}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { channels } if channels.len() == 1));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { timestamp: None }));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let msg = ServerMessage::Event {
            channel: channels::STATE_CHANGED.to_string(),
            data: serde_json::json!({"device_id": "lamp-1"}),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["channel"], "device.state_changed");
    }

    #[test]
    fn test_known_channels() {
        assert!(channels::is_known("device.state_changed"));
        assert!(channels::is_known("device.health_changed"));
        assert!(!channels::is_known("device.deleted"));
    }
}
