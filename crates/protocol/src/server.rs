//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ChannelCredentials, ErrorKind};

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Connection
    Welcome {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<ChannelCredentials>,
    },
    Pong,

    // Lifecycle
    AgentStarted {
        channel_name: String,
        message: String,
    },
    AgentStopped {
        channel_name: String,
        message: String,
    },

    // Relayed agent output
    AgentMessage {
        channel_name: String,
        payload: String,
    },

    // Errors
    Error {
        kind: ErrorKind,
        detail: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_name: Option<String>,
    },
}

impl ServerMessage {
    /// Event name as it appears on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Pong => "pong",
            ServerMessage::AgentStarted { .. } => "agent_started",
            ServerMessage::AgentStopped { .. } => "agent_stopped",
            ServerMessage::AgentMessage { .. } => "agent_message",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_message_serializes_with_snake_case_tag() {
        let msg = ServerMessage::AgentMessage {
            channel_name: "room1".into(),
            payload: "Hi".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "agent_message", "channel_name": "room1", "payload": "Hi"})
        );
    }

    #[test]
    fn welcome_omits_missing_credentials() {
        let msg = ServerMessage::Welcome {
            message: "Hello world".into(),
            credentials: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("credentials").is_none());
    }

    #[test]
    fn error_carries_kind_and_detail() {
        let msg = ServerMessage::Error {
            kind: ErrorKind::ChannelBusy,
            detail: json!("Channel is already in use"),
            channel_name: Some("room1".into()),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "channel_busy");
        assert_eq!(value["channel_name"], "room1");
        assert_eq!(msg.event_name(), "error");
    }
}
