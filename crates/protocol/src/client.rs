//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
///
/// Request bodies are carried untyped and validated by the server so that
/// every offending field can be reported back at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for an agent to join `payload.channel_name`
    StartAgent {
        #[serde(default)]
        payload: Value,
    },
    /// Stop the agent running in `payload.channel_name`
    StopAgent {
        #[serde(default)]
        payload: Value,
    },
    /// Liveness check
    Ping,
}

impl ClientMessage {
    /// Event name as it appears on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::StartAgent { .. } => "start_agent",
            ClientMessage::StopAgent { .. } => "stop_agent",
            ClientMessage::Ping => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_start_agent_with_payload_object() {
        let raw = r#"{"type":"start_agent","payload":{"channel_name":"room1","uid":42}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::StartAgent { payload } => {
                assert_eq!(payload, json!({"channel_name": "room1", "uid": 42}));
            }
            other => panic!("expected start_agent, got {:?}", other),
        }
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop_agent"}"#).unwrap();
        match msg {
            ClientMessage::StopAgent { payload } => assert!(payload.is_null()),
            other => panic!("expected stop_agent, got {:?}", other),
        }
    }

    #[test]
    fn ping_has_no_body() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.event_name(), "ping");
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }
}
