//! Errors surfaced to the client that issued a command

use serde_json::{json, Value};
use thiserror::Error;
use voicedock_connector_core::WorkerError;
use voicedock_protocol::{ErrorKind, FieldError, ServerMessage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid request: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error("Invalid voice: {0}.")]
    InvalidVoice(String),

    #[error("Channel is already in use")]
    ChannelBusy(String),

    #[error("No active agent for channel: {0}")]
    NoActiveSession(String),

    #[error("Agent for channel {channel_name} failed: {source}")]
    WorkerFailure {
        channel_name: String,
        #[source]
        source: WorkerError,
    },
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation(_) => ErrorKind::ValidationError,
            SessionError::InvalidVoice(_) => ErrorKind::InvalidVoice,
            SessionError::ChannelBusy(_) => ErrorKind::ChannelBusy,
            SessionError::NoActiveSession(_) => ErrorKind::NoActiveSession,
            SessionError::WorkerFailure { .. } => ErrorKind::WorkerFailure,
        }
    }

    pub fn channel_name(&self) -> Option<&str> {
        match self {
            SessionError::ChannelBusy(channel)
            | SessionError::NoActiveSession(channel)
            | SessionError::WorkerFailure {
                channel_name: channel,
                ..
            } => Some(channel),
            SessionError::Validation(_) | SessionError::InvalidVoice(_) => None,
        }
    }

    fn detail(&self) -> Value {
        match self {
            SessionError::Validation(errors) => json!(errors),
            other => Value::String(other.to_string()),
        }
    }

    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            kind: self.kind(),
            detail: self.detail(),
            channel_name: self.channel_name().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_detail_lists_every_field() {
        let err = SessionError::Validation(vec![
            FieldError {
                field: "channel_name".into(),
                message: "field required".into(),
            },
            FieldError {
                field: "uid".into(),
                message: "field required".into(),
            },
        ]);

        match err.to_server_message() {
            ServerMessage::Error {
                kind,
                detail,
                channel_name,
            } => {
                assert_eq!(kind, ErrorKind::ValidationError);
                assert_eq!(detail.as_array().map(Vec::len), Some(2));
                assert_eq!(detail[0]["field"], "channel_name");
                assert!(channel_name.is_none());
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(
            err.to_string(),
            "Invalid request: channel_name: field required; uid: field required"
        );
    }

    #[test]
    fn busy_channel_error_names_the_channel() {
        let err = SessionError::ChannelBusy("room1".into());
        assert_eq!(err.kind(), ErrorKind::ChannelBusy);
        assert_eq!(err.channel_name(), Some("room1"));
        match err.to_server_message() {
            ServerMessage::Error { detail, .. } => {
                assert_eq!(detail, Value::String("Channel is already in use".into()));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_voice_names_the_rejected_value() {
        let err = SessionError::InvalidVoice("robot".into());
        assert_eq!(err.to_string(), "Invalid voice: robot.");
        assert_eq!(err.kind(), ErrorKind::InvalidVoice);
    }
}
