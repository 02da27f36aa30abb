//! Core types shared across the protocol

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Voices the realtime model can speak with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voice {
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Fable,
    Onyx,
    Nova,
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    pub const ALL: [Voice; 11] = [
        Voice::Alloy,
        Voice::Ash,
        Voice::Ballad,
        Voice::Coral,
        Voice::Echo,
        Voice::Fable,
        Voice::Onyx,
        Voice::Nova,
        Voice::Sage,
        Voice::Shimmer,
        Voice::Verse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Alloy => "alloy",
            Voice::Ash => "ash",
            Voice::Ballad => "ballad",
            Voice::Coral => "coral",
            Voice::Echo => "echo",
            Voice::Fable => "fable",
            Voice::Onyx => "onyx",
            Voice::Nova => "nova",
            Voice::Sage => "sage",
            Voice::Shimmer => "shimmer",
            Voice::Verse => "verse",
        }
    }
}

impl Default for Voice {
    fn default() -> Self {
        Voice::Ballad
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a voice name is not part of [`Voice::ALL`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVoice(pub String);

impl fmt::Display for UnknownVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid voice: {}.", self.0)
    }
}

impl std::error::Error for UnknownVoice {}

impl FromStr for Voice {
    type Err = UnknownVoice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Voice::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| UnknownVoice(s.to_string()))
    }
}

/// Category of an `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    InvalidVoice,
    ChannelBusy,
    NoActiveSession,
    WorkerFailure,
    ParseError,
}

/// One rejected request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Credentials a client uses to join the media channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCredentials {
    pub channel_name: String,
    pub uid: u32,
    pub token: String,
    /// Unix seconds
    pub expires_at: u64,
}

/// Lifecycle state of a channel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Stopping,
    Terminated,
}

/// Session row for the diagnostics listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub channel_name: String,
    pub client_id: u64,
    pub state: SessionState,
    pub started_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_supported_voice() {
        for voice in Voice::ALL {
            assert_eq!(voice.as_str().parse::<Voice>(), Ok(voice));
        }
    }

    #[test]
    fn rejects_unknown_and_miscased_voices() {
        assert_eq!(
            "robot".parse::<Voice>(),
            Err(UnknownVoice("robot".to_string()))
        );
        assert!("Ballad".parse::<Voice>().is_err());
    }

    #[test]
    fn default_voice_is_ballad() {
        assert_eq!(Voice::default(), Voice::Ballad);
    }
}
