//! Typed validation of inbound request payloads.
//!
//! Payloads arrive as loose JSON (an object, or a string holding one). Every
//! field problem is collected so the client sees them all in one `error`.

use serde_json::{Map, Value};
use voicedock_protocol::{FieldError, Voice};

use crate::error::SessionError;

const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAgentRequest {
    pub channel_name: String,
    pub uid: u32,
    /// Accepted and carried, but not used by the inference config yet.
    pub language: String,
    pub system_instruction: Option<String>,
    pub voice: Voice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopAgentRequest {
    pub channel_name: String,
}

pub fn validate_start_request(payload: &Value) -> Result<StartAgentRequest, SessionError> {
    let body = payload_object(payload)?;
    let mut errors = Vec::new();

    let channel_name = required_string(&body, "channel_name", &mut errors);
    let uid = required_uid(&body, &mut errors);
    let language = optional_string(&body, "language", &mut errors)
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
    let system_instruction = optional_string(&body, "system_instruction", &mut errors)
        .filter(|s| !s.is_empty());
    let voice = optional_string(&body, "voice", &mut errors);

    let (Some(channel_name), Some(uid)) = (channel_name, uid) else {
        return Err(SessionError::Validation(errors));
    };
    if !errors.is_empty() {
        return Err(SessionError::Validation(errors));
    }

    let voice = match voice {
        Some(name) => name
            .parse::<Voice>()
            .map_err(|e| SessionError::InvalidVoice(e.0))?,
        None => Voice::default(),
    };

    Ok(StartAgentRequest {
        channel_name,
        uid,
        language,
        system_instruction,
        voice,
    })
}

pub fn validate_stop_request(payload: &Value) -> Result<StopAgentRequest, SessionError> {
    let body = payload_object(payload)?;
    let mut errors = Vec::new();
    match required_string(&body, "channel_name", &mut errors) {
        Some(channel_name) if errors.is_empty() => Ok(StopAgentRequest { channel_name }),
        _ => Err(SessionError::Validation(errors)),
    }
}

fn field_error(field: &str, message: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn payload_object(payload: &Value) -> Result<Map<String, Value>, SessionError> {
    match payload {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        // Some clients send the body as a JSON-encoded string.
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(SessionError::Validation(vec![field_error(
                "payload",
                "expected a JSON object",
            )])),
            Err(e) => Err(SessionError::Validation(vec![field_error(
                "payload",
                &format!("invalid JSON: {}", e),
            )])),
        },
        _ => Err(SessionError::Validation(vec![field_error(
            "payload",
            "expected a JSON object",
        )])),
    }
}

fn required_string(
    body: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match body.get(field) {
        None | Some(Value::Null) => {
            errors.push(field_error(field, "field required"));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            errors.push(field_error(field, "must not be empty"));
            None
        }
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(_) => {
            errors.push(field_error(field, "expected a string"));
            None
        }
    }
}

fn optional_string(
    body: &Map<String, Value>,
    field: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match body.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(field_error(field, "expected a string"));
            None
        }
    }
}

fn required_uid(body: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Option<u32> {
    const FIELD: &str = "uid";
    const EXPECTED: &str = "expected a non-negative 32-bit integer";

    let parsed = match body.get(FIELD) {
        None | Some(Value::Null) => {
            errors.push(field_error(FIELD, "field required"));
            return None;
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| integral_f64(n.as_f64()?))
            .and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        Some(_) => None,
    };

    if parsed.is_none() {
        errors.push(field_error(FIELD, EXPECTED));
    }
    parsed
}

/// `42.0` counts as an integer; `42.5` does not.
fn integral_f64(v: f64) -> Option<u64> {
    (v.fract() == 0.0 && (0.0..=u32::MAX as f64).contains(&v)).then_some(v as u64)
}
