//! Record types carried on the bridge topics.
//!
//! These are the string-owning counterparts of the `idlc`-generated C
//! structures in `llamadds-sys`; the codec copies between the two at the
//! transport boundary. Fields that carry enumerated wire spellings stay
//! `String` here so unknown future values survive a round trip; [`Role`] and
//! [`FinishReason`] give the recognized spellings a typed form at the points
//! that interpret them.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Message role, wire-spelled lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Role {
    #[strum(serialize = "system")]
    System,
    #[strum(serialize = "user")]
    User,
    #[strum(serialize = "assistant")]
    Assistant,
}

/// Terminal-response finish reason, wire-spelled lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum FinishReason {
    /// Generation ended on an end-of-sequence token or a stop sequence.
    #[strum(serialize = "stop")]
    Stop,
    /// Generation hit the token budget.
    #[strum(serialize = "length")]
    Length,
    /// The request failed; `content` carries the diagnostic.
    #[strum(serialize = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// A chat-completion request as published on the request topic.
///
/// `temperature <= 0` and `max_tokens == 0` mean "engine default". The
/// optional fields ride the wire as sequences of length 0 or 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Opaque correlation token; must be non-empty, UUIDv4 recommended.
    pub request_id: String,
    /// Requested model; empty means the server's loaded model.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: i32,
    pub stream: bool,
    pub top_p: Option<f32>,
    pub n: Option<i32>,
    pub stop: Option<Vec<String>>,
}

impl Default for ChatCompletionRequest {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            model: String::new(),
            messages: Vec::new(),
            temperature: 0.0,
            max_tokens: 0,
            stream: false,
            top_p: None,
            n: None,
            stop: None,
        }
    }
}

/// One sample on the response topic.
///
/// In streaming mode `content` is a delta; the concatenation of every delta
/// for a `request_id` equals the full assistant message. Exactly one sample
/// per request carries `is_final = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub request_id: String,
    pub model: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub is_final: bool,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

impl ChatCompletionResponse {
    /// True when `finish_reason` is the recognized error spelling.
    pub fn is_error(&self) -> bool {
        self.finish_reason.as_deref() == Some("error")
    }
}

/// Best-effort heartbeat published on the status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub slots_idle: i32,
    pub slots_processing: i32,
    pub model_loaded: String,
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn role_wire_spellings_round_trip() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(Role::from_str(&role.to_string()).unwrap(), role);
        }
        assert!(Role::from_str("tool").is_err());
    }

    #[test]
    fn finish_reason_spellings() {
        assert_eq!(FinishReason::Stop.to_string(), "stop");
        assert_eq!(FinishReason::Length.to_string(), "length");
        assert_eq!(FinishReason::Error.to_string(), "error");
    }
}
