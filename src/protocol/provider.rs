//! Provider (Gemini Live) message shapes and the tagged event type the
//! client dispatches on.
//!
//! The provider sends loosely shaped JSON where almost every field is
//! optional. [`parse_server_events`] flattens one such message into an
//! ordered list of [`ServerEvent`]s so consumers match on a discriminant
//! instead of probing optional fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message as received from the provider (or from the relay, which
/// forwards provider messages verbatim and adds its own synthetic frames).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,

    /// Either a provider error object or the relay's `{"error": "..."}` string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    /// Discriminant of relay-injected frames (`WARNING`, `SESSION_TIMEOUT`)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub frame_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub generation_complete: bool,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,

    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// Everything the client reacts to, in the order it must be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Upstream session is ready
    SetupComplete,
    /// Partial audio transcription for one speaker
    TranscriptionDelta { role: Role, text: String },
    /// Direct text content of a model turn
    ModelText(String),
    /// Base64 PCM16 audio from the model
    InlineAudio(String),
    /// Barge-in: the user started talking over the model
    Interrupted,
    GenerationComplete,
    TurnComplete,
    /// Relay inactivity warning
    Warning(String),
    /// Relay closed the session for inactivity
    SessionTimeout(String),
    Error(String),
}

impl ProviderMessage {
    /// True when the model has finished speaking for now.
    pub fn ends_model_output(&self) -> bool {
        self.server_content
            .as_ref()
            .map(|content| content.generation_complete || content.turn_complete)
            .unwrap_or(false)
    }

    /// Flatten this message into events.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        match self.frame_type.as_deref() {
            Some("WARNING") => events.push(ServerEvent::Warning(self.message.clone().unwrap_or_default())),
            Some("SESSION_TIMEOUT") => {
                events.push(ServerEvent::SessionTimeout(self.message.clone().unwrap_or_default()))
            }
            _ => {}
        }

        if let Some(error) = &self.error {
            events.push(ServerEvent::Error(describe_error(error)));
        }

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::TranscriptionDelta { role: Role::User, text: t.text });
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(ServerEvent::TranscriptionDelta { role: Role::Model, text: t.text });
        }

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(ServerEvent::ModelText(text));
                }
                if let Some(blob) = part.inline_data {
                    events.push(ServerEvent::InlineAudio(blob.data));
                }
            }
        }

        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.generation_complete {
            events.push(ServerEvent::GenerationComplete);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }

        events
    }
}

/// Provider errors arrive as `{"code":..,"message":..}`, relay errors as a plain string.
fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

/// Parse one text frame received from the relay into events.
pub fn parse_server_events(raw: &str) -> Result<Vec<ServerEvent>, serde_json::Error> {
    let message: ProviderMessage = serde_json::from_str(raw)?;
    Ok(message.into_events())
}
