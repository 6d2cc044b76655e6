use serde::{Deserialize, Serialize};

/// Text of the WARNING frame sent after the inactivity warning elapses.
pub const INACTIVITY_WARNING_MESSAGE: &str =
    "Are you still there? The interview will end soon if there is no response.";

/// Text of the SESSION_TIMEOUT frame sent right before the relay closes.
pub const SESSION_TIMEOUT_MESSAGE: &str = "The interview session was closed due to inactivity.";

/// Error sent back for client input that is not a usable frame. The
/// connection stays open after it.
pub const PARSE_ERROR_MESSAGE: &str = "Failed to process message.";

/// Frames a client sends to the relay.
///
/// Serialized adjacently tagged, e.g. `{"type":"AUDIO","payload":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    /// Interview context used as the upstream system instruction
    #[serde(rename = "INITIAL_SETUP")]
    InitialSetup(String),

    /// One base64-encoded capture block
    #[serde(rename = "AUDIO")]
    Audio(String),

    /// A plain text user turn (used by the feedback handoff)
    #[serde(rename = "TEXT")]
    Text(String),
}

impl ClientFrame {
    /// Wire name of the frame, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::InitialSetup(_) => "INITIAL_SETUP",
            ClientFrame::Audio(_) => "AUDIO",
            ClientFrame::Text(_) => "TEXT",
        }
    }
}

/// One inbound client message, as the relay sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Client(ClientFrame),
    /// Well-formed JSON whose `type` the relay does not interpret.
    /// Relayed upstream byte for byte.
    Passthrough { kind: String, raw: String },
}

impl InboundFrame {
    /// Fails for non-JSON input, for objects without a string `type`, and
    /// for known frame types with a malformed payload.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match value.get("type").and_then(|kind| kind.as_str()) {
            Some(kind) if !matches!(kind, "INITIAL_SETUP" | "AUDIO" | "TEXT") => Ok(InboundFrame::Passthrough {
                kind: kind.to_string(),
                raw: raw.to_string(),
            }),
            _ => serde_json::from_value(value).map(InboundFrame::Client),
        }
    }
}

/// Synthetic frames the broker injects into the provider message stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Inactivity warning issued
    #[serde(rename = "WARNING")]
    Warning { message: String },

    /// Hard timeout reached; the connection is closing
    #[serde(rename = "SESSION_TIMEOUT")]
    SessionTimeout { message: String },
}

impl ServerFrame {
    pub fn inactivity_warning() -> Self {
        ServerFrame::Warning {
            message: INACTIVITY_WARNING_MESSAGE.to_string(),
        }
    }

    pub fn session_timeout() -> Self {
        ServerFrame::SessionTimeout {
            message: SESSION_TIMEOUT_MESSAGE.to_string(),
        }
    }
}

/// `{"error": "..."}` frame sent when something goes wrong on the relay side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}
