//! Partial transcripts → discrete turn [`Message`]s.

use crate::protocol::provider::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One complete turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Where the model's text for the current turn came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelSource {
    Transcription,
    Text,
}

/// Accumulates per-speaker text until a turn boundary.
///
/// The model's words can arrive twice: as direct text parts and as an audio
/// transcription of the same speech. Only one source is kept per turn, and
/// direct text wins.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    user: String,
    model: String,
    model_source: Option<ModelSource>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_transcription(&mut self, role: Role, delta: &str) {
        match role {
            Role::User => self.user.push_str(delta),
            Role::Model => {
                if self.model_source == Some(ModelSource::Text) {
                    return;
                }
                self.model_source = Some(ModelSource::Transcription);
                self.model.push_str(delta);
            }
        }
    }

    pub fn push_model_text(&mut self, delta: &str) {
        if self.model_source != Some(ModelSource::Text) {
            self.model.clear();
            self.model_source = Some(ModelSource::Text);
        }
        self.model.push_str(delta);
    }

    pub fn has_pending(&self) -> bool {
        !self.user.trim().is_empty() || !self.model.trim().is_empty()
    }

    /// Emit the buffered turn (user before model) and reset both buffers.
    /// Whitespace-only spans are dropped.
    pub fn flush(&mut self, timestamp: DateTime<Utc>) -> Vec<Message> {
        let user = std::mem::take(&mut self.user);
        let model = std::mem::take(&mut self.model);
        self.model_source = None;

        [(Role::User, user), (Role::Model, model)]
            .into_iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(role, text)| Message { role, text, timestamp })
            .collect()
    }
}
