//! Audio held while the upstream session is still being established.

use std::collections::VecDeque;

/// FIFO of base64 `AUDIO` payloads.
///
/// Bounded only by the connection's lifetime; the broker drains it the
/// moment the upstream session signals readiness and clears it on teardown.
#[derive(Debug, Default)]
pub struct AudioQueue {
    frames: VecDeque<String>,
}

impl AudioQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: String) {
        self.frames.push_back(payload);
    }

    /// Remove every queued payload, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
