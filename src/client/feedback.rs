//! # Feedback Handoff
//!
//! A bounded close-out conversation layered on the live session. The
//! session controller drives this state machine; it only decides.
//!
//! ## Flow:
//! ```text
//! Idle --request--> AwaitingResponse --turn complete, playback idle--> Complete(Responded)
//!                   AwaitingResponse --turn complete, audio draining--> Draining
//!                   Draining --playback drained--> Complete(Responded)
//!                   AwaitingResponse/Draining --deadline--> Complete(DeadlineExceeded)
//! ```

use crate::client::setup::FEEDBACK_PROMPT;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Responded,
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackPhase {
    Idle,
    AwaitingResponse { deadline: Instant },
    Draining { deadline: Instant },
    Complete(FeedbackOutcome),
}

#[derive(Debug)]
pub struct FeedbackHandoff {
    phase: FeedbackPhase,
    timeout: Duration,
}

impl FeedbackHandoff {
    pub fn new(timeout: Duration) -> Self {
        Self {
            phase: FeedbackPhase::Idle,
            timeout,
        }
    }

    pub fn phase(&self) -> FeedbackPhase {
        self.phase
    }

    /// Start the handoff. Returns the text turn to send, or `None` if a
    /// handoff already happened or is in progress.
    pub fn request(&mut self, now: Instant) -> Option<String> {
        if self.phase != FeedbackPhase::Idle {
            return None;
        }
        self.phase = FeedbackPhase::AwaitingResponse {
            deadline: now + self.timeout,
        };
        Some(FEEDBACK_PROMPT.to_string())
    }

    /// Give up on an in-flight handoff (the request could not be sent).
    pub fn cancel(&mut self) {
        if self.is_active() {
            self.phase = FeedbackPhase::Idle;
        }
    }

    /// Upstream finished a turn. Returns true when this completes the handoff.
    pub fn on_turn_complete(&mut self, playback_idle: bool) -> bool {
        let FeedbackPhase::AwaitingResponse { deadline } = self.phase else {
            return false;
        };
        if playback_idle {
            self.phase = FeedbackPhase::Complete(FeedbackOutcome::Responded);
            true
        } else {
            self.phase = FeedbackPhase::Draining { deadline };
            false
        }
    }

    /// Scheduled playback emptied. Returns true when this completes the handoff.
    pub fn on_playback_drained(&mut self) -> bool {
        if matches!(self.phase, FeedbackPhase::Draining { .. }) {
            self.phase = FeedbackPhase::Complete(FeedbackOutcome::Responded);
            return true;
        }
        false
    }

    /// Returns true when the deadline has passed and the handoff is now complete.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.phase = FeedbackPhase::Complete(FeedbackOutcome::DeadlineExceeded);
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            FeedbackPhase::AwaitingResponse { deadline } | FeedbackPhase::Draining { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deadline().is_some()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, FeedbackPhase::Complete(_))
    }

    pub fn outcome(&self) -> Option<FeedbackOutcome> {
        match self.phase {
            FeedbackPhase::Complete(outcome) => Some(outcome),
            _ => None,
        }
    }
}
