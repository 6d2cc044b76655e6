//! # Interview Client
//!
//! The candidate-side live session pipeline:
//!
//! ```text
//! microphone → CapturePipeline → RelayTransport → relay
//! relay → ServerEvent → PlaybackScheduler / TranscriptAggregator → SessionSnapshot
//! ```
//!
//! [`session::SessionController`] owns one session attempt at a time and
//! guarantees that a superseded attempt can never touch shared state.
//! Devices and the transport are traits so the whole pipeline runs headless.

pub mod capture;     // Microphone blocks → AUDIO frames
pub mod devices;     // Microphone/speaker seams and a virtual output clock
pub mod error;       // SessionError
pub mod feedback;    // Feedback handoff state machine
pub mod playback;    // Gapless playback scheduling
pub mod session;     // Version-controlled session orchestrator
pub mod setup;       // Interview setup, prompts, relay URL
pub mod transcript;  // Partial transcripts → turn messages
pub mod transport;   // Relay connection

pub use error::SessionError;
pub use session::{SessionController, SessionSettings, SessionSnapshot, SessionStatus};
pub use setup::{InterviewMode, InterviewSetup};
