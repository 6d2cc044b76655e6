//! # Interview Relay
//!
//! Live voice mock-interview rehearsal, in two halves:
//!
//! - **relay**: a WebSocket server that brokers each client connection to
//!   one upstream Gemini Live session, queueing audio until the provider is
//!   ready and ending conversations that go quiet
//! - **client**: the candidate-side session pipeline (capture, playback,
//!   transcript, feedback handoff) behind a version-controlled controller
//!
//! The binary in `main.rs` runs the relay; the client is a library.

pub mod audio;     // PCM16 codec and microphone level meter
pub mod client;    // Candidate-side session pipeline
pub mod config;    // Configuration management
pub mod error;     // Error handling types
pub mod handlers;  // HTTP request handlers
pub mod health;    // Health check endpoints
pub mod protocol;  // Client/relay frames and provider messages
pub mod relay;     // Connection broker and WebSocket actor
pub mod state;     // Shared relay state and metrics
