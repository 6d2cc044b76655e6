//! # Wire Protocol
//!
//! Text-framed JSON shared by the relay and the interview client.
//!
//! ## Client → Relay:
//! - `{"type":"INITIAL_SETUP","payload":"<interviewer instruction>"}` (first frame only)
//! - `{"type":"AUDIO","payload":"<base64 PCM16 mono 16 kHz>"}`
//! - `{"type":"TEXT","payload":"<plain text turn>"}`
//!
//! ## Relay → Client:
//! - Provider messages forwarded verbatim (`serverContent`, `setupComplete`, ...)
//! - Synthetic `WARNING` / `SESSION_TIMEOUT` frames injected by the broker
//! - `{"error":"..."}` when the upstream session fails

pub mod frames;    // Client and synthetic relay frames
pub mod provider;  // Provider message shapes and the tagged ServerEvent

pub use frames::{ClientFrame, ErrorFrame, InboundFrame, ServerFrame};
pub use provider::{parse_server_events, Role, ServerEvent};
