//! # Audio Module
//!
//! Sample-level helpers shared by the capture and playback pipelines.
//!
//! ## Key Components:
//! - **Codec**: PCM16 ↔ float conversion and the base64 transport encoding
//! - **Level meter**: Coarse 0-255 microphone level for visualization
//!
//! ## Audio Format Requirements:
//! - **Outbound (capture)**: 16 kHz, 16-bit PCM, mono
//! - **Inbound (playback)**: 24 kHz, 16-bit PCM, mono
//! - **Encoding**: Little-endian signed integers, base64 on the wire

pub mod codec;  // PCM16 conversion and base64 transport encoding
pub mod level;  // Frequency-domain microphone level meter

pub use codec::CodecError;
pub use level::LevelMeter;
