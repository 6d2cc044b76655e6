//! # Audio Codec
//!
//! Pure functions converting between float samples, 16-bit PCM and the
//! base64 text encoding carried inside `AUDIO` frames and provider
//! `inlineData` blobs.
//!
//! ## Conversion:
//! - float → PCM16: multiply by 32768 with no extra clamping. Rust's
//!   float-to-int `as` cast saturates, so `1.0` lands on `i16::MAX`.
//! - PCM16 → float: divide by 32768, giving `[-1.0, 1.0)`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::time::Duration;

/// Errors while decoding inbound audio.
#[derive(Debug)]
pub enum CodecError {
    /// Payload was not valid base64
    InvalidBase64(base64::DecodeError),

    /// PCM16 payloads must hold whole 2-byte samples
    OddLength(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidBase64(err) => write!(f, "Invalid base64 audio payload: {}", err),
            CodecError::OddLength(len) => {
                write!(f, "PCM16 payload length must be even, got {} bytes", len)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<base64::DecodeError> for CodecError {
    fn from(err: base64::DecodeError) -> Self {
        CodecError::InvalidBase64(err)
    }
}

/// Scale float samples to signed 16-bit integers.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&sample| (sample * 32768.0) as i16).collect()
}

/// Scale signed 16-bit integers back to float samples.
pub fn pcm16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Serialize samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Parse little-endian bytes into samples.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);
    Ok(samples)
}

/// Capture block → `AUDIO` frame payload.
pub fn encode_block(samples: &[f32]) -> String {
    STANDARD.encode(pcm16_to_bytes(&float_to_pcm16(samples)))
}

/// Provider `inlineData` payload → float samples ready for playback.
pub fn decode_to_float(payload: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = STANDARD.decode(payload)?;
    Ok(pcm16_to_float(&bytes_to_pcm16(&bytes)?))
}

/// Playback length of `sample_count` mono samples at `sample_rate`.
pub fn duration_of(sample_count: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(sample_count as f64 / sample_rate as f64)
}

/// MIME type the provider expects for realtime PCM input.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}
