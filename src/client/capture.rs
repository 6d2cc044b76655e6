//! # Capture Pipeline
//!
//! Microphone blocks → outbound frames.
//!
//! ## Per block:
//! 1. Update the advisory level meter (never affects encoding)
//! 2. Drop the block if capture is muted or stopped
//! 3. On the first block that goes out, send `INITIAL_SETUP` first
//! 4. Send the block as PCM16 base64 `AUDIO`
//!
//! Deferring the handshake to the first block means the relay only creates
//! an upstream session once audio is actually flowing.

use crate::audio::codec::encode_block;
use crate::audio::level::LevelMeter;
use crate::protocol::frames::ClientFrame;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Where outbound frames go.
pub trait FrameSink: Send {
    /// Returns false when the frame could not be delivered.
    fn send_frame(&mut self, frame: ClientFrame) -> bool;
}

impl FrameSink for UnboundedSender<ClientFrame> {
    fn send_frame(&mut self, frame: ClientFrame) -> bool {
        self.send(frame).is_ok()
    }
}

pub struct CapturePipeline<S: FrameSink> {
    sink: Option<S>,
    setup_payload: String,
    handshake_sent: bool,
    muted: bool,
    meter: LevelMeter,
    blocks_sent: u64,
}

impl<S: FrameSink> CapturePipeline<S> {
    /// `setup_payload` is the rendered interviewer instruction.
    pub fn new(setup_payload: String) -> Self {
        Self {
            sink: None,
            setup_payload,
            handshake_sent: false,
            muted: false,
            meter: LevelMeter::new(),
            blocks_sent: 0,
        }
    }

    pub fn start(&mut self, sink: S) {
        self.sink = Some(sink);
    }

    /// Detach the sink. Blocks processed afterwards only update the level.
    pub fn stop(&mut self) {
        if self.sink.take().is_some() {
            debug!(blocks = self.blocks_sent, "Capture stopped");
        }
        self.meter.reset();
    }

    pub fn is_running(&self) -> bool {
        self.sink.is_some()
    }

    /// Suppress outbound frames without tearing anything down.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn level_handle(&self) -> Arc<AtomicU8> {
        self.meter.handle()
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    pub fn process_block(&mut self, block: &[f32]) {
        self.meter.update(block);

        if self.muted || !self.ensure_handshake() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if sink.send_frame(ClientFrame::Audio(encode_block(block))) {
            self.blocks_sent += 1;
        }
    }

    /// Send `INITIAL_SETUP` unless it already went out. Returns whether the
    /// relay has (or now has) the handshake. Ignores muting, so a text turn
    /// can still be preceded by the handshake.
    pub fn ensure_handshake(&mut self) -> bool {
        if self.handshake_sent {
            return true;
        }
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        if !sink.send_frame(ClientFrame::InitialSetup(self.setup_payload.clone())) {
            warn!("Relay connection gone, dropping handshake");
            return false;
        }
        self.handshake_sent = true;
        debug!("Sent INITIAL_SETUP");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct VecSink(Vec<ClientFrame>);

    impl FrameSink for &mut VecSink {
        fn send_frame(&mut self, frame: ClientFrame) -> bool {
            self.0.push(frame);
            true
        }
    }

    fn tone() -> Vec<f32> {
        (0..4096).map(|i| (i as f32 * 0.2).sin() * 0.5).collect()
    }

    #[test]
    fn test_handshake_precedes_first_block_only() {
        let mut frames = VecSink::default();
        {
            let mut capture = CapturePipeline::new("prompt".to_string());
            capture.start(&mut frames);
            capture.process_block(&tone());
            capture.process_block(&tone());
            assert_eq!(capture.blocks_sent(), 2);
        }
        assert_eq!(frames.0.len(), 3);
        assert_eq!(frames.0[0], ClientFrame::InitialSetup("prompt".to_string()));
        assert!(matches!(frames.0[1], ClientFrame::Audio(_)));
        assert!(matches!(frames.0[2], ClientFrame::Audio(_)));
    }

    #[test]
    fn test_muted_capture_sends_nothing_but_keeps_metering() {
        let mut frames = VecSink::default();
        let level = {
            let mut capture = CapturePipeline::new("prompt".to_string());
            let level = capture.level_handle();
            capture.start(&mut frames);
            capture.set_muted(true);
            for _ in 0..5 {
                capture.process_block(&tone());
            }
            assert!(capture.is_running());
            level.load(Ordering::Relaxed)
        };
        assert!(frames.0.is_empty());
        assert!(level > 0);
    }

    #[test]
    fn test_unmute_resumes_with_handshake() {
        let mut frames = VecSink::default();
        {
            let mut capture = CapturePipeline::new("prompt".to_string());
            capture.start(&mut frames);
            capture.set_muted(true);
            capture.process_block(&tone());
            capture.set_muted(false);
            capture.process_block(&tone());
        }
        assert_eq!(frames.0.len(), 2);
        assert!(matches!(frames.0[0], ClientFrame::InitialSetup(_)));
    }

    #[test]
    fn test_explicit_handshake_sent_once() {
        let mut frames = VecSink::default();
        {
            let mut capture = CapturePipeline::new("prompt".to_string());
            assert!(!capture.ensure_handshake());
            capture.start(&mut frames);
            capture.set_muted(true);
            assert!(capture.ensure_handshake());
            assert!(capture.ensure_handshake());
            capture.set_muted(false);
            capture.process_block(&tone());
        }
        assert_eq!(frames.0.len(), 2);
        assert!(matches!(frames.0[1], ClientFrame::Audio(_)));
    }

    #[tokio::test]
    async fn test_stopped_capture_drops_blocks() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut capture = CapturePipeline::new("prompt".to_string());
        capture.start(tx);
        capture.process_block(&tone());
        capture.stop();
        capture.process_block(&tone());
        assert!(!capture.is_running());

        assert!(matches!(rx.recv().await, Some(ClientFrame::InitialSetup(_))));
        assert!(matches!(rx.recv().await, Some(ClientFrame::Audio(_))));
        assert!(rx.recv().await.is_none());
    }
}
