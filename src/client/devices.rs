//! Microphone and speaker seams.
//!
//! Platform audio stacks live behind [`MediaDevices`]; the session
//! controller only sees blocks of float samples coming in and an
//! [`AudioOutput`] going out. [`VirtualOutput`] is a device-free output
//! driven by the tokio clock, used headless and in tests.

use crate::client::error::SessionError;
use crate::client::playback::{AudioChunk, AudioOutput, SourceId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Releases the underlying capture device.
pub trait MediaTrack: Send {
    fn stop(&mut self);
}

/// An exclusive microphone grant.
pub struct MicrophoneStream {
    /// Fixed-size blocks of mono samples at the requested rate
    pub blocks: mpsc::Receiver<Vec<f32>>,
    pub track: Box<dyn MediaTrack>,
}

impl MicrophoneStream {
    pub fn new(blocks: mpsc::Receiver<Vec<f32>>, track: Box<dyn MediaTrack>) -> Self {
        Self { blocks, track }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire the microphone, delivering `block_size` samples per block.
    async fn open_microphone(&self, sample_rate: u32, block_size: usize) -> Result<MicrophoneStream, SessionError>;

    /// Open an output at `sample_rate`. The id of every source that plays to
    /// its end is sent on `ended`; stopped sources are not reported.
    async fn open_output(
        &self,
        sample_rate: u32,
        ended: UnboundedSender<SourceId>,
    ) -> Result<Box<dyn AudioOutput>, SessionError>;
}

/// Output that plays nothing but keeps time on the tokio clock.
pub struct VirtualOutput {
    origin: Instant,
    ended: UnboundedSender<SourceId>,
    playing: HashMap<SourceId, JoinHandle<()>>,
    closed: bool,
}

impl VirtualOutput {
    pub fn new(ended: UnboundedSender<SourceId>) -> Self {
        Self {
            origin: Instant::now(),
            ended,
            playing: HashMap::new(),
            closed: false,
        }
    }

    pub fn playing(&self) -> usize {
        self.playing.values().filter(|task| !task.is_finished()).count()
    }
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> Duration {
        self.origin.elapsed()
    }

    fn start(&mut self, id: SourceId, chunk: AudioChunk, at: Duration) {
        if self.closed {
            return;
        }
        let end = self.origin + at + chunk.duration();
        let ended = self.ended.clone();
        self.playing.retain(|_, task| !task.is_finished());
        self.playing.insert(
            id,
            tokio::spawn(async move {
                tokio::time::sleep_until(end).await;
                let _ = ended.send(id);
            }),
        );
    }

    fn stop(&mut self, id: SourceId) {
        if let Some(task) = self.playing.remove(&id) {
            task.abort();
        }
    }

    fn close(&mut self) {
        for (_, task) in self.playing.drain() {
            task.abort();
        }
        self.closed = true;
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(ms: usize) -> AudioChunk {
        AudioChunk {
            samples: vec![0.0; 24 * ms],
            sample_rate: 24000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_end_on_the_clock() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = VirtualOutput::new(tx);
        output.start(0, chunk(200), Duration::ZERO);
        output.start(1, chunk(200), Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(rx.try_recv().ok(), Some(0));
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert!(output.current_time() >= Duration::from_millis(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sources_never_report() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut output = VirtualOutput::new(tx);
        output.start(7, chunk(100), Duration::ZERO);
        output.stop(7);
        output.start(8, chunk(100), Duration::ZERO);
        output.close();
        // Starting after close is ignored
        output.start(9, chunk(100), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(output.playing(), 0);
    }
}
