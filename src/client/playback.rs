//! # Playback Scheduler
//!
//! Renders decoded model audio back to back on the output clock, however
//! irregularly the chunks arrive.
//!
//! ## Scheduling rule:
//! ```text
//! start      = max(next_start, output_clock_now)
//! next_start = start + chunk_duration
//! ```
//! Every started source is tracked until it ends. The agent "is speaking"
//! exactly while that set is non-empty. An interruption (barge-in) stops
//! every tracked source and resets `next_start` to zero.

use crate::audio::codec::duration_of;
use std::collections::HashSet;
use std::time::Duration;

pub type SourceId = u64;

/// Decoded mono samples at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn duration(&self) -> Duration {
        duration_of(self.samples.len(), self.sample_rate)
    }
}

/// An output device with its own clock.
///
/// Implementations report the end of each started source separately
/// (see [`crate::client::devices::MediaDevices::open_output`]).
pub trait AudioOutput: Send {
    /// Current position of the output clock
    fn current_time(&self) -> Duration;
    /// Begin `chunk` at output time `at`
    fn start(&mut self, id: SourceId, chunk: AudioChunk, at: Duration);
    /// Stop a source immediately; unknown ids are ignored
    fn stop(&mut self, id: SourceId);
    fn close(&mut self);
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn current_time(&self) -> Duration {
        (**self).current_time()
    }

    fn start(&mut self, id: SourceId, chunk: AudioChunk, at: Duration) {
        (**self).start(id, chunk, at)
    }

    fn stop(&mut self, id: SourceId) {
        (**self).stop(id)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    next_start: Duration,
    active: HashSet<SourceId>,
    next_id: SourceId,
    closed: bool,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            next_start: Duration::ZERO,
            active: HashSet::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Queue a chunk right after everything already scheduled.
    pub fn schedule(&mut self, chunk: AudioChunk) -> Option<SourceId> {
        if self.closed {
            return None;
        }
        let at = self.next_start.max(self.output.current_time());
        let duration = chunk.duration();
        let id = self.next_id;
        self.next_id += 1;

        self.output.start(id, chunk, at);
        self.next_start = at + duration;
        self.active.insert(id);
        Some(id)
    }

    /// A source finished on its own. Returns true when this left nothing playing.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id) && self.active.is_empty()
    }

    /// Barge-in: discard everything still scheduled.
    pub fn interrupt(&mut self) {
        for id in self.active.drain() {
            self.output.stop(id);
        }
        self.next_start = Duration::ZERO;
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    /// Stop all sources and close the output. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.interrupt();
        self.output.close();
        self.closed = true;
    }
}
