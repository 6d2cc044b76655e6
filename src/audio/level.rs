//! Coarse microphone level for UI visualization.
//!
//! Mirrors a browser analyser node: a 256-point Blackman-windowed DFT over
//! the newest samples, magnitudes smoothed over time, mapped from
//! [-100 dB, -30 dB] onto 0..=255 per bin, then averaged across the 128 bins.
//! The published level is advisory; it is written with a relaxed atomic
//! store and never feeds back into encoding.

use std::f32::consts::PI;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const FFT_SIZE: usize = 256;
const BIN_COUNT: usize = FFT_SIZE / 2;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

pub struct LevelMeter {
    window: Vec<f32>,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    smoothed: Vec<f32>,
    level: Arc<AtomicU8>,
}

impl LevelMeter {
    pub fn new() -> Self {
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / FFT_SIZE as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        let (cos_table, sin_table) = (0..FFT_SIZE)
            .map(|i| {
                let angle = 2.0 * PI * i as f32 / FFT_SIZE as f32;
                (angle.cos(), angle.sin())
            })
            .unzip();

        Self {
            window,
            cos_table,
            sin_table,
            smoothed: vec![0.0; BIN_COUNT],
            level: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Shared handle readers poll for the latest level.
    pub fn handle(&self) -> Arc<AtomicU8> {
        Arc::clone(&self.level)
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    /// Analyse the newest `FFT_SIZE` samples of a block and publish the level.
    pub fn update(&mut self, block: &[f32]) -> u8 {
        let mut frame = [0.0f32; FFT_SIZE];
        let tail = &block[block.len().saturating_sub(FFT_SIZE)..];
        let offset = FFT_SIZE - tail.len();
        for (i, &sample) in tail.iter().enumerate() {
            frame[offset + i] = sample * self.window[offset + i];
        }

        let mut total = 0u32;
        for k in 0..BIN_COUNT {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (n, &x) in frame.iter().enumerate() {
                let idx = (k * n) % FFT_SIZE;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / FFT_SIZE as f32;
            self.smoothed[k] = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            total += to_byte(self.smoothed[k]) as u32;
        }

        let level = (total / BIN_COUNT as u32) as u8;
        self.level.store(level, Ordering::Relaxed);
        level
    }

    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
        self.level.store(0, Ordering::Relaxed);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}
