//! Execution context: timing shared by every kernel
//!
//! A small value object handed to each opcode kernel. Beat and bar phases are
//! derived deterministically from the global sample counter and the BPM, so
//! two engines fed the same history stay bit-identical (and `seek` is just a
//! counter write).

use crate::constants::{BEATS_PER_BAR, BLOCK_SIZE, DEFAULT_BPM, DEFAULT_SAMPLE_RATE};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub sample_rate: f32,
    pub inv_sample_rate: f32,
    pub bpm: f32,
    /// Samples processed since construction (or the last seek)
    pub global_sample: u64,
    pub block_count: u64,
    /// Total beats elapsed at the start of the current block
    pub beat_position: f64,
    /// Fractional position within the current beat, `[0, 1)`
    pub beat_phase: f64,
    /// Fractional position within the current bar, `[0, 1)`
    pub bar_phase: f64,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        let mut ctx = ExecutionContext {
            sample_rate: DEFAULT_SAMPLE_RATE,
            inv_sample_rate: 1.0 / DEFAULT_SAMPLE_RATE,
            bpm: DEFAULT_BPM,
            global_sample: 0,
            block_count: 0,
            beat_position: 0.0,
            beat_phase: 0.0,
            bar_phase: 0.0,
        };
        ctx.update_derived();
        ctx
    }
}

impl ExecutionContext {
    pub fn set_sample_rate(&mut self, hz: f32) {
        self.sample_rate = hz.max(1.0);
        self.inv_sample_rate = 1.0 / self.sample_rate;
        self.update_derived();
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        self.bpm = bpm.max(1.0);
        self.update_derived();
    }

    /// Beats advanced per sample at the current tempo
    ///
    /// Divides by the sample rate in f64 rather than reusing the f32
    /// reciprocal; the reciprocal's rounding would read as sequencer drift
    /// after a few million samples.
    #[inline]
    pub fn beats_per_sample(&self) -> f64 {
        f64::from(self.bpm) / 60.0 / f64::from(self.sample_rate)
    }

    /// Beat position at sample offset `i` within the current block
    #[inline]
    pub fn beat_at(&self, i: usize) -> f64 {
        self.beat_position + self.beats_per_sample() * i as f64
    }

    /// Recompute beat/bar phases from the sample counter
    pub fn update_derived(&mut self) {
        self.beat_position = self.global_sample as f64 * self.beats_per_sample();
        self.beat_phase = self.beat_position.fract();
        self.bar_phase = (self.beat_position / BEATS_PER_BAR).fract();
    }

    /// Advance past one processed block
    pub fn advance_block(&mut self) {
        self.global_sample += BLOCK_SIZE as u64;
        self.block_count += 1;
        self.update_derived();
    }

    /// Jump the timeline to an absolute sample position
    pub fn seek_samples(&mut self, sample: u64) {
        self.global_sample = sample;
        self.update_derived();
    }

    /// Jump the timeline to an absolute beat position
    pub fn seek_beats(&mut self, beats: f64) {
        let samples = beats / self.beats_per_sample();
        self.seek_samples(samples.max(0.0) as u64);
    }
}
