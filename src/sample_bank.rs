//! Host-populated sample bank
//!
//! Opcodes reference samples by integer slot ID; the host installs sample
//! data before (or while) programs run. Each slot is an `ArcSwapOption`, so
//! installation is lock-free and the audio thread's reads never block: a
//! playing voice keeps its `Arc` alive for the block even if the host
//! replaces the slot mid-flight.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::constants::MAX_SAMPLE_SLOTS;

/// One loaded sample: interleaved frames plus provenance
#[derive(Debug, Clone)]
pub struct SampleData {
    /// Interleaved sample frames
    pub frames: Vec<f32>,
    pub channels: u16,
    /// Sample rate the data was recorded at
    pub root_rate: f32,
}

impl SampleData {
    pub fn mono(frames: Vec<f32>, root_rate: f32) -> Self {
        SampleData {
            frames,
            channels: 1,
            root_rate,
        }
    }

    /// Frame count (samples per channel)
    pub fn len_frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.frames.len() / self.channels as usize
        }
    }

    /// Mono frame value with linear interpolation between frames
    ///
    /// Multi-channel data is averaged down; positions at or past the end
    /// read 0.0.
    #[inline]
    pub fn frame_lerp(&self, pos: f64) -> f32 {
        let frames = self.len_frames();
        if frames == 0 || pos < 0.0 {
            return 0.0;
        }
        let i = pos as usize;
        if i + 1 >= frames {
            return 0.0;
        }
        let frac = (pos - i as f64) as f32;
        let a = self.frame_mono(i);
        let b = self.frame_mono(i + 1);
        a + (b - a) * frac
    }

    #[inline]
    fn frame_mono(&self, frame: usize) -> f32 {
        let ch = self.channels as usize;
        let base = frame * ch;
        let mut acc = 0.0;
        for c in 0..ch {
            acc += self.frames[base + c];
        }
        acc / ch as f32
    }
}

pub struct SampleBank {
    slots: Vec<ArcSwapOption<SampleData>>,
}

impl SampleBank {
    pub fn new() -> Self {
        SampleBank {
            slots: (0..MAX_SAMPLE_SLOTS).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    /// Install (or replace) a sample; out-of-range slots are ignored
    pub fn insert(&self, slot: usize, data: Arc<SampleData>) {
        if let Some(cell) = self.slots.get(slot) {
            cell.store(Some(data));
        }
    }

    pub fn clear(&self, slot: usize) {
        if let Some(cell) = self.slots.get(slot) {
            cell.store(None);
        }
    }

    /// Borrow the sample in `slot` for the duration of a block
    #[inline]
    pub fn get(&self, slot: usize) -> Option<Arc<SampleData>> {
        self.slots.get(slot)?.load_full()
    }

    pub fn reset(&self) {
        for cell in &self.slots {
            cell.store(None);
        }
    }
}

impl Default for SampleBank {
    fn default() -> Self {
        Self::new()
    }
}
