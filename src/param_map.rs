//! Lock-free host parameter registry with per-sample slew
//!
//! A fixed-capacity open-addressing table from FNV-1a name hashes to
//! parameter slots. Host threads CAS-claim slots and write targets; the
//! audio thread advances each slot's `current` toward its `target` once per
//! sample across the block, which is what keeps zipper noise out of mapped
//! controls. Removal just clears the `active` flag - the slot stays indexed
//! until reset, trading memory for lock-free safety.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::warn;

use crate::constants::{BLOCK_SIZE, DEFAULT_SAMPLE_RATE, MAX_ENV_PARAMS};
use crate::hash::hash_name;

/// Default slew time applied when `set` is called without one
pub const DEFAULT_SLEW_MS: f32 = 5.0;

/// Settling threshold: the slew coefficient is computed so that `current`
/// lands within 1% of `target` after the configured slew time
const SETTLE_RATIO: f32 = 0.01;

struct ParamSlot {
    /// FNV-1a hash of the parameter name; valid once `occupied`
    name_hash: AtomicU32,
    /// Claimed by a writer (never cleared except by `reset`)
    occupied: AtomicBool,
    /// Cleared by `remove`; inactive slots read as 0.0
    active: AtomicBool,
    /// f32 bits, host-written
    target: AtomicU32,
    /// f32 bits, audio-thread-owned
    current: AtomicU32,
    /// f32 bits, per-sample approach coefficient
    slew_coeff: AtomicU32,
}

impl ParamSlot {
    fn new() -> Self {
        ParamSlot {
            name_hash: AtomicU32::new(0),
            occupied: AtomicBool::new(false),
            active: AtomicBool::new(false),
            target: AtomicU32::new(0),
            current: AtomicU32::new(0),
            slew_coeff: AtomicU32::new(f32::to_bits(1.0)),
        }
    }
}

pub struct ParamMap {
    slots: Vec<ParamSlot>,
    /// f32 bits; the VM updates this on sample-rate changes
    sample_rate: AtomicU32,
}

impl ParamMap {
    pub fn new() -> Self {
        ParamMap {
            slots: (0..MAX_ENV_PARAMS).map(|_| ParamSlot::new()).collect(),
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE.to_bits()),
        }
    }

    pub(crate) fn set_sample_rate(&self, hz: f32) {
        self.sample_rate.store(hz.to_bits(), Ordering::Release);
    }

    /// Per-sample coefficient for a slew time in milliseconds
    ///
    /// `slew_ms == 0` steps at the block boundary (coefficient 1).
    fn coeff_for(&self, slew_ms: f32) -> f32 {
        if slew_ms <= 0.0 {
            return 1.0;
        }
        let sr = f32::from_bits(self.sample_rate.load(Ordering::Acquire));
        let samples = slew_ms * 1e-3 * sr;
        1.0 - SETTLE_RATIO.powf(1.0 / samples.max(1.0))
    }

    // ---- host API (any thread) -------------------------------------------

    /// Create or update a parameter; false when the table is full
    pub fn set(&self, name: &str, value: f32, slew_ms: Option<f32>) -> bool {
        let hash = hash_name(name);
        let coeff = self.coeff_for(slew_ms.unwrap_or(DEFAULT_SLEW_MS));
        let Some(slot) = self.claim(hash) else {
            warn!(name, "parameter table full");
            return false;
        };
        slot.slew_coeff.store(coeff.to_bits(), Ordering::Release);
        slot.target.store(value.to_bits(), Ordering::Release);
        if !slot.active.swap(true, Ordering::AcqRel) {
            // fresh (or re-added) parameters snap to their first value
            // rather than slewing up from stale contents
            slot.current.store(value.to_bits(), Ordering::Release);
        }
        true
    }

    /// Deactivate a parameter; reads return 0.0 afterwards
    pub fn remove(&self, name: &str) {
        let hash = hash_name(name);
        if let Some(slot) = self.find(hash) {
            slot.active.store(false, Ordering::Release);
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.find(hash_name(name))
            .map(|slot| slot.active.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Claim the slot for `hash`, or find the existing one
    fn claim(&self, hash: u32) -> Option<&ParamSlot> {
        let start = hash as usize % MAX_ENV_PARAMS;
        for step in 0..MAX_ENV_PARAMS {
            let slot = &self.slots[(start + step) % MAX_ENV_PARAMS];
            if slot.occupied.load(Ordering::Acquire) {
                if slot.name_hash.load(Ordering::Acquire) == hash {
                    return Some(slot);
                }
                continue;
            }
            if slot
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.name_hash.store(hash, Ordering::Release);
                return Some(slot);
            }
            // lost the claim race; re-check whether the winner took our name
            if slot.name_hash.load(Ordering::Acquire) == hash {
                return Some(slot);
            }
        }
        None
    }

    fn find(&self, hash: u32) -> Option<&ParamSlot> {
        let start = hash as usize % MAX_ENV_PARAMS;
        for step in 0..MAX_ENV_PARAMS {
            let slot = &self.slots[(start + step) % MAX_ENV_PARAMS];
            if !slot.occupied.load(Ordering::Acquire) {
                // claims are never released, so an empty slot ends the chain
                return None;
            }
            if slot.name_hash.load(Ordering::Acquire) == hash {
                return Some(slot);
            }
        }
        None
    }

    // ---- audio API (audio thread only) -----------------------------------

    /// Read a parameter's smoothed value by name hash
    #[inline]
    pub fn get(&self, hash: u32) -> Option<f32> {
        let slot = self.find(hash)?;
        if slot.active.load(Ordering::Acquire) {
            Some(f32::from_bits(slot.current.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Advance every active slot's `current` toward `target` by the slew
    /// coefficient, once per sample across the block. Uses the closed form
    /// `c' = t + (c - t) * (1 - k)^BLOCK_SIZE`, identical to per-sample
    /// stepping in exact arithmetic.
    pub fn update_interpolation_block(&self) {
        for slot in &self.slots {
            if !slot.occupied.load(Ordering::Acquire) || !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let target = f32::from_bits(slot.target.load(Ordering::Acquire));
            let current = f32::from_bits(slot.current.load(Ordering::Acquire));
            let k = f32::from_bits(slot.slew_coeff.load(Ordering::Acquire));
            let next = if k >= 1.0 {
                target
            } else {
                target + (current - target) * (1.0 - k).powi(BLOCK_SIZE as i32)
            };
            slot.current.store(next.to_bits(), Ordering::Release);
        }
    }

    /// Host-side reset; not safe concurrently with the audio thread
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.occupied.store(false, Ordering::Release);
            slot.active.store(false, Ordering::Release);
            slot.name_hash.store(0, Ordering::Release);
            slot.target.store(0, Ordering::Release);
            slot.current.store(0, Ordering::Release);
            slot.slew_coeff.store(f32::to_bits(1.0), Ordering::Release);
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.active.load(Ordering::Acquire))
            .count()
    }
}

impl Default for ParamMap {
    fn default() -> Self {
        Self::new()
    }
}
