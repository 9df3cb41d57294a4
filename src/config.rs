//! Engine configuration
//!
//! Host-side convenience: a TOML-loadable settings block applied to the VM
//! before playback starts. The audio thread never sees this type.

use serde::Deserialize;

use crate::constants::{
    DEFAULT_BPM, DEFAULT_CROSSFADE_BLOCKS, DEFAULT_FADE_BLOCKS, DEFAULT_SAMPLE_RATE,
};
use crate::vm::SynthVm;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: f32,
    pub bpm: f32,
    /// Output crossfade length on structural swaps, in blocks
    pub crossfade_blocks: u32,
    /// Fade-out length for orphaned states, in blocks
    pub state_fade_blocks: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bpm: DEFAULT_BPM,
            crossfade_blocks: DEFAULT_CROSSFADE_BLOCKS,
            state_fade_blocks: DEFAULT_FADE_BLOCKS,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("bad engine config: {}", e))
    }

    /// Apply to a VM; call before handing the VM to the audio thread
    pub fn apply(&self, vm: &mut SynthVm) {
        vm.set_sample_rate(self.sample_rate);
        vm.set_bpm(self.bpm);
        vm.set_crossfade_blocks(self.crossfade_blocks);
        vm.set_state_fade_blocks(self.state_fade_blocks);
    }
}
