//! Envelope band (60-62)
//!
//! Gate and every time parameter are buffers, so envelopes are sample
//! accurate: a gate edge landing mid-block starts the attack on that exact
//! sample. Stage times are in seconds; attack ramps linearly, decay and
//! release approach their targets exponentially with a time-constant scaled
//! so the stage effectively completes in the given time.

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::Instruction;
use crate::state_pool::{DspState, EnvStage, StateKind};

use super::{in_sample, Inputs, KernelCtx};

/// Shortest representable stage, to keep coefficients finite
const MIN_STAGE_SECONDS: f32 = 1e-4;

/// Per-sample exponential approach coefficient for a stage time: reaches
/// ~99% of the distance in `seconds`
#[inline(always)]
fn stage_coeff(seconds: f32, inv_sr: f32) -> f32 {
    let samples = seconds.max(MIN_STAGE_SECONDS) / inv_sr;
    1.0 - (-4.6 / samples).exp()
}

/// ADSR
///
/// Inputs: gate, attack s (default 0.01), decay s (default 0.1),
/// sustain level (default 0.7), release s (default 0.2).
pub(crate) fn adsr(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Envelope);
    let DspState::Envelope {
        stage,
        value,
        prev_gate,
    } = state
    else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let gate = in_sample(inputs, 0, i, 0.0);
        let attack = in_sample(inputs, 1, i, 0.01);
        let decay = in_sample(inputs, 2, i, 0.1);
        let sustain = in_sample(inputs, 3, i, 0.7).clamp(0.0, 1.0);
        let release = in_sample(inputs, 4, i, 0.2);

        if gate > 0.5 && *prev_gate <= 0.5 {
            *stage = EnvStage::Attack;
        } else if gate <= 0.5 && *prev_gate > 0.5 {
            *stage = EnvStage::Release;
        }
        *prev_gate = gate;

        match *stage {
            EnvStage::Idle => {}
            EnvStage::Attack => {
                *value += inv_sr / attack.max(MIN_STAGE_SECONDS);
                if *value >= 1.0 {
                    *value = 1.0;
                    *stage = EnvStage::Decay;
                }
            }
            EnvStage::Decay => {
                let k = stage_coeff(decay, inv_sr);
                *value += (sustain - *value) * k;
                if (*value - sustain).abs() < 1e-4 {
                    *stage = EnvStage::Sustain;
                }
            }
            EnvStage::Sustain => {
                *value = sustain;
            }
            EnvStage::Release => {
                let k = stage_coeff(release, inv_sr);
                *value -= *value * k;
                if *value < 1e-4 {
                    *value = 0.0;
                    *stage = EnvStage::Idle;
                }
            }
        }
        out[i] = *value;
    }
}

/// AR envelope: one-shot attack on a rising edge, release after
///
/// Inputs: gate, attack s (default 0.01), release s (default 0.2). The
/// attack always completes once launched - a single-sample trigger from a
/// sequencer still produces a full pluck. A gate still high at the peak
/// sustains; otherwise release begins immediately.
pub(crate) fn ar(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Envelope);
    let DspState::Envelope {
        stage,
        value,
        prev_gate,
    } = state
    else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let gate = in_sample(inputs, 0, i, 0.0);
        let attack = in_sample(inputs, 1, i, 0.01);
        let release = in_sample(inputs, 2, i, 0.2);

        if gate > 0.5 && *prev_gate <= 0.5 {
            *stage = EnvStage::Attack;
        } else if gate <= 0.5 && *prev_gate > 0.5 && *stage == EnvStage::Sustain {
            *stage = EnvStage::Release;
        }
        *prev_gate = gate;

        match *stage {
            EnvStage::Attack => {
                *value += inv_sr / attack.max(MIN_STAGE_SECONDS);
                if *value >= 1.0 {
                    *value = 1.0;
                    *stage = if gate > 0.5 {
                        EnvStage::Sustain
                    } else {
                        EnvStage::Release
                    };
                }
            }
            EnvStage::Sustain => {
                *value = 1.0;
            }
            EnvStage::Release => {
                let k = stage_coeff(release, inv_sr);
                *value -= *value * k;
                if *value < 1e-4 {
                    *value = 0.0;
                    *stage = EnvStage::Idle;
                }
            }
            _ => {}
        }
        out[i] = *value;
    }
}

/// Envelope follower: asymmetric one-pole smoothing of `|x|`
///
/// Inputs: signal, attack s (default 0.005), release s (default 0.1).
pub(crate) fn follower(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Follower);
    let DspState::Follower { env } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let level = in_sample(inputs, 0, i, 0.0).abs();
        let seconds = if level > *env {
            in_sample(inputs, 1, i, 0.005)
        } else {
            in_sample(inputs, 2, i, 0.1)
        };
        let k = stage_coeff(seconds, inv_sr);
        *env += (level - *env) * k;
        out[i] = *env;
    }
}
