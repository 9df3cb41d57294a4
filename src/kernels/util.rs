//! Utility band (50-59)
//!
//! `OUTPUT` lives in the VM loop; the rest are small signal plumbing ops.

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::Instruction;
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

/// Xorshift32 step; period 2^32 - 1, never sticks at zero
#[inline(always)]
pub(crate) fn xorshift(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

/// Map a 32-bit word to `[-1, 1)`
#[inline(always)]
pub(crate) fn to_bipolar(word: u32) -> f32 {
    (word as f32 / u32::MAX as f32) * 2.0 - 1.0
}

/// White noise, deterministic per state-ID seed
///
/// Two instances with different IDs are decorrelated; the same ID always
/// reproduces the same sequence from reset, which is what makes engine
/// output bit-reproducible.
pub(crate) fn noise(instr: &Instruction, out: &mut Block, ctx: &mut KernelCtx) {
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Noise);
    let DspState::Noise { rng } = state else {
        return;
    };
    if *rng == 0 {
        *rng = instr.state_id | 1;
    }
    for v in out.iter_mut() {
        *v = to_bipolar(xorshift(rng));
    }
}

/// MIDI note number to Hz: `440 * 2^((m - 69) / 12)`
pub(crate) fn mtof(out: &mut Block, inputs: &Inputs) {
    for i in 0..BLOCK_SIZE {
        let note = in_sample(inputs, 0, i, 69.0);
        out[i] = 440.0 * ((note - 69.0) / 12.0).exp2();
    }
}

/// Add a constant offset; the state-ID field carries the f32 bit pattern
pub(crate) fn dc(instr: &Instruction, out: &mut Block, inputs: &Inputs) {
    let offset = instr.const_f32();
    for i in 0..BLOCK_SIZE {
        out[i] = in_sample(inputs, 0, i, 0.0) + offset;
    }
}

/// Rate-limited target following
///
/// Inputs: target, max rate in units/second (default 1000). The output moves
/// toward the target by at most `rate / sample_rate` per sample.
pub(crate) fn slew(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let dt = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Slew);
    let DspState::Slew { current } = state else {
        return;
    };
    for i in 0..BLOCK_SIZE {
        let target = in_sample(inputs, 0, i, 0.0);
        let rate = in_sample(inputs, 1, i, 1_000.0).abs();
        let step = rate * dt;
        *current += (target - *current).clamp(-step, step);
        out[i] = *current;
    }
}

/// Sample-and-hold: a rising edge on the trigger captures the input
///
/// Inputs: signal, trigger. The edge threshold is 0.5.
pub(crate) fn sample_and_hold(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Sah);
    let DspState::Sah { held, prev_trigger } = state else {
        return;
    };
    for i in 0..BLOCK_SIZE {
        let trigger = in_sample(inputs, 1, i, 0.0);
        if trigger > 0.5 && *prev_trigger <= 0.5 {
            *held = in_sample(inputs, 0, i, 0.0);
        }
        *prev_trigger = trigger;
        out[i] = *held;
    }
}

/// Look up a named host parameter; the state-ID field carries the FNV-1a
/// name hash. Falls back to input 0, then to 0.0.
///
/// The parameter map interpolates once per block, so the value is constant
/// within the block; zipper smoothing happens at block granularity.
pub(crate) fn env_get(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    match ctx.params.get(instr.state_id) {
        Some(value) => out.fill(value),
        None => match inputs[0] {
            Some(fallback) => out.copy_from_slice(fallback),
            None => out.fill(0.0),
        },
    }
}
