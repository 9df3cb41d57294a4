//! Dynamics band (100-109)
//!
//! Feedforward designs: a peak envelope drives the gain computer directly.
//! Envelope coefficients settle in ~99% of the named time.

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::Instruction;
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

#[inline(always)]
fn env_coeff(seconds: f32, inv_sr: f32) -> f32 {
    let samples = seconds.max(1e-4) / inv_sr;
    1.0 - (-4.6 / samples).exp()
}

/// Asymmetric peak follower step
#[inline(always)]
fn track(env: &mut f32, level: f32, attack_k: f32, release_k: f32) {
    let k = if level > *env { attack_k } else { release_k };
    *env += (level - *env) * k;
}

/// COMPRESSOR: feedforward, linear-domain threshold and ratio
///
/// Inputs: signal, threshold (default 0.5), ratio (default 4), attack s
/// (default 0.005), release s (default 0.1).
pub(crate) fn compressor(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::GainEnv);
    let DspState::GainEnv { env } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let threshold = in_sample(inputs, 1, i, 0.5).max(1e-4);
        let ratio = in_sample(inputs, 2, i, 4.0).max(1.0);
        let attack_k = env_coeff(in_sample(inputs, 3, i, 0.005), inv_sr);
        let release_k = env_coeff(in_sample(inputs, 4, i, 0.1), inv_sr);

        track(env, x.abs(), attack_k, release_k);
        let gain = if *env > threshold {
            (threshold + (*env - threshold) / ratio) / *env
        } else {
            1.0
        };
        out[i] = x * gain;
    }
}

/// LIMITER: near-instant attack, then a hard ceiling for whatever the
/// envelope missed
///
/// Inputs: signal, ceiling (default 0.9), release s (default 0.05).
pub(crate) fn limiter(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::GainEnv);
    let DspState::GainEnv { env } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let ceiling = in_sample(inputs, 1, i, 0.9).max(1e-4);
        let release_k = env_coeff(in_sample(inputs, 2, i, 0.05), inv_sr);

        track(env, x.abs(), 1.0, release_k);
        let gain = if *env > ceiling { ceiling / *env } else { 1.0 };
        out[i] = (x * gain).clamp(-ceiling, ceiling);
    }
}

/// GATE with hysteresis: opens above the threshold, closes only below half
/// of it, so signals hovering near the threshold do not chatter
///
/// Inputs: signal, open threshold (default 0.1), attack s (default 0.001),
/// release s (default 0.05).
pub(crate) fn gate(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Gate);
    let DspState::Gate { env, open } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let threshold = in_sample(inputs, 1, i, 0.1).max(1e-4);
        let attack_k = env_coeff(in_sample(inputs, 2, i, 0.001), inv_sr);
        let release_k = env_coeff(in_sample(inputs, 3, i, 0.05), inv_sr);

        let level = x.abs();
        if *open {
            if level < threshold * 0.5 {
                *open = false;
            }
        } else if level > threshold {
            *open = true;
        }
        let target = if *open { 1.0 } else { 0.0 };
        let k = if target > *env { attack_k } else { release_k };
        *env += (target - *env) * k;
        out[i] = x * *env;
    }
}
