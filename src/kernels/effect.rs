//! Effect band (80-89, 140-149): modulation and distortion
//!
//! The distortion family is mostly memoryless waveshaping; the wavefolder
//! carries first-order ADAA (antiderivative anti-aliasing) because folding
//! is the one shape whose aliasing is audible at any gain. Modulation
//! effects share one arena-backed modulated delay line per instance.

use std::f32::consts::PI;

use crate::arena::{AudioArena, LineRef, COMB_MAX_SECONDS, MOD_DELAY_MAX_SECONDS};
use crate::buffer_pool::Block;
use crate::constants::{BLOCK_SIZE, HALF_PI};
use crate::instruction::{Instruction, Opcode};
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

#[derive(Clone, Copy, PartialEq)]
pub(crate) enum ModKind {
    Chorus,
    Flanger,
}

#[inline]
fn ensure_line(arena: &mut AudioArena, line: &mut LineRef, len: usize) -> bool {
    if line.is_null() {
        match arena.alloc(len) {
            Some(claimed) => *line = claimed,
            None => return false,
        }
    }
    true
}

#[inline(always)]
fn read_lerp(buf: &[f32], write: usize, delay: f32) -> f32 {
    let len = buf.len();
    let d = delay.clamp(1.0, (len - 1) as f32);
    let di = d as usize;
    let frac = d - di as f32;
    let i0 = (write + len - di) % len;
    let i1 = (write + len - di - 1) % len;
    buf[i0] + (buf[i1] - buf[i0]) * frac
}

/// CHORUS / FLANGER: one LFO-modulated delay line
///
/// Chorus inputs: signal, rate Hz (default 0.8), depth 0..1 (default 0.3),
/// mix (default 0.5). Flanger swaps the mix input for feedback
/// (default 0.4) and mixes 50/50; its sweep sits much closer to the write
/// head, which is where the jet sound comes from.
pub(crate) fn mod_delay(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
    kind: ModKind,
) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::ModDelay);
    let DspState::ModDelay { line, write, lfo } = state else {
        return;
    };
    if !ensure_line(ctx.arena, line, (MOD_DELAY_MAX_SECONDS * sr) as usize + 1) {
        super::arithmetic::copy(out, inputs);
        return;
    }
    let buf = ctx.arena.line_mut(*line);
    let len = buf.len();
    let inv_sr = ctx.timing.inv_sample_rate;

    // sweep ranges in seconds: (center, half-width)
    let (center_s, width_s) = match kind {
        ModKind::Chorus => (0.020, 0.010),
        ModKind::Flanger => (0.004, 0.0035),
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let rate = in_sample(inputs, 1, i, 0.8).clamp(0.0, 20.0);
        let depth = in_sample(inputs, 2, i, 0.3).clamp(0.0, 1.0);

        *lfo = (*lfo + f64::from(rate * inv_sr)).fract();
        let sweep = (std::f64::consts::TAU * *lfo).sin() as f32;
        let delay_s = center_s + sweep * width_s * depth;
        let wet = read_lerp(buf, *write as usize, delay_s * sr);

        let (feedback, mixed) = match kind {
            ModKind::Chorus => {
                let mix = in_sample(inputs, 3, i, 0.5).clamp(0.0, 1.0);
                (0.0, x * (1.0 - mix) + wet * mix)
            }
            ModKind::Flanger => {
                let fb = in_sample(inputs, 3, i, 0.4).clamp(-0.95, 0.95);
                (fb, (x + wet) * 0.5)
            }
        };
        let w = *write as usize;
        buf[w] = x + wet * feedback;
        *write = ((w + 1) % len) as u32;
        out[i] = mixed;
    }
}

/// PHASER: six swept first-order allpass stages with feedback-free mix
///
/// Inputs: signal, rate Hz (default 0.5), depth 0..1 (default 0.7),
/// center Hz (default 800).
pub(crate) fn phaser(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Phaser);
    let DspState::Phaser { ap, lfo } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let rate = in_sample(inputs, 1, i, 0.5).clamp(0.0, 10.0);
        let depth = in_sample(inputs, 2, i, 0.7).clamp(0.0, 1.0);
        let center = in_sample(inputs, 3, i, 800.0).clamp(50.0, 8_000.0);

        *lfo = (*lfo + f64::from(rate * inv_sr)).fract();
        let sweep = (std::f64::consts::TAU * *lfo).sin() as f32;
        // sweep one octave either side of center, scaled by depth
        let freq = center * 2.0f32.powf(sweep * depth);
        let tan_arg = (PI * (freq * inv_sr).min(0.49)).tan();
        let c = (tan_arg - 1.0) / (tan_arg + 1.0);

        let mut y = x;
        for z in ap.iter_mut() {
            let ap_out = c * y + *z;
            *z = y - c * ap_out;
            y = ap_out;
        }
        out[i] = (x + y) * 0.5;
    }
}

/// COMB: tuned feedback comb (Karplus-style resonator body)
///
/// Inputs: signal, frequency Hz (default 220), feedback (default 0.9).
pub(crate) fn comb(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Comb);
    let DspState::Comb { line, write } = state else {
        return;
    };
    if !ensure_line(ctx.arena, line, (COMB_MAX_SECONDS * sr) as usize + 1) {
        super::arithmetic::copy(out, inputs);
        return;
    }
    let buf = ctx.arena.line_mut(*line);
    let len = buf.len();

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let freq = in_sample(inputs, 1, i, 220.0).clamp(1.0 / COMB_MAX_SECONDS, sr * 0.45);
        let feedback = in_sample(inputs, 2, i, 0.9).clamp(-0.99, 0.99);
        let delay_samples = sr / freq;

        let w = *write as usize;
        let wet = read_lerp(buf, w, delay_samples);
        buf[w] = x + wet * feedback;
        *write = ((w + 1) % len) as u32;
        out[i] = wet + x;
    }
}

/// Memoryless waveshapers: tanh, cubic soft clip, tube, transformer, exciter
///
/// Inputs: signal, drive (default 1.0).
pub(crate) fn waveshape(opcode: Opcode, out: &mut Block, inputs: &Inputs) {
    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let drive = in_sample(inputs, 1, i, 1.0).max(0.0);
        let u = x * drive;
        out[i] = match opcode {
            Opcode::DistTanh => u.tanh(),
            Opcode::DistSoftClip => {
                // cubic with hard knees at +-1
                if u <= -1.0 {
                    -2.0 / 3.0
                } else if u >= 1.0 {
                    2.0 / 3.0
                } else {
                    u - u * u * u / 3.0
                }
            }
            Opcode::DistTube => {
                // grid-bias asymmetry: even harmonics from the offset
                let bias = 0.2;
                ((u + bias).tanh() - bias.tanh()) / (1.0 - bias.tanh() * bias)
            }
            Opcode::DistTransformer => {
                // gentle odd saturation with a resistive shoulder
                let soft = u.tanh();
                0.8 * soft + 0.2 * u / (1.0 + u.abs())
            }
            Opcode::Exciter => {
                // add odd harmonics on top of the dry path
                x + 0.3 * drive * (x * x * x)
            }
            _ => unreachable!("non-waveshape opcode routed to waveshape"),
        };
    }
}

/// Sine folder and its antiderivative
#[inline(always)]
fn fold(u: f32) -> f32 {
    (HALF_PI * u).sin()
}

#[inline(always)]
fn fold_ad(u: f32) -> f32 {
    // d/du [-(2/pi) cos(pi/2 u)] = sin(pi/2 u)
    -(2.0 / PI) * (HALF_PI * u).cos()
}

/// DIST_WAVEFOLD: sine wavefolder with first-order ADAA
///
/// Inputs: signal, fold gain (default 2.0). The antiderivative difference
/// quotient suppresses the aliasing the folds would otherwise spray across
/// the spectrum; the direct shape is used when the step is too small for
/// the quotient to be well-conditioned.
pub(crate) fn wavefold_adaa(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Adaa);
    let DspState::Adaa { prev_x, prev_ad } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let gain = in_sample(inputs, 1, i, 2.0).max(0.0);
        let u = in_sample(inputs, 0, i, 0.0) * gain;
        let ad = fold_ad(u);
        let dx = u - *prev_x;
        out[i] = if dx.abs() > 1e-4 {
            (ad - *prev_ad) / dx
        } else {
            fold((u + *prev_x) * 0.5)
        };
        *prev_x = u;
        *prev_ad = ad;
    }
}

/// DIST_TAPE: DC-blocking highpass, soft saturation, head-gap lowpass
///
/// Inputs: signal, drive (default 1.5).
pub(crate) fn tape(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = ctx.timing.inv_sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Tape);
    let DspState::Tape { lp, hp_x, hp_y } = state else {
        return;
    };

    // ~20 Hz DC blocker, ~8 kHz head-gap rolloff
    let hp_r = 1.0 - std::f32::consts::TAU * 20.0 * inv_sr;
    let lp_k = 1.0 - (-std::f32::consts::TAU * 8_000.0 * inv_sr).exp();

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let drive = in_sample(inputs, 1, i, 1.5).max(0.0);

        let blocked = x - *hp_x + hp_r * *hp_y;
        *hp_x = x;
        *hp_y = blocked;

        let saturated = (blocked * drive).tanh();
        *lp += (saturated - *lp) * lp_k;
        out[i] = *lp;
    }
}

/// RING_MOD: plain four-quadrant multiply of its two inputs
pub(crate) fn ring_mod(out: &mut Block, inputs: &Inputs) {
    for i in 0..BLOCK_SIZE {
        out[i] = in_sample(inputs, 0, i, 0.0) * in_sample(inputs, 1, i, 0.0);
    }
}

/// BITCRUSH: bit-depth quantization plus sample-rate reduction
///
/// Inputs: signal, bits (default 8), rate divisor (default 1 = no
/// reduction). The divisor holds each sample for that many engine samples.
pub(crate) fn bitcrush(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Bitcrush);
    let DspState::Bitcrush { held, accum } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let bits = in_sample(inputs, 1, i, 8.0).clamp(1.0, 24.0);
        let divisor = in_sample(inputs, 2, i, 1.0).max(1.0);

        *accum += 1.0;
        if *accum >= divisor {
            *accum -= divisor;
            let levels = (bits).exp2();
            *held = (x * levels).round() / levels;
        }
        out[i] = *held;
    }
}
