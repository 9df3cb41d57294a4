//! Anti-aliased oscillator band (110-119)
//!
//! Three techniques, in rising cost order:
//! - PolyBLEP: a two-sample polynomial correction cancels the first-derivative
//!   discontinuity at waveform edges (Valimaki/Huovilainen 2006).
//! - MinBLEP-style residuals: a precomputed band-limited step residual table
//!   is mixed in at each discontinuity via a small overlap ring.
//! - Oversampling: generate at 2x/4x with PolyBLEP, then decimate through a
//!   short FIR, all within one block.

use lazy_static::lazy_static;

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::{Instruction, Opcode};
use crate::state_pool::{DspState, StateKind, MINBLEP_RING};

use super::oscillator::step_phase;
use super::{in_sample, Inputs, KernelCtx};

/// Polynomial band-limited step correction
///
/// Returns the residual to subtract around a downward unit discontinuity at
/// phase 0/1; callers scale and sign it per edge.
#[inline(always)]
pub(crate) fn poly_blep(phase: f64, inc: f64) -> f32 {
    if inc <= 0.0 {
        return 0.0;
    }
    if phase < inc {
        let t = (phase / inc) as f32;
        2.0 * t - t * t - 1.0
    } else if phase > 1.0 - inc {
        let t = ((phase - 1.0) / inc) as f32;
        t * t + 2.0 * t + 1.0
    } else {
        0.0
    }
}

#[inline(always)]
fn blep_saw(phase: f64, inc: f64) -> f32 {
    (2.0 * phase - 1.0) as f32 - poly_blep(phase, inc)
}

#[inline(always)]
fn blep_square(phase: f64, inc: f64, width: f64) -> f32 {
    let mut v = if phase < width { 1.0 } else { -1.0 };
    v += poly_blep(phase, inc);
    v -= poly_blep((phase - width).rem_euclid(1.0), inc);
    v
}

/// PolyBLEP saw / square / triangle / PWM
pub(crate) fn blep_osc(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = f64::from(ctx.timing.inv_sample_rate);

    if instr.opcode == Opcode::OscTriBlep {
        // triangle = leaky integral of the BLEP square; continuous itself,
        // but its corners come from the square's band-limited edges
        let state = ctx.states.get_or_create(instr.state_id, StateKind::BlepTri);
        let DspState::BlepTri { phase, integ } = state else {
            return;
        };
        for i in 0..BLOCK_SIZE {
            let freq = f64::from(in_sample(inputs, 0, i, 0.0));
            let inc = freq * inv_sr;
            let p = step_phase(phase, inc);
            let square = blep_square(p, inc.abs(), 0.5);
            // scale keeps the integral's peak near +-1; the leak bleeds off
            // accumulated DC from frequency sweeps
            *integ = *integ * 0.999 + square * (4.0 * inc.abs()) as f32;
            out[i] = integ.clamp(-1.0, 1.0);
        }
        return;
    }

    let state = ctx.states.get_or_create(instr.state_id, StateKind::Phase);
    let DspState::Phase { phase } = state else {
        return;
    };
    for i in 0..BLOCK_SIZE {
        let freq = f64::from(in_sample(inputs, 0, i, 0.0));
        let inc = freq * inv_sr;
        let p = step_phase(phase, inc);
        out[i] = match instr.opcode {
            Opcode::OscSawBlep => blep_saw(p, inc.abs()),
            Opcode::OscSqrBlep => blep_square(p, inc.abs(), 0.5),
            Opcode::OscPwmBlep => {
                let width = f64::from(in_sample(inputs, 1, i, 0.5).clamp(0.05, 0.95));
                blep_square(p, inc.abs(), width)
            }
            _ => unreachable!("non-BLEP opcode routed to blep_osc"),
        };
    }
}

const BLEP_ZEROS: usize = 16;
const BLEP_OVERSAMPLE: usize = 64;

lazy_static! {
    /// Band-limited step residual: integrated Blackman-windowed sinc minus
    /// the ideal step, sampled at `BLEP_OVERSAMPLE`x. Built once; the audio
    /// thread only indexes it.
    static ref BLEP_TABLE: Vec<f32> = {
        let len = BLEP_ZEROS * BLEP_OVERSAMPLE;
        let mut sinc = vec![0.0f64; len];
        for (i, v) in sinc.iter_mut().enumerate() {
            // t spans [-zeros/2, zeros/2] in sinc periods
            let t = (i as f64 / BLEP_OVERSAMPLE as f64) - BLEP_ZEROS as f64 / 2.0;
            let x = std::f64::consts::PI * t;
            let s = if x.abs() < 1e-12 { 1.0 } else { x.sin() / x };
            let w = 0.42
                - 0.5 * (std::f64::consts::TAU * i as f64 / (len - 1) as f64).cos()
                + 0.08 * (2.0 * std::f64::consts::TAU * i as f64 / (len - 1) as f64).cos();
            *v = s * w;
        }
        // integrate and normalize into a 0..1 step
        let mut acc = 0.0;
        let mut step: Vec<f64> = sinc
            .iter()
            .map(|&v| {
                acc += v;
                acc
            })
            .collect();
        let total = acc;
        for v in &mut step {
            *v /= total;
        }
        // residual against the ideal step at the table center
        let center = len / 2;
        step.iter()
            .enumerate()
            .map(|(i, &v)| (v - if i >= center { 1.0 } else { 0.0 }) as f32)
            .collect()
    };
}

/// Length of the residual in output samples
const BLEP_SPAN: usize = BLEP_ZEROS;

/// Latency of the table-based saw: half the residual span, so the
/// linear-phase correction stays causal
const BLEP_LATENCY: usize = BLEP_SPAN / 2;

/// Table-based saw: naive samples run through a short overlap ring delayed by
/// half the residual span; at each wrap the step residual is scattered over
/// the ring so its center lines up with the delayed discontinuity
pub(crate) fn minblep_saw(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let inv_sr = f64::from(ctx.timing.inv_sample_rate);
    let state = ctx.states.get_or_create(instr.state_id, StateKind::MinBlep);
    let DspState::MinBlep { phase, ring, pos } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let freq = f64::from(in_sample(inputs, 0, i, 0.0));
        let inc = (freq * inv_sr).abs();
        let p = step_phase(phase, freq * inv_sr);

        // the wrap lands between this sample and the next
        if inc > 0.0 && p + inc >= 1.0 {
            // fractional position of the discontinuity inside the sample
            let frac = (1.0 - p) / inc;
            for j in 0..BLEP_SPAN {
                let table_pos = ((j as f64 + frac) * BLEP_OVERSAMPLE as f64) as usize;
                if table_pos < BLEP_TABLE.len() {
                    let at = (*pos as usize + j) % MINBLEP_RING;
                    // the saw drops by 2; r = blstep - u, so -2r swaps the
                    // ideal step for the band-limited one
                    ring[at] -= 2.0 * BLEP_TABLE[table_pos];
                }
            }
        }

        // feed the naive sample in `BLEP_LATENCY` samples ahead of the read
        let write_at = (*pos as usize + BLEP_LATENCY) % MINBLEP_RING;
        ring[write_at] += (2.0 * p - 1.0) as f32;

        let read_at = *pos as usize % MINBLEP_RING;
        out[i] = ring[read_at];
        ring[read_at] = 0.0;
        *pos = pos.wrapping_add(1);
    }
}

/// Decimation FIR: 8-tap windowed sinc, cutoff at the base-rate Nyquist
fn decimation_taps(factor: usize) -> [f32; 8] {
    let cutoff = 0.45 / factor as f64;
    let mut taps = [0.0f32; 8];
    let mut sum = 0.0;
    for (i, tap) in taps.iter_mut().enumerate() {
        let t = i as f64 - 3.5;
        let x = std::f64::consts::TAU * cutoff * t;
        let s = if x.abs() < 1e-12 {
            2.0 * cutoff
        } else {
            (x).sin() / (std::f64::consts::PI * t)
        };
        let w = 0.54 - 0.46 * (std::f64::consts::TAU * i as f64 / 7.0).cos();
        *tap = (s * w) as f32;
        sum += f64::from(*tap);
    }
    for tap in &mut taps {
        *tap /= sum as f32;
    }
    taps
}

fn oversampled(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
    factor: usize,
    square: bool,
) {
    let inv_sr = f64::from(ctx.timing.inv_sample_rate) / factor as f64;
    let taps = decimation_taps(factor);
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Oversample);
    let DspState::Oversample { phase, hist } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let freq = f64::from(in_sample(inputs, 0, i, 0.0));
        let inc = freq * inv_sr;
        let mut filtered = 0.0;
        // generate `factor` sub-samples, push each through the FIR history,
        // keep the last output as the decimated sample
        for _ in 0..factor {
            let p = step_phase(phase, inc);
            let sub = if square {
                blep_square(p, inc.abs(), 0.5)
            } else {
                blep_saw(p, inc.abs())
            };
            hist.rotate_right(1);
            hist[0] = sub;
            filtered = hist
                .iter()
                .zip(taps.iter())
                .map(|(h, t)| h * t)
                .sum::<f32>();
        }
        out[i] = filtered;
    }
}

pub(crate) fn oversampled_saw(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
    factor: usize,
) {
    oversampled(instr, out, inputs, ctx, factor, false);
}

pub(crate) fn oversampled_square(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
    factor: usize,
) {
    oversampled(instr, out, inputs, ctx, factor, true);
}
