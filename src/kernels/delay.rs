//! Delay and reverb band (70-73)
//!
//! All lines live in the audio arena, claimed on first use. If the arena
//! cannot satisfy a claim (live churn past what the loader guaranteed) the
//! kernel passes its input through instead of reading out of bounds.
//!
//! Reverb topologies:
//! - Freeverb: 8 parallel damped combs into 4 series allpasses (Jezar's
//!   public-domain tunings, scaled from 44.1 kHz).
//! - Dattorro: the 1997 plate - input diffusion into a figure-eight tank
//!   with a slow excursion on the first tank allpass.
//! - FDN: four delay lines under a Householder feedback matrix, per-line
//!   damping, decay set by the feedback gain.

use crate::arena::{
    AudioArena, LineRef, DATTORRO_INPUT_AP, DATTORRO_PREDELAY_MAX_SECONDS, DATTORRO_TANK_AP,
    DATTORRO_TANK_DELAY, DELAY_MAX_SECONDS, FDN_LINE_SECONDS, FREEVERB_ALLPASS_TUNING,
    FREEVERB_COMB_TUNING,
};
use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::Instruction;
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

/// Claim a line if still null; false when the arena is exhausted
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

/// Read `delay` samples behind the write head with linear interpolation
///
/// `write` is the index the *current* input will be written to, so a delay
/// of `d` reads the sample stored `d` steps ago.
#[inline(always)]
fn read_lerp(line: &[f32], write: usize, delay: f32) -> f32 {
    let len = line.len();
    let d = delay.clamp(1.0, (len - 1) as f32);
    let di = d as usize;
    let frac = d - di as f32;
    let i0 = (write + len - di) % len;
    let i1 = (write + len - di - 1) % len;
    // i1 is one sample older than i0
    line[i0] + (line[i1] - line[i0]) * frac
}

/// DELAY with feedback
///
/// Inputs: signal, time s (default 0.25, max `DELAY_MAX_SECONDS`), feedback
/// (default 0.3, clamped below 1 so the loop cannot run away). A time under
/// one sample is a pass-through.
pub(crate) fn delay(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let max_len = (DELAY_MAX_SECONDS * sr) as usize + 1;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::DelayLine);
    let DspState::DelayLine { line, write } = state else {
        return;
    };
    if !ensure_line(ctx.arena, line, max_len) {
        super::arithmetic::copy(out, inputs);
        return;
    }
    let buf = ctx.arena.line_mut(*line);
    let len = buf.len();

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let time = in_sample(inputs, 1, i, 0.25).clamp(0.0, DELAY_MAX_SECONDS);
        let feedback = in_sample(inputs, 2, i, 0.3).clamp(-0.99, 0.99);
        let delay_samples = time * sr;

        let w = *write as usize;
        let wet = if delay_samples < 1.0 {
            x
        } else {
            read_lerp(buf, w, delay_samples)
        };
        buf[w] = x + wet * feedback;
        *write = ((w + 1) % len) as u32;
        out[i] = wet;
    }
}

/// Scale a 44.1 kHz tuning to the current rate
#[inline]
fn scale_tuning(samples: usize, sr: f32, reference: f32) -> usize {
    (((samples as f32) * sr / reference).ceil() as usize).max(2)
}

/// REVERB_FREEVERB (mono)
///
/// Inputs: signal, room size 0..1 (default 0.5), damping 0..1 (default 0.5).
pub(crate) fn freeverb(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Freeverb);
    let DspState::Freeverb {
        combs,
        comb_write,
        comb_lp,
        aps,
        ap_write,
    } = state
    else {
        return;
    };

    for (line, tuning) in combs.iter_mut().zip(FREEVERB_COMB_TUNING.iter()) {
        if !ensure_line(ctx.arena, line, scale_tuning(*tuning, sr, 44_100.0)) {
            super::arithmetic::copy(out, inputs);
            return;
        }
    }
    for (line, tuning) in aps.iter_mut().zip(FREEVERB_ALLPASS_TUNING.iter()) {
        if !ensure_line(ctx.arena, line, scale_tuning(*tuning, sr, 44_100.0)) {
            super::arithmetic::copy(out, inputs);
            return;
        }
    }

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let room = in_sample(inputs, 1, i, 0.5).clamp(0.0, 1.0);
        let damp = in_sample(inputs, 2, i, 0.5).clamp(0.0, 1.0);
        let comb_feedback = 0.7 + room * 0.28;
        let damp1 = damp * 0.4;

        // parallel damped combs
        let mut acc = 0.0;
        for c in 0..8 {
            let buf = ctx.arena.line_mut(combs[c]);
            let len = buf.len();
            let w = comb_write[c] as usize;
            let output = buf[w];
            comb_lp[c] = output * (1.0 - damp1) + comb_lp[c] * damp1;
            buf[w] = x + comb_lp[c] * comb_feedback;
            comb_write[c] = ((w + 1) % len) as u32;
            acc += output;
        }

        // series allpasses
        let mut y = acc * 0.125;
        for a in 0..4 {
            let buf = ctx.arena.line_mut(aps[a]);
            let len = buf.len();
            let w = ap_write[a] as usize;
            let bufout = buf[w];
            buf[w] = y + bufout * 0.5;
            y = bufout - y;
            ap_write[a] = ((w + 1) % len) as u32;
        }
        out[i] = y;
    }
}

/// One Dattorro-style lattice allpass step
#[inline(always)]
fn allpass_step(buf: &mut [f32], write: &mut u32, gain: f32, x: f32, read_offset: f32) -> f32 {
    let len = buf.len();
    let w = *write as usize;
    let delayed = if read_offset > 0.0 {
        read_lerp(buf, w, read_offset)
    } else {
        buf[w]
    };
    let v = x + gain * delayed;
    buf[w] = v;
    *write = ((w + 1) % len) as u32;
    delayed - gain * v
}

/// Plain delay-line step: returns the oldest sample, writes the new one
#[inline(always)]
fn delay_step(buf: &mut [f32], write: &mut u32, x: f32) -> f32 {
    let len = buf.len();
    let w = *write as usize;
    let out = buf[w];
    buf[w] = x;
    *write = ((w + 1) % len) as u32;
    out
}

const DATTORRO_RATE: f32 = 29_761.0;

/// REVERB_DATTORRO (mono render of the plate)
///
/// Inputs: signal, decay 0..1 (default 0.5), damping 0..1 (default 0.3).
pub(crate) fn dattorro(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Dattorro);
    let DspState::Dattorro {
        pre,
        pre_write,
        aps,
        ap_write,
        delays,
        delay_write,
        damp,
        excursion,
    } = state
    else {
        return;
    };

    if !ensure_line(
        ctx.arena,
        pre,
        (DATTORRO_PREDELAY_MAX_SECONDS * sr) as usize + 1,
    ) {
        super::arithmetic::copy(out, inputs);
        return;
    }
    for (slot, tuning) in aps
        .iter_mut()
        .zip(DATTORRO_INPUT_AP.iter().chain(DATTORRO_TANK_AP.iter()))
    {
        if !ensure_line(ctx.arena, slot, scale_tuning(*tuning, sr, DATTORRO_RATE)) {
            super::arithmetic::copy(out, inputs);
            return;
        }
    }
    for (slot, tuning) in delays.iter_mut().zip(DATTORRO_TANK_DELAY.iter()) {
        if !ensure_line(ctx.arena, slot, scale_tuning(*tuning, sr, DATTORRO_RATE)) {
            super::arithmetic::copy(out, inputs);
            return;
        }
    }

    // slow sinusoidal excursion on the first tank allpass (about 0.5 Hz)
    let excursion_inc = f64::from(0.5 * ctx.timing.inv_sample_rate);
    let max_excursion = (sr / DATTORRO_RATE) * 16.0;

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let decay = in_sample(inputs, 1, i, 0.5).clamp(0.0, 0.95);
        let damping = in_sample(inputs, 2, i, 0.3).clamp(0.0, 1.0);

        *excursion = (*excursion + excursion_inc).fract();
        let wobble =
            ((std::f64::consts::TAU * *excursion).sin() as f32 * 0.5 + 0.5) * max_excursion + 1.0;

        // predelay (10 ms) then four input diffusers
        let pre_buf = ctx.arena.line_mut(*pre);
        let pre_len = pre_buf.len();
        let diffused_in = read_lerp(pre_buf, *pre_write as usize, 0.01 * sr);
        pre_buf[*pre_write as usize] = x;
        *pre_write = ((*pre_write as usize + 1) % pre_len) as u32;

        let mut d = diffused_in;
        for (a, gain) in [(0usize, 0.75f32), (1, 0.75), (2, 0.625), (3, 0.625)] {
            let buf = ctx.arena.line_mut(aps[a]);
            d = allpass_step(buf, &mut ap_write[a], gain, d, 0.0);
        }

        // figure-eight tank: each branch ends feed the other's head
        let tail_b = {
            let buf = ctx.arena.line_mut(delays[1]);
            buf[delay_write[1] as usize]
        };
        let tail_a = {
            let buf = ctx.arena.line_mut(delays[3]);
            buf[delay_write[3] as usize]
        };

        // branch A; the first tank allpass reads a little short of its full
        // length, modulated by the excursion
        let mut a_sig = d + tail_b * decay;
        let mod_read = (aps[4].len as f32 - 2.0 - wobble).max(1.0);
        a_sig = allpass_step(
            ctx.arena.line_mut(aps[4]),
            &mut ap_write[4],
            -0.7,
            a_sig,
            mod_read,
        );
        let a_mid = delay_step(ctx.arena.line_mut(delays[0]), &mut delay_write[0], a_sig);
        damp[0] = a_mid * (1.0 - damping) + damp[0] * damping;
        let a_damped = damp[0] * decay;
        let a_late = allpass_step(ctx.arena.line_mut(aps[5]), &mut ap_write[5], 0.5, a_damped, 0.0);
        delay_step(ctx.arena.line_mut(delays[1]), &mut delay_write[1], a_late);

        // branch B
        let mut b_sig = d + tail_a * decay;
        b_sig = allpass_step(ctx.arena.line_mut(aps[6]), &mut ap_write[6], -0.7, b_sig, 0.0);
        let b_mid = delay_step(ctx.arena.line_mut(delays[2]), &mut delay_write[2], b_sig);
        damp[1] = b_mid * (1.0 - damping) + damp[1] * damping;
        let b_damped = damp[1] * decay;
        let b_late = allpass_step(ctx.arena.line_mut(aps[7]), &mut ap_write[7], 0.5, b_damped, 0.0);
        delay_step(ctx.arena.line_mut(delays[3]), &mut delay_write[3], b_late);

        out[i] = 0.6 * (a_mid + b_late - b_mid - a_late);
    }
}

/// REVERB_FDN: four lines under a Householder feedback matrix
///
/// Inputs: signal, decay time s (default 2.0), damping 0..1 (default 0.2).
pub(crate) fn fdn(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Fdn);
    let DspState::Fdn { lines, write, lp } = state else {
        return;
    };
    for (slot, seconds) in lines.iter_mut().zip(FDN_LINE_SECONDS.iter()) {
        if !ensure_line(ctx.arena, slot, (seconds * sr) as usize + 1) {
            super::arithmetic::copy(out, inputs);
            return;
        }
    }

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let rt60 = in_sample(inputs, 1, i, 2.0).max(0.05);
        let damping = in_sample(inputs, 2, i, 0.2).clamp(0.0, 0.99);

        let mut outputs = [0.0f32; 4];
        let mut sum = 0.0;
        for (l, o) in outputs.iter_mut().enumerate() {
            let buf = ctx.arena.line(lines[l]);
            *o = buf[write[l] as usize];
            sum += *o;
        }

        // Householder: H = I - (2/N) * ones; lossless energy spread
        let half_sum = sum * 0.5;
        for l in 0..4 {
            // per-line gain from the -60 dB decay time
            let len_seconds = lines[l].len as f32 / sr;
            let gain = 10.0f32.powf(-3.0 * len_seconds / rt60);
            let fb = (outputs[l] - half_sum) * gain;
            lp[l] = fb * (1.0 - damping) + lp[l] * damping;
            let buf = ctx.arena.line_mut(lines[l]);
            let w = write[l] as usize;
            buf[w] = x * 0.25 + lp[l];
            write[l] = ((w + 1) % buf.len()) as u32;
        }
        out[i] = (outputs[0] + outputs[1] + outputs[2] + outputs[3]) * 0.5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::AudioArena;
    use crate::constants::ARENA_SAMPLES;
    use crate::context::ExecutionContext;
    use crate::instruction::Opcode;
    use crate::param_map::ParamMap;
    use crate::sample_bank::SampleBank;
    use crate::state_pool::StatePool;

    struct Rig {
        timing: ExecutionContext,
        states: StatePool,
        arena: AudioArena,
        params: ParamMap,
        samples: SampleBank,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                timing: ExecutionContext::default(),
                states: StatePool::new(),
                arena: AudioArena::new(ARENA_SAMPLES / 4),
                params: ParamMap::new(),
                samples: SampleBank::new(),
            }
        }

        fn ctx(&mut self) -> KernelCtx<'_> {
            KernelCtx {
                timing: &self.timing,
                states: &mut self.states,
                arena: &mut self.arena,
                params: &self.params,
                samples: &self.samples,
            }
        }
    }

    #[test]
    fn test_delay_time_is_exact() {
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Delay, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(1);
        // 100 samples of delay, no feedback
        let time = [100.0f32 / 48_000.0; BLOCK_SIZE];
        let fb = [0.0f32; BLOCK_SIZE];
        let mut impulse = [0.0f32; BLOCK_SIZE];
        impulse[0] = 1.0;

        let inputs: Inputs = [Some(&impulse), Some(&time), Some(&fb), None, None];
        let mut out = [0.0f32; BLOCK_SIZE];
        delay(&instr, &mut out, &inputs, &mut rig.ctx());
        let peak_at = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak_at, 100, "impulse must come back exactly 100 samples late");
        assert!((out[100] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_delay_zero_time_passes_through() {
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Delay, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(2);
        let time = [0.0f32; BLOCK_SIZE];
        let fb = [0.0f32; BLOCK_SIZE];
        let mut signal = [0.0f32; BLOCK_SIZE];
        for (i, v) in signal.iter_mut().enumerate() {
            *v = (i as f32 * 0.1).sin();
        }
        let inputs: Inputs = [Some(&signal), Some(&time), Some(&fb), None, None];
        let mut out = [0.0f32; BLOCK_SIZE];
        delay(&instr, &mut out, &inputs, &mut rig.ctx());
        assert_eq!(out, signal);
    }

    #[test]
    fn test_delay_feedback_repeats_and_decays() {
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Delay, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(3);
        let time = [32.0f32 / 48_000.0; BLOCK_SIZE];
        let fb = [0.5f32; BLOCK_SIZE];
        let mut impulse = [0.0f32; BLOCK_SIZE];
        impulse[0] = 1.0;
        let inputs: Inputs = [Some(&impulse), Some(&time), Some(&fb), None, None];
        let mut out = [0.0f32; BLOCK_SIZE];
        delay(&instr, &mut out, &inputs, &mut rig.ctx());
        assert!((out[32] - 1.0).abs() < 1e-4);
        assert!((out[64] - 0.5).abs() < 1e-4);
        assert!((out[96] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_delay_max_time_stays_in_bounds() {
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Delay, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(4);
        let time = [DELAY_MAX_SECONDS * 2.0; BLOCK_SIZE]; // over-asking clamps
        let fb = [0.9f32; BLOCK_SIZE];
        let signal = [0.25f32; BLOCK_SIZE];
        let inputs: Inputs = [Some(&signal), Some(&time), Some(&fb), None, None];
        let mut out = [0.0f32; BLOCK_SIZE];
        for _ in 0..100 {
            delay(&instr, &mut out, &inputs, &mut rig.ctx());
        }
        assert!(out.iter().all(|x| x.is_finite()));
    }

    fn impulse_response(opcode: Opcode, blocks: usize) -> Vec<f32> {
        let mut rig = Rig::new();
        let instr = Instruction::new(opcode, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(5);
        let mut collected = Vec::new();
        for b in 0..blocks {
            let mut signal = [0.0f32; BLOCK_SIZE];
            if b == 0 {
                signal[0] = 1.0;
            }
            let inputs: Inputs = [Some(&signal), None, None, None, None];
            let mut out = [0.0f32; BLOCK_SIZE];
            let mut ctx = rig.ctx();
            match opcode {
                Opcode::ReverbFreeverb => freeverb(&instr, &mut out, &inputs, &mut ctx),
                Opcode::ReverbDattorro => dattorro(&instr, &mut out, &inputs, &mut ctx),
                Opcode::ReverbFdn => fdn(&instr, &mut out, &inputs, &mut ctx),
                _ => unreachable!(),
            }
            collected.extend_from_slice(&out);
        }
        collected
    }

    #[test]
    fn test_reverbs_produce_decaying_tails() {
        for opcode in [
            Opcode::ReverbFreeverb,
            Opcode::ReverbDattorro,
            Opcode::ReverbFdn,
        ] {
            let ir = impulse_response(opcode, 400);
            assert!(ir.iter().all(|x| x.is_finite()), "{:?} not finite", opcode);

            let early: f32 = ir[..48_000 / 4].iter().map(|x| x * x).sum();
            let late: f32 = ir[48_000 / 4..].iter().map(|x| x * x).sum();
            assert!(early > 0.0, "{:?} produced no tail at all", opcode);
            assert!(
                late < early,
                "{:?} tail must decay: early={} late={}",
                opcode,
                early,
                late
            );
        }
    }
}
