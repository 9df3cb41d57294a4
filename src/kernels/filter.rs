//! Filter band (33-39)
//!
//! All filters run sample-by-sample with per-sample coefficient updates, in
//! zero-delay-feedback (topology-preserving) form, so they stay stable under
//! audio-rate cutoff and resonance modulation up to and including
//! self-oscillation. Control-rate instructions compute coefficients once per
//! block from the first input sample instead.
//!
//! References:
//! - Andrew Simper's SVF topology-preserving transform
//! - Zavalishin "The Art of VA Filter Design" (ZDF ladder, diode ladder,
//!   Sallen-Key)

use std::f32::consts::PI;

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::{Instruction, Opcode};
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

/// Keep cutoff away from DC and Nyquist so `tan` stays well-behaved
#[inline(always)]
fn clamp_cutoff(cutoff: f32, sample_rate: f32) -> f32 {
    cutoff.clamp(10.0, sample_rate * 0.49)
}

/// SVF core: one topology-preserving-transform step
///
/// Returns `(v1, v2)`: bandpass and lowpass outputs; integrator states are
/// updated by trapezoidal integration.
#[inline(always)]
fn svf_step(ic1: &mut f32, ic2: &mut f32, input: f32, g: f32, k: f32) -> (f32, f32) {
    let a1 = 1.0 / (1.0 + g * (g + k));
    let a2 = g * a1;
    let a3 = g * a2;
    let v3 = input - *ic2;
    let v1 = a1 * *ic1 + a2 * v3;
    let v2 = *ic2 + a2 * *ic1 + a3 * v3;
    *ic1 = 2.0 * v1 - *ic1;
    *ic2 = 2.0 * v2 - *ic2;
    (v1, v2)
}

/// State-variable filter: LP / HP / BP selected by opcode
///
/// Inputs: signal, cutoff Hz, resonance Q (default 0.707).
pub(crate) fn svf(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let sr = ctx.timing.sample_rate;
    let control_rate = instr.is_control_rate();
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Svf);
    let DspState::Svf { ic1, ic2 } = state else {
        return;
    };

    let mut g = 0.0;
    let mut k = 0.0;
    for i in 0..BLOCK_SIZE {
        if i == 0 || !control_rate {
            let cutoff = clamp_cutoff(in_sample(inputs, 1, i, 1_000.0), sr);
            let q = in_sample(inputs, 2, i, 0.707).clamp(0.1, 30.0);
            g = (PI * cutoff / sr).tan();
            k = 1.0 / q;
        }
        let x = in_sample(inputs, 0, i, 0.0);
        let (v1, v2) = svf_step(ic1, ic2, x, g, k);
        out[i] = match instr.opcode {
            Opcode::SvfLp => v2,
            Opcode::SvfBp => v1,
            Opcode::SvfHp => x - k * v1 - v2,
            _ => unreachable!("non-SVF opcode routed to svf"),
        };
    }
}

/// One TPT one-pole step: returns the lowpass output and updates the state
#[inline(always)]
fn onepole_step(s: &mut f32, input: f32, big_g: f32) -> f32 {
    let v = (input - *s) * big_g;
    let y = v + *s;
    *s = y + v;
    y
}

/// Moog ladder: four cascaded one-poles inside a resolved zero-delay
/// resonance loop, with a tanh clamp on the loop input
///
/// Inputs: signal, cutoff Hz, resonance 0..1.25 (self-oscillation near 1).
pub(crate) fn moog_ladder(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let sr = ctx.timing.sample_rate;
    let control_rate = instr.is_control_rate();
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Moog);
    let DspState::Moog { s } = state else {
        return;
    };

    let mut big_g = 0.0;
    let mut k = 0.0;
    let mut one_plus_g = 1.0;
    for i in 0..BLOCK_SIZE {
        if i == 0 || !control_rate {
            let cutoff = clamp_cutoff(in_sample(inputs, 1, i, 1_000.0), sr);
            let res = in_sample(inputs, 2, i, 0.0).clamp(0.0, 1.25);
            let g = (PI * cutoff / sr).tan();
            big_g = g / (1.0 + g);
            one_plus_g = 1.0 + g;
            k = 4.0 * res;
        }
        let x = in_sample(inputs, 0, i, 0.0);

        // instantaneous response of the cascade, for the zero-delay solve
        let g2 = big_g * big_g;
        let g4 = g2 * g2;
        let big_s =
            (big_g * g2 * s[0] + g2 * s[1] + big_g * s[2] + s[3]) / one_plus_g;
        let u = ((x - k * big_s) / (1.0 + k * g4)).tanh();

        let y0 = onepole_step(&mut s[0], u, big_g);
        let y1 = onepole_step(&mut s[1], y0, big_g);
        let y2 = onepole_step(&mut s[2], y1, big_g);
        out[i] = onepole_step(&mut s[3], y2, big_g);
    }
}

/// ZDF diode ladder (TB-303 character)
///
/// The four stages couple forward and backward (each inner stage sees half
/// the neighboring outputs), so the zero-delay loop is solved by a short
/// fixed-point relaxation: two passes are enough for audio-rate modulation
/// at musical cutoffs, and the tanh on the loop input bounds the iteration.
///
/// Inputs: signal, cutoff Hz, resonance 0..1 (self-oscillation near the top).
pub(crate) fn diode_ladder(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let sr = ctx.timing.sample_rate;
    let control_rate = instr.is_control_rate();
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Diode);
    let DspState::Diode { s } = state else {
        return;
    };

    let mut big_g = 0.0;
    let mut k = 0.0;
    for i in 0..BLOCK_SIZE {
        if i == 0 || !control_rate {
            let cutoff = clamp_cutoff(in_sample(inputs, 1, i, 1_000.0), sr);
            let res = in_sample(inputs, 2, i, 0.0).clamp(0.0, 1.0);
            let g = (PI * cutoff / sr).tan();
            big_g = g / (1.0 + g);
            // the diode ladder needs a much hotter loop than the Moog to
            // reach self-oscillation
            k = 16.0 * res;
        }
        let x = in_sample(inputs, 0, i, 0.0);

        let mut y1 = s[0];
        let mut y2 = s[1];
        let mut y3 = s[2];
        let mut y4 = s[3];
        for _ in 0..2 {
            let loop_in = (x - k * y4).tanh();
            y1 = big_g * ((loop_in + 0.5 * y2) - s[0]) + s[0];
            y2 = big_g * ((0.5 * y1 + 0.5 * y3) - s[1]) + s[1];
            y3 = big_g * ((0.5 * y2 + 0.5 * y4) - s[2]) + s[2];
            y4 = big_g * (0.5 * y3 - s[3]) + s[3];
        }
        // commit trapezoidal states
        s[0] = 2.0 * y1 - s[0];
        s[1] = 2.0 * y2 - s[1];
        s[2] = 2.0 * y3 - s[2];
        s[3] = 2.0 * y4 - s[3];

        // makeup gain keeps the passband level roughly constant as the
        // resonance loop eats it
        out[i] = y4 * (1.0 + k);
    }
}

/// Vowel formant table: three formant centers (Hz) per vowel, A E I O U
const VOWEL_FREQS: [[f32; 3]; 5] = [
    [800.0, 1150.0, 2900.0],  // A
    [400.0, 1600.0, 2700.0],  // E
    [350.0, 1700.0, 2700.0],  // I
    [450.0, 800.0, 2830.0],   // O
    [325.0, 700.0, 2700.0],   // U
];

/// Relative formant amplitudes per vowel
const VOWEL_AMPS: [[f32; 3]; 5] = [
    [1.0, 0.5, 0.05],
    [1.0, 0.25, 0.1],
    [1.0, 0.1, 0.06],
    [1.0, 0.3, 0.05],
    [1.0, 0.25, 0.03],
];

/// 3-band formant morph: three parallel bandpass sections whose centers and
/// gains interpolate along the vowel sequence A-E-I-O-U
///
/// Inputs: signal, morph position 0..4, formant Q (default 8).
pub(crate) fn formant_morph(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Formant);
    let DspState::Formant { ic } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let x = in_sample(inputs, 0, i, 0.0);
        let morph = in_sample(inputs, 1, i, 0.0).clamp(0.0, 4.0);
        let q = in_sample(inputs, 2, i, 8.0).clamp(1.0, 30.0);
        let lo = morph.floor() as usize;
        let hi = (lo + 1).min(4);
        let t = morph - lo as f32;

        let mut acc = 0.0;
        for band in 0..3 {
            let freq = VOWEL_FREQS[lo][band] + (VOWEL_FREQS[hi][band] - VOWEL_FREQS[lo][band]) * t;
            let amp = VOWEL_AMPS[lo][band] + (VOWEL_AMPS[hi][band] - VOWEL_AMPS[lo][band]) * t;
            let g = (PI * clamp_cutoff(freq, sr) / sr).tan();
            let k = 1.0 / q;
            let [s1, s2] = &mut ic[band];
            let (bp, _lp) = svf_step(s1, s2, x, g, k);
            acc += bp * amp;
        }
        out[i] = acc;
    }
}

/// Diode clipper used inside the Sallen-Key feedback path
#[inline(always)]
fn diode_clip(x: f32) -> f32 {
    x / (1.0 + x.abs())
}

/// Sallen-Key lowpass (MS-20 style) with clipped resonance feedback
///
/// Two TPT one-poles; the resonance signal is the first stage's bandpass-ish
/// difference, run through a diode clipper before re-entering, which is what
/// gives the MS-20 its ragged scream instead of clean self-oscillation.
///
/// Inputs: signal, cutoff Hz, resonance 0..1.
pub(crate) fn sallen_key(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
) {
    let sr = ctx.timing.sample_rate;
    let control_rate = instr.is_control_rate();
    let state = ctx.states.get_or_create(instr.state_id, StateKind::SallenKey);
    let DspState::SallenKey { s1, s2 } = state else {
        return;
    };

    let mut big_g = 0.0;
    let mut k = 0.0;
    for i in 0..BLOCK_SIZE {
        if i == 0 || !control_rate {
            let cutoff = clamp_cutoff(in_sample(inputs, 1, i, 1_000.0), sr);
            let res = in_sample(inputs, 2, i, 0.0).clamp(0.0, 1.0);
            let g = (PI * cutoff / sr).tan();
            big_g = g / (1.0 + g);
            k = 2.0 * res;
        }
        let x = in_sample(inputs, 0, i, 0.0);

        // relaxation over the clipped feedback loop; the fed-back signal is
        // the inter-stage difference (a crude bandpass), clipped
        let mut y1 = *s1;
        let mut y2 = *s2;
        for _ in 0..2 {
            let fb = k * diode_clip(y1 - y2);
            y1 = big_g * ((x + fb) - *s1) + *s1;
            y2 = big_g * (y1 - *s2) + *s2;
        }
        *s1 = 2.0 * y1 - *s1;
        *s2 = 2.0 * y2 - *s2;
        out[i] = y2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::AudioArena;
    use crate::context::ExecutionContext;
    use crate::param_map::ParamMap;
    use crate::sample_bank::SampleBank;
    use crate::state_pool::StatePool;
    use std::f32::consts::TAU;

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
                arena: AudioArena::new(1 << 16),
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

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
    }

    /// Run `blocks` blocks of a sine through a filter opcode; returns output
    fn run_filter(opcode: Opcode, tone: f32, cutoff: f32, res: f32, blocks: usize) -> Vec<f32> {
        let mut rig = Rig::new();
        let instr = Instruction::new(opcode, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(123);
        let cutoff_buf = [cutoff; BLOCK_SIZE];
        let res_buf = [res; BLOCK_SIZE];
        let mut collected = Vec::new();
        let mut n = 0usize;
        for _ in 0..blocks {
            let mut signal = [0.0f32; BLOCK_SIZE];
            for v in signal.iter_mut() {
                *v = (TAU * tone * n as f32 / 48_000.0).sin();
                n += 1;
            }
            let inputs: Inputs = [Some(&signal), Some(&cutoff_buf), Some(&res_buf), None, None];
            let mut out = [0.0f32; BLOCK_SIZE];
            let mut ctx = rig.ctx();
            match opcode {
                Opcode::SvfLp | Opcode::SvfHp | Opcode::SvfBp => {
                    svf(&instr, &mut out, &inputs, &mut ctx)
                }
                Opcode::MoogLadder => moog_ladder(&instr, &mut out, &inputs, &mut ctx),
                Opcode::DiodeLadder => diode_ladder(&instr, &mut out, &inputs, &mut ctx),
                Opcode::FormantMorph => formant_morph(&instr, &mut out, &inputs, &mut ctx),
                Opcode::SallenKey => sallen_key(&instr, &mut out, &inputs, &mut ctx),
                _ => unreachable!(),
            }
            collected.extend_from_slice(&out);
        }
        collected
    }

    #[test]
    fn test_svf_lowpass_attenuates_high_frequencies() {
        // settle, then compare steady-state RMS
        let passed = run_filter(Opcode::SvfLp, 200.0, 1_000.0, 0.707, 40);
        let stopped = run_filter(Opcode::SvfLp, 8_000.0, 1_000.0, 0.707, 40);
        let pass_rms = rms(&passed[20 * BLOCK_SIZE..]);
        let stop_rms = rms(&stopped[20 * BLOCK_SIZE..]);
        assert!(
            pass_rms > 0.6 && stop_rms < 0.1,
            "LP selectivity wrong: pass={} stop={}",
            pass_rms,
            stop_rms
        );
    }

    #[test]
    fn test_svf_highpass_mirrors_lowpass() {
        let passed = run_filter(Opcode::SvfHp, 8_000.0, 1_000.0, 0.707, 40);
        let stopped = run_filter(Opcode::SvfHp, 100.0, 1_000.0, 0.707, 40);
        assert!(rms(&passed[20 * BLOCK_SIZE..]) > 0.5);
        assert!(rms(&stopped[20 * BLOCK_SIZE..]) < 0.1);
    }

    #[test]
    fn test_svf_bandpass_peaks_at_center() {
        let center = run_filter(Opcode::SvfBp, 1_000.0, 1_000.0, 4.0, 40);
        let off = run_filter(Opcode::SvfBp, 100.0, 1_000.0, 4.0, 40);
        assert!(rms(&center[20 * BLOCK_SIZE..]) > 3.0 * rms(&off[20 * BLOCK_SIZE..]));
    }

    #[test]
    fn test_moog_is_steeper_than_svf() {
        // 4-pole vs 2-pole: two octaves above cutoff the ladder is darker
        let svf_out = run_filter(Opcode::SvfLp, 4_000.0, 1_000.0, 0.707, 40);
        let moog_out = run_filter(Opcode::MoogLadder, 4_000.0, 1_000.0, 0.0, 40);
        let svf_rms = rms(&svf_out[20 * BLOCK_SIZE..]);
        let moog_rms = rms(&moog_out[20 * BLOCK_SIZE..]);
        assert!(
            moog_rms < svf_rms,
            "ladder should roll off harder: moog={} svf={}",
            moog_rms,
            svf_rms
        );
    }

    #[test]
    fn test_filters_stay_finite_at_extremes() {
        for opcode in [
            Opcode::SvfLp,
            Opcode::MoogLadder,
            Opcode::DiodeLadder,
            Opcode::SallenKey,
        ] {
            // res at the top of the legal range, cutoff at both extremes
            for cutoff in [5.0, 30_000.0] {
                let out = run_filter(opcode, 440.0, cutoff, 1.0, 20);
                assert!(
                    out.iter().all(|x| x.is_finite()),
                    "{:?} blew up at cutoff {}",
                    opcode,
                    cutoff
                );
            }
        }
    }

    #[test]
    fn test_diode_ladder_resonance_boosts_cutoff_region() {
        // drive at the cutoff: cranking resonance must raise the output and
        // the tanh in the loop must keep it bounded
        let flat = run_filter(Opcode::DiodeLadder, 800.0, 800.0, 0.0, 60);
        let resonant = run_filter(Opcode::DiodeLadder, 800.0, 800.0, 0.9, 60);
        let flat_rms = rms(&flat[30 * BLOCK_SIZE..]);
        let resonant_rms = rms(&resonant[30 * BLOCK_SIZE..]);
        assert!(
            resonant_rms > 1.5 * flat_rms,
            "resonance should boost the cutoff region: {} vs {}",
            resonant_rms,
            flat_rms
        );
        let peak = resonant.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(peak.is_finite() && peak < 20.0, "unbounded resonance: {}", peak);
    }

    #[test]
    fn test_formant_morph_shapes_spectrum() {
        let out = run_filter(Opcode::FormantMorph, 200.0, 0.0, 8.0, 40);
        assert!(out.iter().all(|x| x.is_finite()));
        assert!(rms(&out[20 * BLOCK_SIZE..]) > 0.0);
    }

    #[test]
    fn test_sallen_key_resonance_is_bounded() {
        // the diode clipper must bound the feedback even at max resonance
        let out = run_filter(Opcode::SallenKey, 500.0, 500.0, 1.0, 60);
        let peak = out.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(peak.is_finite() && peak < 10.0, "unbounded resonance: {}", peak);
    }
}
