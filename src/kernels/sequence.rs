//! Sequencing and timing band (90-99)
//!
//! Everything here derives from the execution context's beat clock, which
//! itself is a pure function of the global sample counter and BPM - so
//! sequencer output is deterministic and `seek` lands triggers exactly where
//! a straight-through render would have put them.
//!
//! Event tables are compiler-evaluated (the side channel of the program
//! load); the kernels only walk cursors over plain arrays.

use crate::buffer_pool::Block;
use crate::constants::{BEATS_PER_BAR, BLOCK_SIZE};
use crate::instruction::Instruction;
use crate::state_pool::{DspState, StateKind};

use super::util::{to_bipolar, xorshift};
use super::{in_sample, in_scalar, Inputs, KernelCtx};

/// CLOCK: emits a phase ramp per the rate byte
///
/// Packed constant: 0 = beat phase, 1 = bar phase, 2 = cycle (4 bars).
pub(crate) fn clock(instr: &Instruction, out: &mut Block, ctx: &mut KernelCtx) {
    let divisor = match instr.packed_const() {
        0 => 1.0,
        1 => BEATS_PER_BAR,
        _ => BEATS_PER_BAR * 4.0,
    };
    for (i, v) in out.iter_mut().enumerate() {
        *v = ((ctx.timing.beat_at(i) / divisor).fract()) as f32;
    }
}

/// LFO shapes, packed in the rate byte
const LFO_SINE: u8 = 0;
const LFO_TRI: u8 = 1;
const LFO_SAW: u8 = 2;
const LFO_SQUARE: u8 = 3;
const LFO_RANDOM: u8 = 4;
const LFO_SMOOTH_RANDOM: u8 = 5;

/// LFO: shape selected by the packed rate constant; frequency in Hz from
/// input 0 (default 1). Shapes 4/5 hold (or glide between) random values
/// drawn once per cycle from the state's own generator; shape 6+ is plain
/// per-sample noise.
pub(crate) fn lfo(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = f64::from(ctx.timing.inv_sample_rate);
    let shape = instr.packed_const();
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Lfo);
    let DspState::Lfo { phase, rng, held } = state else {
        return;
    };
    if *rng == 0 {
        *rng = instr.state_id | 1;
    }

    for i in 0..BLOCK_SIZE {
        let freq = f64::from(in_sample(inputs, 0, i, 1.0));
        let previous = *phase;
        *phase = (*phase + freq * inv_sr).rem_euclid(1.0);
        let wrapped = *phase < previous;
        let p = *phase as f32;

        out[i] = match shape {
            LFO_SINE => (std::f64::consts::TAU * *phase).sin() as f32,
            LFO_TRI => {
                if p < 0.5 {
                    4.0 * p - 1.0
                } else {
                    3.0 - 4.0 * p
                }
            }
            LFO_SAW => 2.0 * p - 1.0,
            LFO_SQUARE => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            LFO_RANDOM => {
                if wrapped || i == 0 && *held == 0.0 {
                    *held = to_bipolar(xorshift(rng));
                }
                *held
            }
            LFO_SMOOTH_RANDOM => {
                if wrapped {
                    *held = to_bipolar(xorshift(rng));
                }
                // glide toward the held target within the cycle
                *held * p + *held * (1.0 - p) * 0.5
            }
            _ => to_bipolar(xorshift(rng)),
        };
    }
}

/// Sequencer output modes, packed in the rate byte
const SEQ_TRIGGER: u8 = 0;
const SEQ_VALUE: u8 = 1;
const SEQ_VELOCITY: u8 = 2;
const SEQ_GATE: u8 = 3;

/// SEQ_STEP: walk a compiler-injected `(time, value, velocity)` table
///
/// Event times are beat positions within a one-bar cycle. Mode 0 emits a
/// single-sample impulse of the event's velocity at the event's beat; mode 1
/// holds the last event's value; mode 2 holds the last velocity; mode 3 is a
/// gate at the event's velocity for half the gap to the next event, which is
/// what envelope followers downstream want to see.
pub(crate) fn seq_step(instr: &Instruction, out: &mut Block, ctx: &mut KernelCtx) {
    let mode = instr.packed_const();
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Seq);
    let DspState::Seq {
        events,
        count,
        cursor,
        last_beat,
    } = state
    else {
        return;
    };
    let n = *count as usize;
    if n == 0 {
        out.fill(0.0);
        return;
    }

    for (i, v) in out.iter_mut().enumerate() {
        let beat = ctx.timing.beat_at(i);
        let cycle_beat = beat.rem_euclid(BEATS_PER_BAR);

        // cycle wrapped (or we seeked backwards): rewind the cursor
        if cycle_beat < *last_beat {
            *cursor = 0;
        }
        *last_beat = cycle_beat;

        let mut fired: Option<usize> = None;
        while (*cursor as usize) < n && f64::from(events[*cursor as usize].time) <= cycle_beat {
            fired = Some(*cursor as usize);
            *cursor += 1;
        }

        *v = match mode {
            SEQ_TRIGGER => fired.map_or(0.0, |e| events[e].velocity),
            SEQ_VALUE => {
                let last = (*cursor as usize).checked_sub(1);
                last.map_or(0.0, |e| events[e].value)
            }
            SEQ_VELOCITY => {
                let last = (*cursor as usize).checked_sub(1);
                last.map_or(0.0, |e| events[e].velocity)
            }
            SEQ_GATE => match (*cursor as usize).checked_sub(1) {
                Some(e) => {
                    let on = f64::from(events[e].time);
                    let next = if e + 1 < n {
                        f64::from(events[e + 1].time)
                    } else {
                        BEATS_PER_BAR
                    };
                    let off = on + 0.5 * (next - on);
                    if cycle_beat < off {
                        events[e].velocity
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            },
            _ => 0.0,
        };
    }
}

/// Arithmetic Bjorklund test: does step `i` of `k`-in-`n` carry a hit?
///
/// Equivalent to the recursive Euclidean construction for all k <= n.
#[inline]
fn euclid_hit(step: i64, k: i64, n: i64, rotation: i64) -> bool {
    if k <= 0 || n <= 0 {
        return false;
    }
    let k = k.min(n);
    let i = (step + rotation).rem_euclid(n);
    ((i + 1) * k).div_euclid(n) > (i * k).div_euclid(n)
}

/// EUCLID: k hits across n steps with rotation r, one step per 16th note
///
/// Inputs: k (default 4), n (default 16), rotation (default 0); all read at
/// block start. Emits a single-sample impulse at each hit step boundary.
pub(crate) fn euclid(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let k = in_scalar(inputs, 0, 4.0).round() as i64;
    let n = in_scalar(inputs, 1, 16.0).round() as i64;
    let rotation = in_scalar(inputs, 2, 0.0).round() as i64;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Euclid);
    let DspState::Euclid { last_step } = state else {
        return;
    };

    for (i, v) in out.iter_mut().enumerate() {
        // 16th-note steps: 4 per beat
        let step = (ctx.timing.beat_at(i) * 4.0).floor() as i64;
        if step != *last_step && euclid_hit(step, k, n, rotation) {
            *v = 1.0;
        } else {
            *v = 0.0;
        }
        if step != *last_step {
            *last_step = step;
        }
    }
}

/// TRIGGER: an impulse every `division` beats (default 1)
pub(crate) fn trigger(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let division = f64::from(in_scalar(inputs, 0, 1.0).max(1e-3));
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Trigger);
    let DspState::Trigger { last_tick } = state else {
        return;
    };

    for (i, v) in out.iter_mut().enumerate() {
        let tick = (ctx.timing.beat_at(i) / division).floor() as i64;
        if tick != *last_tick {
            *last_tick = tick;
            *v = 1.0;
        } else {
            *v = 0.0;
        }
    }
}

/// TIMELINE: piecewise-linear breakpoint automation over absolute beats
///
/// Before the first point the first value holds; after the last, the last.
pub(crate) fn timeline(instr: &Instruction, out: &mut Block, ctx: &mut KernelCtx) {
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Timeline);
    let DspState::Timeline { points, count } = state else {
        return;
    };
    let n = *count as usize;
    if n == 0 {
        out.fill(0.0);
        return;
    }

    for (i, v) in out.iter_mut().enumerate() {
        let beat = ctx.timing.beat_at(i) as f32;
        *v = if beat <= points[0].time {
            points[0].value
        } else if beat >= points[n - 1].time {
            points[n - 1].value
        } else {
            // n is small (<= 32); a linear scan beats bookkeeping a cursor
            let mut value = points[n - 1].value;
            for w in points[..n].windows(2) {
                if beat < w[1].time {
                    let span = (w[1].time - w[0].time).max(1e-9);
                    let t = (beat - w[0].time) / span;
                    value = w[0].value + (w[1].value - w[0].value) * t;
                    break;
                }
            }
            value
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::AudioArena;
    use crate::context::ExecutionContext;
    use crate::instruction::{pack_rate, Opcode};
    use crate::param_map::ParamMap;
    use crate::program::{SeqEvent, TimelinePoint};
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
                arena: AudioArena::new(1 << 12),
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
    fn test_clock_beat_phase_ramps() {
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Clock, 0);
        let mut out = [0.0f32; BLOCK_SIZE];
        clock(&instr, &mut out, &mut rig.ctx());
        assert!(out[0] < out[BLOCK_SIZE - 1], "phase should rise within a beat");
        assert!(out.iter().all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn test_lfo_shapes_in_range() {
        for shape in 0..=6u8 {
            let mut rig = Rig::new();
            let instr = Instruction::new(Opcode::Lfo, 1)
                .with_inputs(&[0])
                .with_state(50 + shape as u32)
                .with_rate(pack_rate(false, shape));
            let freq = [5.0f32; BLOCK_SIZE];
            let inputs: Inputs = [Some(&freq), None, None, None, None];
            let mut seen = Vec::new();
            for _ in 0..100 {
                let mut out = [0.0f32; BLOCK_SIZE];
                lfo(&instr, &mut out, &inputs, &mut rig.ctx());
                seen.extend_from_slice(&out);
            }
            assert!(
                seen.iter().all(|x| x.is_finite() && x.abs() <= 1.0 + 1e-5),
                "shape {} escaped range",
                shape
            );
            assert!(seen.iter().any(|&x| x != 0.0), "shape {} silent", shape);
        }
    }

    /// Render n blocks of a kernel that only needs the timing context,
    /// advancing the clock like the VM would
    fn render_timed<F: FnMut(&mut Rig, &mut Block)>(
        rig: &mut Rig,
        blocks: usize,
        mut f: F,
    ) -> Vec<f32> {
        let mut collected = Vec::new();
        for _ in 0..blocks {
            let mut out = [0.0f32; BLOCK_SIZE];
            f(rig, &mut out);
            rig.timing.advance_block();
            collected.extend_from_slice(&out);
        }
        collected
    }

    #[test]
    fn test_seq_step_fires_at_beat_positions() {
        let mut rig = Rig::new();
        rig.states.init_seq_table(
            7,
            &[
                SeqEvent { time: 0.0, value: 60.0, velocity: 1.0 },
                SeqEvent { time: 1.0, value: 62.0, velocity: 0.5 },
            ],
        );
        let instr = Instruction::new(Opcode::SeqStep, 0).with_state(7);
        // 120 BPM, 48 kHz: one beat is 24000 samples; render 2.5 beats
        let samples = render_timed(&mut rig, 60_000 / BLOCK_SIZE, |rig, out| {
            seq_step(&instr, out, &mut rig.ctx());
        });
        let hits: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(hits.len(), 2, "expected two events: {:?}", hits);
        assert_eq!(hits[0], 0);
        assert!(
            (hits[1] as i64 - 24_000).abs() <= 1,
            "second event misplaced: {}",
            hits[1]
        );
        assert!((samples[hits[1]] - 0.5).abs() < 1e-6, "velocity wrong");
    }

    #[test]
    fn test_seq_step_value_mode_holds() {
        let mut rig = Rig::new();
        rig.states.init_seq_table(
            8,
            &[
                SeqEvent { time: 0.0, value: 60.0, velocity: 1.0 },
                SeqEvent { time: 1.0, value: 62.0, velocity: 1.0 },
            ],
        );
        let instr = Instruction::new(Opcode::SeqStep, 0)
            .with_state(8)
            .with_rate(pack_rate(false, SEQ_VALUE));
        let samples = render_timed(&mut rig, 30_000 / BLOCK_SIZE, |rig, out| {
            seq_step(&instr, out, &mut rig.ctx());
        });
        assert_eq!(samples[100], 60.0);
        assert_eq!(samples[25_000], 62.0);
    }

    #[test]
    fn test_seq_step_gate_mode_half_duty() {
        let mut rig = Rig::new();
        rig.states.init_seq_table(
            12,
            &[
                SeqEvent { time: 0.0, value: 60.0, velocity: 1.0 },
                SeqEvent { time: 1.0, value: 62.0, velocity: 1.0 },
            ],
        );
        let instr = Instruction::new(Opcode::SeqStep, 0)
            .with_state(12)
            .with_rate(pack_rate(false, SEQ_GATE));
        // one beat = 24000 samples; the gate holds for half of it
        let samples = render_timed(&mut rig, 24_000 / BLOCK_SIZE, |rig, out| {
            seq_step(&instr, out, &mut rig.ctx());
        });
        assert_eq!(samples[100], 1.0, "gate should be high just after the event");
        assert_eq!(samples[11_000], 1.0, "gate holds through the half-step");
        assert_eq!(samples[13_000], 0.0, "gate must fall at half duty");
    }

    #[test]
    fn test_euclid_distribution_count() {
        // 4-in-16 over one bar of 16ths = 4 hits per bar
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Euclid, 3)
            .with_inputs(&[0, 1, 2])
            .with_state(9);
        let k = [4.0f32; BLOCK_SIZE];
        let n = [16.0f32; BLOCK_SIZE];
        let r = [0.0f32; BLOCK_SIZE];
        // one bar at 120 BPM = 4 beats = 96000 samples
        let samples = render_timed(&mut rig, 96_000 / BLOCK_SIZE, |rig, out| {
            let inputs: Inputs = [Some(&k), Some(&n), Some(&r), None, None];
            euclid(&instr, out, &inputs, &mut rig.ctx());
        });
        let hits = samples.iter().filter(|&&v| v != 0.0).count();
        // the step at beat 0 has no preceding step-change, so 3 or 4
        assert!((3..=4).contains(&hits), "expected ~4 hits, got {}", hits);
    }

    #[test]
    fn test_euclid_hit_pattern_tresillo() {
        // 3-in-8 is the tresillo: hits at steps 0, 3, 6
        let hits: Vec<i64> = (0..8).filter(|&s| euclid_hit(s, 3, 8, 0)).collect();
        assert_eq!(hits, vec![0, 3, 6]);
        // rotation shifts the pattern
        let rotated: Vec<i64> = (0..8).filter(|&s| euclid_hit(s, 3, 8, 1)).collect();
        assert_eq!(rotated.len(), 3);
        assert_ne!(rotated, vec![0, 3, 6]);
    }

    #[test]
    fn test_trigger_division() {
        let mut rig = Rig::new();
        let instr = Instruction::new(Opcode::Trigger, 1).with_inputs(&[0]).with_state(10);
        let division = [0.5f32; BLOCK_SIZE]; // every half beat = 12000 samples
        let samples = render_timed(&mut rig, 48_000 / BLOCK_SIZE, |rig, out| {
            let inputs: Inputs = [Some(&division), None, None, None, None];
            trigger(&instr, out, &inputs, &mut rig.ctx());
        });
        let hits: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, _)| i)
            .collect();
        // 2 beats rendered at half-beat division: ticks at 12000, 24000, 36000
        // (the tick at sample 0 is suppressed: last_tick starts at -1... it
        // actually fires because floor(0) == 0 != -1)
        assert!(hits.len() >= 3, "too few ticks: {:?}", hits);
        for pair in hits.windows(2) {
            assert!(
                (pair[1] as i64 - pair[0] as i64 - 12_000).abs() <= 1,
                "tick spacing drifted: {:?}",
                pair
            );
        }
    }

    #[test]
    fn test_timeline_interpolates() {
        let mut rig = Rig::new();
        rig.states.init_timeline(
            11,
            &[
                TimelinePoint { time: 0.0, value: 0.0 },
                TimelinePoint { time: 2.0, value: 1.0 },
                TimelinePoint { time: 4.0, value: 0.5 },
            ],
        );
        let instr = Instruction::new(Opcode::Timeline, 0).with_state(11);
        // 5 beats at 120 BPM = 120000 samples
        let samples = render_timed(&mut rig, 120_000 / BLOCK_SIZE, |rig, out| {
            timeline(&instr, out, &mut rig.ctx());
        });
        assert!((samples[0] - 0.0).abs() < 1e-3);
        // beat 1 = halfway up the first segment
        assert!((samples[24_000] - 0.5).abs() < 1e-2);
        assert!((samples[48_000] - 1.0).abs() < 1e-2);
        // past the last point the value holds
        assert!((samples[110_000] - 0.5).abs() < 1e-2);
    }
}
