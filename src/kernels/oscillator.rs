//! Naive oscillator band (20-29)
//!
//! Each oscillator keeps a double-precision phase in `[0, 1)`; the per-sample
//! increment is `freq / sample_rate`. Naive shapes alias above a few hundred
//! hertz by design - the anti-aliased band (110-119) is the production
//! choice, this band is the cheap one. Output is nominally `[-1, 1]`
//! (`OSC_RAMP` and `OSC_PHASOR` are unipolar `[0, 1)`).

use std::f64::consts::TAU;

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::{Instruction, Opcode};
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

/// Advance and wrap a unit phase; negative frequencies wrap the other way
#[inline(always)]
pub(crate) fn step_phase(phase: &mut f64, inc: f64) -> f64 {
    let current = *phase;
    let mut next = current + inc;
    next -= next.floor();
    *phase = next;
    current
}

pub(crate) fn naive(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    let inv_sr = f64::from(ctx.timing.inv_sample_rate);
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Phase);
    let DspState::Phase { phase } = state else {
        return;
    };

    for i in 0..BLOCK_SIZE {
        let freq = f64::from(in_sample(inputs, 0, i, 0.0));
        let p = step_phase(phase, freq * inv_sr);
        out[i] = match instr.opcode {
            Opcode::OscSin => (TAU * p).sin() as f32,
            Opcode::OscTri => {
                let p = p as f32;
                if p < 0.5 {
                    4.0 * p - 1.0
                } else {
                    3.0 - 4.0 * p
                }
            }
            Opcode::OscSaw => (2.0 * p - 1.0) as f32,
            Opcode::OscSqr => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            // descending unipolar ramp
            Opcode::OscRamp => (1.0 - p) as f32,
            // raw phase accumulator, the building block for custom shapes
            Opcode::OscPhasor => p as f32,
            _ => unreachable!("non-oscillator opcode routed to naive"),
        };
    }
}
