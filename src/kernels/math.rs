//! Pure math bands (40-49, 120-139)
//!
//! Stateless, elementwise. Domain errors follow IEEE-754 (negative sqrt is
//! NaN, log of zero is -inf); nothing here traps. The few multi-operand ops
//! read sensible defaults for absent inputs so partially-wired instructions
//! stay usable: CLAMP defaults to [0, 1], WRAP to [0, 1), LERP's t to 0.

use crate::buffer_pool::Block;
use crate::constants::BLOCK_SIZE;
use crate::instruction::Opcode;

use super::{in_sample, Inputs};

#[inline(always)]
fn wrap_range(x: f32, lo: f32, hi: f32) -> f32 {
    let span = hi - lo;
    if span <= 0.0 {
        return lo;
    }
    lo + (x - lo).rem_euclid(span)
}

pub(crate) fn pure(opcode: Opcode, out: &mut Block, inputs: &Inputs) {
    for i in 0..BLOCK_SIZE {
        let a = in_sample(inputs, 0, i, 0.0);
        out[i] = match opcode {
            Opcode::Abs => a.abs(),
            Opcode::Sqrt => a.sqrt(),
            Opcode::Log => a.ln(),
            Opcode::Exp => a.exp(),
            Opcode::Min => a.min(in_sample(inputs, 1, i, 0.0)),
            Opcode::Max => a.max(in_sample(inputs, 1, i, 0.0)),
            Opcode::Clamp => {
                let lo = in_sample(inputs, 1, i, 0.0);
                let hi = in_sample(inputs, 2, i, 1.0);
                a.clamp(lo.min(hi), hi.max(lo))
            }
            Opcode::Wrap => {
                let lo = in_sample(inputs, 1, i, 0.0);
                let hi = in_sample(inputs, 2, i, 1.0);
                wrap_range(a, lo, hi)
            }
            Opcode::Floor => a.floor(),
            Opcode::Ceil => a.ceil(),
            Opcode::Sin => a.sin(),
            Opcode::Cos => a.cos(),
            Opcode::Tan => a.tan(),
            Opcode::Asin => a.asin(),
            Opcode::Acos => a.acos(),
            Opcode::Atan => a.atan(),
            Opcode::Sinh => a.sinh(),
            Opcode::Cosh => a.cosh(),
            Opcode::Tanh => a.tanh(),
            Opcode::Atan2 => a.atan2(in_sample(inputs, 1, i, 1.0)),
            Opcode::Log2 => a.log2(),
            Opcode::Log10 => a.log10(),
            Opcode::Exp2 => a.exp2(),
            Opcode::Sign => {
                if a == 0.0 {
                    0.0
                } else {
                    a.signum()
                }
            }
            Opcode::Fract => a.fract(),
            Opcode::Mod => {
                let b = in_sample(inputs, 1, i, 1.0);
                if b == 0.0 {
                    0.0
                } else {
                    a.rem_euclid(b)
                }
            }
            Opcode::Round => a.round(),
            Opcode::Lerp => {
                let b = in_sample(inputs, 1, i, 0.0);
                let t = in_sample(inputs, 2, i, 0.0);
                a + (b - a) * t
            }
            _ => unreachable!("non-math opcode routed to pure"),
        };
    }
}
