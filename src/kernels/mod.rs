//! Opcode kernels and the dispatch loop
//!
//! Each kernel is a small self-contained numerical routine: it reads its
//! input buffers, writes one output block, and, if stateful, borrows its
//! per-instance memory from the state pool. Dispatch is a single closed match
//! on the opcode - no virtual calls, and every kernel is inlinable into the
//! dispatch loop.
//!
//! `OUTPUT` never reaches this module; the VM intercepts it because it is the
//! only opcode that touches the caller's stereo pointers.

pub(crate) mod arithmetic;
pub(crate) mod delay;
pub(crate) mod dynamics;
pub(crate) mod effect;
pub(crate) mod envelope;
pub(crate) mod filter;
pub(crate) mod math;
pub(crate) mod oscillator;
pub(crate) mod polyblep;
pub(crate) mod sampler;
pub(crate) mod sequence;
pub(crate) mod util;

use crate::arena::AudioArena;
use crate::buffer_pool::Block;
use crate::context::ExecutionContext;
use crate::instruction::{Instruction, Opcode};
use crate::param_map::ParamMap;
use crate::sample_bank::SampleBank;
use crate::state_pool::StatePool;

/// Everything a kernel may touch besides its operand buffers
pub(crate) struct KernelCtx<'a> {
    pub timing: &'a ExecutionContext,
    pub states: &'a mut StatePool,
    pub arena: &'a mut AudioArena,
    pub params: &'a ParamMap,
    pub samples: &'a SampleBank,
}

/// Input views for one instruction; `None` marks an absent operand
pub(crate) type Inputs<'a> = [Option<&'a Block>; 5];

/// Read input `idx` at sample `i`, falling back to `default` when absent
#[inline(always)]
pub(crate) fn in_sample(inputs: &Inputs, idx: usize, i: usize, default: f32) -> f32 {
    match inputs[idx] {
        Some(block) => block[i],
        None => default,
    }
}

/// First-sample read of input `idx`, for control-style operands
#[inline(always)]
pub(crate) fn in_scalar(inputs: &Inputs, idx: usize, default: f32) -> f32 {
    match inputs[idx] {
        Some(block) => block[0],
        None => default,
    }
}

/// Execute one instruction's kernel
pub(crate) fn execute(instr: &Instruction, out: &mut Block, inputs: &Inputs, ctx: &mut KernelCtx) {
    use Opcode::*;
    match instr.opcode {
        Nop | Output => {}
        PushConst => arithmetic::push_const(instr, out),
        Copy => arithmetic::copy(out, inputs),

        Add | Sub | Mul | Div | Pow | Neg => arithmetic::binary(instr.opcode, out, inputs),

        OscSin | OscTri | OscSaw | OscSqr | OscRamp | OscPhasor => {
            oscillator::naive(instr, out, inputs, ctx)
        }

        SvfLp | SvfHp | SvfBp => filter::svf(instr, out, inputs, ctx),
        MoogLadder => filter::moog_ladder(instr, out, inputs, ctx),
        DiodeLadder => filter::diode_ladder(instr, out, inputs, ctx),
        FormantMorph => filter::formant_morph(instr, out, inputs, ctx),
        SallenKey => filter::sallen_key(instr, out, inputs, ctx),

        Abs | Sqrt | Log | Exp | Min | Max | Clamp | Wrap | Floor | Ceil | Sin | Cos | Tan
        | Asin | Acos | Atan | Sinh | Cosh | Tanh | Atan2 | Log2 | Log10 | Exp2 | Sign | Fract
        | Mod | Round | Lerp => math::pure(instr.opcode, out, inputs),

        Noise => util::noise(instr, out, ctx),
        Mtof => util::mtof(out, inputs),
        Dc => util::dc(instr, out, inputs),
        Slew => util::slew(instr, out, inputs, ctx),
        Sah => util::sample_and_hold(instr, out, inputs, ctx),
        EnvGet => util::env_get(instr, out, inputs, ctx),

        EnvAdsr => envelope::adsr(instr, out, inputs, ctx),
        EnvAr => envelope::ar(instr, out, inputs, ctx),
        EnvFollower => envelope::follower(instr, out, inputs, ctx),

        SamplePlay => sampler::play(instr, out, inputs, ctx, false),
        SamplePlayLoop => sampler::play(instr, out, inputs, ctx, true),

        Delay => delay::delay(instr, out, inputs, ctx),
        ReverbFreeverb => delay::freeverb(instr, out, inputs, ctx),
        ReverbDattorro => delay::dattorro(instr, out, inputs, ctx),
        ReverbFdn => delay::fdn(instr, out, inputs, ctx),

        Chorus => effect::mod_delay(instr, out, inputs, ctx, effect::ModKind::Chorus),
        Flanger => effect::mod_delay(instr, out, inputs, ctx, effect::ModKind::Flanger),
        Phaser => effect::phaser(instr, out, inputs, ctx),
        Comb => effect::comb(instr, out, inputs, ctx),
        DistTanh | DistSoftClip | DistTube | DistTransformer | Exciter => {
            effect::waveshape(instr.opcode, out, inputs)
        }
        DistWavefold => effect::wavefold_adaa(instr, out, inputs, ctx),
        DistTape => effect::tape(instr, out, inputs, ctx),
        RingMod => effect::ring_mod(out, inputs),
        Bitcrush => effect::bitcrush(instr, out, inputs, ctx),

        Clock => sequence::clock(instr, out, ctx),
        Lfo => sequence::lfo(instr, out, inputs, ctx),
        SeqStep => sequence::seq_step(instr, out, ctx),
        Euclid => sequence::euclid(instr, out, inputs, ctx),
        Trigger => sequence::trigger(instr, out, inputs, ctx),
        Timeline => sequence::timeline(instr, out, ctx),

        Compressor => dynamics::compressor(instr, out, inputs, ctx),
        Limiter => dynamics::limiter(instr, out, inputs, ctx),
        Gate => dynamics::gate(instr, out, inputs, ctx),

        OscSawBlep | OscSqrBlep | OscTriBlep | OscPwmBlep => {
            polyblep::blep_osc(instr, out, inputs, ctx)
        }
        OscSawMinblep => polyblep::minblep_saw(instr, out, inputs, ctx),
        OscSawBlep2x => polyblep::oversampled_saw(instr, out, inputs, ctx, 2),
        OscSawBlep4x => polyblep::oversampled_saw(instr, out, inputs, ctx, 4),
        OscSqrBlep4x => polyblep::oversampled_square(instr, out, inputs, ctx, 4),
    }
}
