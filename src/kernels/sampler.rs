//! Sampler band (63-69)
//!
//! A 16-voice pool per instance. Rising trigger edges allocate voices
//! round-robin (stealing the oldest slot when all are busy); each voice
//! captures its pitch and sample slot at trigger time and advances a
//! fractional cursor with linear interpolation between frames. Sample data
//! comes from the host-populated bank; an empty slot plays silence.

use crate::buffer_pool::Block;
use crate::constants::{BLOCK_SIZE, MAX_SAMPLER_VOICES};
use crate::instruction::Instruction;
use crate::state_pool::{DspState, StateKind};

use super::{in_sample, Inputs, KernelCtx};

/// SAMPLE_PLAY / SAMPLE_PLAY_LOOP
///
/// Inputs: trigger, pitch (playback rate, default 1.0), sample slot
/// (default 0), gain (default 1.0).
pub(crate) fn play(
    instr: &Instruction,
    out: &mut Block,
    inputs: &Inputs,
    ctx: &mut KernelCtx,
    looped: bool,
) {
    let sr = ctx.timing.sample_rate;
    let state = ctx.states.get_or_create(instr.state_id, StateKind::Sampler);
    let DspState::Sampler {
        voices,
        next,
        prev_trigger,
    } = state
    else {
        return;
    };

    // the bank returns Arc clones; hold them for the block so a host swap
    // mid-block cannot pull data out from under a playing voice
    let mut held: [Option<std::sync::Arc<crate::sample_bank::SampleData>>; MAX_SAMPLER_VOICES] =
        std::array::from_fn(|_| None);

    for i in 0..BLOCK_SIZE {
        let trigger = in_sample(inputs, 0, i, 0.0);
        if trigger > 0.5 && *prev_trigger <= 0.5 {
            let voice = &mut voices[*next as usize % MAX_SAMPLER_VOICES];
            *next = (*next + 1) % MAX_SAMPLER_VOICES as u32;
            voice.active = true;
            voice.pos = 0.0;
            voice.rate = in_sample(inputs, 1, i, 1.0).max(0.0);
            voice.slot = in_sample(inputs, 2, i, 0.0).max(0.0) as u16;
        }
        *prev_trigger = trigger;

        let gain = in_sample(inputs, 3, i, 1.0);
        let mut acc = 0.0;
        for (v, hold) in voices.iter_mut().zip(held.iter_mut()) {
            if !v.active {
                continue;
            }
            if hold.is_none() {
                *hold = ctx.samples.get(v.slot as usize);
            }
            let Some(sample) = hold else {
                v.active = false;
                continue;
            };
            let frames = sample.len_frames();
            if frames < 2 {
                v.active = false;
                continue;
            }
            // rate scales the sample's own rate to the engine rate, so a
            // pitch of 1.0 plays at recorded speed regardless of either
            let step = f64::from(v.rate) * f64::from(sample.root_rate) / f64::from(sr);
            if looped {
                if v.pos >= (frames - 1) as f64 {
                    v.pos %= (frames - 1) as f64;
                }
            } else if v.pos >= (frames - 1) as f64 {
                v.active = false;
                continue;
            }
            acc += sample.frame_lerp(v.pos);
            v.pos += step;
        }
        out[i] = acc * gain;
    }
}
