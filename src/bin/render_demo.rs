//! Render a short demo performance to a WAV file
//!
//! Builds a small acid line by hand (sequenced square bass through the diode
//! ladder, plus a euclidean hat from filtered noise), hot-swaps the patch
//! twice mid-render to show the crossfade, and writes the result to
//! `magnon_demo.wav`.
//!
//! Usage: `cargo run --bin render_demo [seconds]`

use magnon::analysis;
use magnon::builder::ProgramBuilder;
use magnon::constants::BLOCK_SIZE;
use magnon::instruction::Opcode;
use magnon::program::SeqEvent;
use magnon::vm::SynthVm;

fn acid_patch(
    cutoff_hz: f32,
    fold_name: &str,
) -> Result<(Vec<u8>, Vec<magnon::StateInit>), String> {
    let mut b = ProgramBuilder::new();

    // sequenced bass line: SEQ_STEP value mode feeds MTOF
    let note = b.stateful_shaped(Opcode::SeqStep, "bass/seq", &[], 1)?;
    let freq = b.op(Opcode::Mtof, &[note])?;
    let osc = b.stateful(Opcode::OscSawBlep, "bass/osc", &[freq])?;

    // envelope gated by the same table in gate mode (half-step duty)
    let gate = b.stateful_shaped(Opcode::SeqStep, "bass/gate", &[], 3)?;
    let attack = b.konst(0.003)?;
    let release = b.konst(0.18)?;
    let env = b.stateful(Opcode::EnvAr, "bass/env", &[gate, attack, release])?;

    // envelope sweeps the diode ladder
    let depth = b.konst(cutoff_hz)?;
    let sweep = b.op(Opcode::Mul, &[env, depth])?;
    let floor = b.konst(120.0)?;
    let cutoff = b.op(Opcode::Add, &[sweep, floor])?;
    let res = b.konst(0.82)?;
    let filtered = b.stateful(Opcode::DiodeLadder, "bass/vcf", &[osc, cutoff, res])?;
    let shaped = b.stateful(Opcode::DistWavefold, fold_name, &[filtered])?;
    let voiced = b.op(Opcode::Mul, &[shaped, env])?;

    // euclidean hat: 5-in-16 noise bursts
    let k = b.konst(5.0)?;
    let n = b.konst(16.0)?;
    let r = b.konst(2.0)?;
    let hat_trig = b.stateful(Opcode::Euclid, "hat/euclid", &[k, n, r])?;
    let hat_attack = b.konst(0.001)?;
    let hat_release = b.konst(0.04)?;
    let hat_env = b.stateful(Opcode::EnvAr, "hat/env", &[hat_trig, hat_attack, hat_release])?;
    let noise = b.stateful(Opcode::Noise, "hat/noise", &[])?;
    let hat_cut = b.konst(6_000.0)?;
    let hat_q = b.konst(1.2)?;
    let hat = b.stateful(Opcode::SvfHp, "hat/hpf", &[noise, hat_cut, hat_q])?;
    let hat_gain = b.konst(0.25)?;
    let hat_sig = b.op(Opcode::Mul, &[hat, hat_env])?;
    let hat_out = b.op(Opcode::Mul, &[hat_sig, hat_gain])?;

    let mix = b.op(Opcode::Add, &[voiced, hat_out])?;
    let master = b.konst(0.8)?;
    let out = b.op(Opcode::Mul, &[mix, master])?;
    let limited = b.stateful(Opcode::Limiter, "master/limit", &[out])?;
    b.stereo_output(limited);

    let line = [
        (0.0, 33.0, 1.0),
        (0.5, 33.0, 0.7),
        (1.0, 45.0, 1.0),
        (1.75, 31.0, 0.9),
        (2.0, 33.0, 1.0),
        (2.5, 36.0, 0.8),
        (3.0, 33.0, 1.0),
        (3.5, 40.0, 0.9),
    ];
    let events: Vec<SeqEvent> = line
        .iter()
        .map(|&(time, value, velocity)| SeqEvent {
            time,
            value,
            velocity,
        })
        .collect();
    b.seq_table("bass/seq", &events);
    b.seq_table("bass/gate", &events);

    Ok(b.build_with_state())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let seconds: f32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8.0);
    let sample_rate = 48_000.0f32;

    let mut vm = SynthVm::new();
    vm.set_sample_rate(sample_rate);
    vm.set_bpm(132.0);
    vm.set_crossfade_blocks(4);

    let (bytes, inits) = acid_patch(2_400.0, "bass/fold")?;
    vm.load_program_with_state(&bytes, inits);

    let total_blocks = (seconds * sample_rate) as usize / BLOCK_SIZE;
    let mut left = Vec::with_capacity(total_blocks * BLOCK_SIZE);
    let mut right = Vec::with_capacity(total_blocks * BLOCK_SIZE);

    for block in 0..total_blocks {
        // live-coding moments: reshape the patch mid-render
        if block == total_blocks / 3 {
            // same node names: silent swap with full state continuity
            let (bytes, inits) = acid_patch(4_800.0, "bass/fold")?;
            vm.load_program_with_state(&bytes, inits);
        }
        if block == 2 * total_blocks / 3 {
            // the fold node is renamed: structural change, crossfaded
            let (bytes, inits) = acid_patch(3_200.0, "bass/fold-hot")?;
            vm.load_program_with_state(&bytes, inits);
        }

        let mut l = [0.0f32; BLOCK_SIZE];
        let mut r = [0.0f32; BLOCK_SIZE];
        vm.process_block(&mut l, &mut r);
        left.extend_from_slice(&l);
        right.extend_from_slice(&r);
    }

    tracing::info!(
        blocks = total_blocks,
        rms = analysis::rms(&left),
        peak = analysis::peak(&left),
        swaps = vm.swap_count(),
        "render finished"
    );

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: sample_rate as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create("magnon_demo.wav", spec)?;
    for (l, r) in left.iter().zip(right.iter()) {
        writer.write_sample((l.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        writer.write_sample((r.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    println!("wrote magnon_demo.wav ({:.1} s)", seconds);
    Ok(())
}
