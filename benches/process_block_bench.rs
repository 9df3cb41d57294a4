//! Criterion benchmark for the audio hot path
//!
//! Measures `process_block` against patches of increasing weight, plus the
//! worst case: a block in the middle of a structural crossfade, where both
//! programs execute.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use magnon::builder::ProgramBuilder;
use magnon::constants::BLOCK_SIZE;
use magnon::instruction::Opcode;
use magnon::vm::SynthVm;

fn simple_patch() -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let freq = b.konst(440.0).unwrap();
    let osc = b.stateful(Opcode::OscSin, "osc", &[freq]).unwrap();
    b.stereo_output(osc);
    b.build()
}

fn heavy_patch(osc_name: &str) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let mut voices = Vec::new();
    for v in 0..8 {
        let freq = b.konst(55.0 * (v + 1) as f32).unwrap();
        let osc = b
            .stateful(Opcode::OscSawBlep, &format!("{}/{}", osc_name, v), &[freq])
            .unwrap();
        let cutoff = b.konst(400.0 + 150.0 * v as f32).unwrap();
        let q = b.konst(0.6).unwrap();
        let lp = b
            .stateful(Opcode::MoogLadder, &format!("lpf/{}", v), &[osc, cutoff, q])
            .unwrap();
        voices.push(lp);
    }
    let mut mix = voices[0];
    for &v in &voices[1..] {
        mix = b.op(Opcode::Add, &[mix, v]).unwrap();
    }
    let gain = b.konst(0.125).unwrap();
    let scaled = b.op(Opcode::Mul, &[mix, gain]).unwrap();
    let verbed = b.stateful(Opcode::ReverbFreeverb, "verb", &[scaled]).unwrap();
    b.stereo_output(verbed);
    b.build()
}

fn bench_process_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_block");

    group.bench_function("sine", |bench| {
        let mut vm = SynthVm::new();
        vm.load_program(&simple_patch());
        let mut l = [0.0f32; BLOCK_SIZE];
        let mut r = [0.0f32; BLOCK_SIZE];
        vm.process_block(&mut l, &mut r);
        bench.iter(|| {
            vm.process_block(black_box(&mut l), black_box(&mut r));
        });
    });

    group.bench_function("eight_voices_ladder_reverb", |bench| {
        let mut vm = SynthVm::new();
        vm.load_program(&heavy_patch("bank"));
        let mut l = [0.0f32; BLOCK_SIZE];
        let mut r = [0.0f32; BLOCK_SIZE];
        for _ in 0..4 {
            vm.process_block(&mut l, &mut r);
        }
        bench.iter(|| {
            vm.process_block(black_box(&mut l), black_box(&mut r));
        });
    });

    group.bench_function("mid_crossfade_both_programs", |bench| {
        bench.iter_with_setup(
            || {
                let mut vm = SynthVm::new();
                let mut l = [0.0f32; BLOCK_SIZE];
                let mut r = [0.0f32; BLOCK_SIZE];
                vm.set_crossfade_blocks(5);
                vm.load_program(&heavy_patch("bank-a"));
                for _ in 0..4 {
                    vm.process_block(&mut l, &mut r);
                }
                vm.load_program(&heavy_patch("bank-b"));
                vm.process_block(&mut l, &mut r); // enter the fade
                vm
            },
            |mut vm| {
                let mut l = [0.0f32; BLOCK_SIZE];
                let mut r = [0.0f32; BLOCK_SIZE];
                vm.process_block(black_box(&mut l), black_box(&mut r));
            },
        );
    });

    group.finish();
}

criterion_group!(benches, bench_process_block);
criterion_main!(benches);
