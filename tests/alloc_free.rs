//! Allocation-free processing
//!
//! A counting wrapper around the system allocator proves the real-time
//! contract: after construction and program warmup, `process_block`
//! performs zero heap allocations - including across hot-swaps, crossfades,
//! state GC, and parameter churn. (Producer-side calls may allocate; that
//! is their job.)

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use magnon::builder::ProgramBuilder;
use magnon::constants::BLOCK_SIZE;
use magnon::instruction::Opcode;
use magnon::vm::SynthVm;

struct CountingAllocator {
    allocations: AtomicU64,
    armed: AtomicBool,
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if self.armed.load(Ordering::Relaxed) {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator {
    allocations: AtomicU64::new(0),
    armed: AtomicBool::new(false),
};

fn counted<R>(f: impl FnOnce() -> R) -> (R, u64) {
    ALLOCATOR.allocations.store(0, Ordering::SeqCst);
    ALLOCATOR.armed.store(true, Ordering::SeqCst);
    let result = f();
    ALLOCATOR.armed.store(false, Ordering::SeqCst);
    (result, ALLOCATOR.allocations.load(Ordering::SeqCst))
}

fn rich_patch(osc_name: &str) -> Vec<u8> {
    let mut b = ProgramBuilder::new();
    let freq = b.konst(220.0).unwrap();
    let osc = b.stateful(Opcode::OscSawBlep, osc_name, &[freq]).unwrap();
    let cutoff = b.env_param("cutoff", None).unwrap();
    let q = b.konst(0.8).unwrap();
    let lp = b.stateful(Opcode::MoogLadder, "lpf", &[osc, cutoff, q]).unwrap();
    let time = b.konst(0.3).unwrap();
    let fb = b.konst(0.4).unwrap();
    let del = b.stateful(Opcode::Delay, "echo", &[lp, time, fb]).unwrap();
    let mixed = b.op(Opcode::Add, &[lp, del]).unwrap();
    let verbed = b.stateful(Opcode::ReverbFreeverb, "verb", &[mixed]).unwrap();
    b.stereo_output(verbed);
    b.build()
}

#[test]
fn process_block_does_not_allocate() {
    let mut vm = SynthVm::new();
    vm.set_param_slewed("cutoff", 900.0, 10.0);
    vm.load_program(&rich_patch("osc"));

    let mut l = [0.0f32; BLOCK_SIZE];
    let mut r = [0.0f32; BLOCK_SIZE];

    // warmup: program promotion, arena claims, state creation
    for _ in 0..8 {
        vm.process_block(&mut l, &mut r);
    }

    let (_, allocations) = counted(|| {
        for _ in 0..64 {
            vm.process_block(&mut l, &mut r);
        }
    });
    assert_eq!(
        allocations, 0,
        "steady-state process_block must not touch the heap"
    );
}

#[test]
fn hot_swap_path_does_not_allocate_on_the_audio_thread() {
    let mut vm = SynthVm::new();
    vm.load_program(&rich_patch("osc"));
    let mut l = [0.0f32; BLOCK_SIZE];
    let mut r = [0.0f32; BLOCK_SIZE];
    for _ in 0..8 {
        vm.process_block(&mut l, &mut r);
    }

    // producer side allocates freely - before the counter is armed
    let replacement = rich_patch("osc-2"); // structural: forces a crossfade
    vm.load_program(&replacement);

    let (_, allocations) = counted(|| {
        // swap promotion, seeded sweep, crossfade, release, post-fade GC
        for _ in 0..32 {
            vm.process_block(&mut l, &mut r);
        }
    });
    assert_eq!(
        allocations, 0,
        "swap handling on the audio thread must not allocate"
    );
}
