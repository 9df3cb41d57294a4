//! The VM: block-rate execution of compiled DSP programs
//!
//! `SynthVm` owns the register file, state pool, audio arena, swap
//! controller, and crossfader, and drives them once per audio block:
//!
//! 1. Promote a pending program swap (block boundaries only).
//! 2. Advance host parameters one interpolation block.
//! 3. Execute the current program - or, mid-crossfade, both programs into
//!    scratch pairs mixed with equal-power gains.
//! 4. Advance and collect the state pool's fading compartment.
//! 5. Advance the block and sample counters.
//!
//! After construction nothing on this path allocates, locks, or syscalls;
//! the producer-facing surface (`load_program`, `set_param`) is thread-safe
//! through the handle type.

use std::sync::Arc;

use tracing::debug;

use crate::buffer_pool::{Block, BufferPool};
use crate::constants::{
    ARENA_SAMPLES, BLOCK_SIZE, DEFAULT_CROSSFADE_BLOCKS, MAX_STATES,
};
use crate::context::ExecutionContext;
use crate::crossfade::{mix_equal_power, Crossfader};
use crate::instruction::Opcode;
use crate::kernels::{self, KernelCtx};
use crate::param_map::ParamMap;
use crate::program::{decode_program, LoadResult, ProgramSignature, SlotData, StateInit};
use crate::sample_bank::SampleBank;
use crate::state_pool::StatePool;
use crate::swap_controller::SwapController;
use crate::arena::AudioArena;

/// Options for [`SynthVm::seek`] / [`SynthVm::seek_samples`]
#[derive(Debug, Clone, Copy)]
pub struct SeekOptions {
    /// Zero filter memory and delay lines at the target position
    pub reset_history_dependent: bool,
    /// Silent blocks to run before audible output resumes, letting feedback
    /// paths reach steady state
    pub preroll_blocks: u32,
}

impl Default for SeekOptions {
    fn default() -> Self {
        SeekOptions {
            reset_history_dependent: true,
            preroll_blocks: 0,
        }
    }
}

/// The execution core: everything the audio thread mutates while running a
/// program. Split from the handle fields so a slot payload borrowed from the
/// controller can be executed against `&mut` core state.
struct ExecCore {
    buffers: BufferPool,
    states: StatePool,
    arena: AudioArena,
    timing: ExecutionContext,
}

impl ExecCore {
    /// Execute one program into a stereo output pair
    fn execute_program(
        &mut self,
        data: &SlotData,
        params: &ParamMap,
        samples: &SampleBank,
        out_l: &mut Block,
        out_r: &mut Block,
    ) {
        self.states.begin_frame();
        let mut wrote_l = false;
        let mut wrote_r = false;

        for instr in &data.instructions {
            if instr.opcode == Opcode::Output {
                let src = instr.inputs[0];
                if src == crate::constants::BUFFER_UNUSED {
                    continue;
                }
                let source = self.buffers.block(src);
                if instr.packed_const() == 0 {
                    out_l.copy_from_slice(source);
                    wrote_l = true;
                } else {
                    out_r.copy_from_slice(source);
                    wrote_r = true;
                }
                continue;
            }

            let (out_block, input_views) = self.buffers.instr_views(instr.out_buffer, &instr.inputs);
            let mut ctx = KernelCtx {
                timing: &self.timing,
                states: &mut self.states,
                arena: &mut self.arena,
                params,
                samples,
            };
            kernels::execute(instr, out_block, &input_views, &mut ctx);
        }

        // one written channel serves both; none means silence
        match (wrote_l, wrote_r) {
            (true, false) => out_r.copy_from_slice(out_l),
            (false, true) => out_l.copy_from_slice(out_r),
            (false, false) => {
                out_l.fill(0.0);
                out_r.fill(0.0);
            }
            (true, true) => {}
        }
    }
}

pub struct SynthVm {
    controller: Arc<SwapController>,
    params: Arc<ParamMap>,
    samples: Arc<SampleBank>,
    core: ExecCore,
    fader: Crossfader,
    crossfade_blocks: u32,
    // crossfade scratch pairs
    old_l: Block,
    old_r: Block,
    new_l: Block,
    new_r: Block,
}

impl SynthVm {
    pub fn new() -> Self {
        SynthVm {
            controller: Arc::new(SwapController::new(ARENA_SAMPLES)),
            params: Arc::new(ParamMap::new()),
            samples: Arc::new(SampleBank::new()),
            core: ExecCore {
                buffers: BufferPool::new(),
                states: StatePool::new(),
                arena: AudioArena::new(ARENA_SAMPLES),
                timing: ExecutionContext::default(),
            },
            fader: Crossfader::default(),
            crossfade_blocks: DEFAULT_CROSSFADE_BLOCKS,
            old_l: [0.0; BLOCK_SIZE],
            old_r: [0.0; BLOCK_SIZE],
            new_l: [0.0; BLOCK_SIZE],
            new_r: [0.0; BLOCK_SIZE],
        }
    }

    // ---- configuration ----------------------------------------------------

    pub fn set_sample_rate(&mut self, hz: f32) {
        self.core.timing.set_sample_rate(hz);
        self.params.set_sample_rate(hz);
        self.controller.set_sample_rate(hz);
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        self.core.timing.set_bpm(bpm);
    }

    pub fn set_crossfade_blocks(&mut self, blocks: u32) {
        self.crossfade_blocks = blocks.clamp(
            crate::constants::MIN_CROSSFADE_BLOCKS,
            crate::constants::MAX_CROSSFADE_BLOCKS,
        );
    }

    /// Blocks an orphaned state spends fading after a structural swap
    pub fn set_state_fade_blocks(&mut self, blocks: u16) {
        self.core.states.set_fade_blocks(blocks);
    }

    /// Producer-side handle for compiler / UI threads
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            controller: Arc::clone(&self.controller),
            params: Arc::clone(&self.params),
            samples: Arc::clone(&self.samples),
        }
    }

    /// The host-populated sample bank
    pub fn sample_bank(&self) -> Arc<SampleBank> {
        Arc::clone(&self.samples)
    }

    // ---- program loading --------------------------------------------------

    /// Thread-safe program load (swap takes effect at the next block start)
    pub fn load_program(&self, bytecode: &[u8]) -> LoadResult {
        self.controller.load_program(bytecode, Vec::new())
    }

    /// Program load with the state-initialization side channel
    pub fn load_program_with_state(&self, bytecode: &[u8], inits: Vec<StateInit>) -> LoadResult {
        self.controller.load_program(bytecode, inits)
    }

    /// Initialization-only load: resets all state and replaces the current
    /// program directly, bypassing the crossfade path. Must not be called
    /// while `process_block` runs on another thread.
    pub fn load_program_immediate(&mut self, bytecode: &[u8]) -> bool {
        self.load_program_immediate_with_state(bytecode, Vec::new())
    }

    pub fn load_program_immediate_with_state(
        &mut self,
        bytecode: &[u8],
        inits: Vec<StateInit>,
    ) -> bool {
        let Ok(instructions) = decode_program(bytecode) else {
            return false;
        };
        if ProgramSignature::of(&instructions).state_id_count as usize > MAX_STATES {
            return false;
        }
        self.core.states.reset();
        self.core.arena.reset();
        self.core.buffers.clear_all();
        self.fader.complete();
        self.controller.install_immediate(&instructions, Vec::new());
        self.apply_inits(&inits);
        true
    }

    /// Legacy explicit-scope swap API: `begin` confirms a write slot is
    /// free, `end` performs the load
    pub fn hot_swap_begin(&self) -> bool {
        self.controller
            .slot_states()
            .iter()
            .any(|s| *s == crate::program::SlotState::Empty)
    }

    pub fn hot_swap_end(&self, bytecode: &[u8]) -> LoadResult {
        self.load_program(bytecode)
    }

    // ---- parameters -------------------------------------------------------

    pub fn set_param(&self, name: &str, value: f32) -> bool {
        self.params.set(name, value, None)
    }

    pub fn set_param_slewed(&self, name: &str, value: f32, slew_ms: f32) -> bool {
        self.params.set(name, value, Some(slew_ms))
    }

    pub fn remove_param(&self, name: &str) {
        self.params.remove(name);
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.has(name)
    }

    // ---- the audio callback ----------------------------------------------

    /// Process one stereo block; the audio thread's only entry point
    pub fn process_block(&mut self, out_l: &mut Block, out_r: &mut Block) {
        if self.controller.has_pending_swap() {
            self.handle_swap();
        }
        self.params.update_interpolation_block();

        if self.fader.is_engaged() {
            let (start, end) = self.fader.advance();

            match self.controller.previous_data() {
                Some(previous) => self.core.execute_program(
                    previous,
                    &self.params,
                    &self.samples,
                    &mut self.old_l,
                    &mut self.old_r,
                ),
                None => {
                    self.old_l.fill(0.0);
                    self.old_r.fill(0.0);
                }
            }
            match self.controller.current_data() {
                Some(current) => self.core.execute_program(
                    current,
                    &self.params,
                    &self.samples,
                    &mut self.new_l,
                    &mut self.new_r,
                ),
                None => {
                    self.new_l.fill(0.0);
                    self.new_r.fill(0.0);
                }
            }
            mix_equal_power(
                out_l, out_r, &self.old_l, &self.old_r, &self.new_l, &self.new_r, start, end,
            );

            if self.fader.is_completing() {
                self.controller.release_previous();
                self.fader.complete();
                // the outgoing program resurrected its states all through
                // the fade; now that it is gone, sweep the true orphans
                // into the fading compartment
                self.core.states.begin_frame();
                if let Some(current) = self.controller.current_data() {
                    self.core.states.seed_touched(&current.state_ids);
                }
                self.core.states.gc_sweep();
            }
        } else {
            match self.controller.current_data() {
                Some(current) => {
                    self.core
                        .execute_program(current, &self.params, &self.samples, out_l, out_r)
                }
                None => {
                    out_l.fill(0.0);
                    out_r.fill(0.0);
                }
            }
        }

        self.core.states.advance_fading();
        self.core.states.gc_fading();
        self.core.timing.advance_block();
    }

    /// Promote a pending swap and prepare state continuity
    ///
    /// Structurally equal programs preserve state with no further work.
    /// Otherwise the touched set is seeded from the incoming program's ID
    /// list and swept *before* its first execution, so only truly orphaned
    /// states migrate to the fading compartment; the crossfader engages iff
    /// the dag hashes differ and the outgoing program was non-empty.
    fn handle_swap(&mut self) {
        let outgoing: Option<(ProgramSignature, bool)> = self
            .controller
            .current_data()
            .map(|d| (d.signature, !d.is_empty()));

        if !self.controller.execute_swap() {
            return;
        }
        let Some(incoming_sig) = self.controller.current_data().map(|d| d.signature) else {
            return;
        };

        match outgoing {
            Some((old_sig, _)) if old_sig == incoming_sig => {
                // pure state preservation; the touched set keeps matching
                // IDs alive on the next frame
            }
            Some((old_sig, old_nonempty)) => {
                // seeded sweep before the new program's first execution
                self.core.states.begin_frame();
                if let Some(incoming) = self.controller.current_data() {
                    self.core.states.seed_touched(&incoming.state_ids);
                }
                self.core.states.gc_sweep();

                if Self::requires_crossfade(&old_sig, &incoming_sig) && old_nonempty {
                    self.fader.begin(self.crossfade_blocks);
                }
            }
            None => {
                // first program: nothing to sweep, nothing to fade from
            }
        }

        // without a crossfade the demoted slot has no reader; release it now
        // so two slots stay free for the producer
        if !self.fader.is_engaged() {
            self.controller.release_previous();
        }

        // the init side channel applies between the swap and first execution
        if let Some(incoming) = self.controller.current_data() {
            for init in &incoming.inits {
                match init {
                    StateInit::SeqTable { state_id, events } => {
                        self.core.states.init_seq_table(*state_id, events);
                    }
                    StateInit::Timeline { state_id, points } => {
                        self.core.states.init_timeline(*state_id, points);
                    }
                }
            }
        }
    }

    fn apply_inits(&mut self, inits: &[StateInit]) {
        for init in inits {
            match init {
                StateInit::SeqTable { state_id, events } => {
                    self.core.states.init_seq_table(*state_id, events);
                }
                StateInit::Timeline { state_id, points } => {
                    self.core.states.init_timeline(*state_id, points);
                }
            }
        }
    }

    /// True iff both programs are non-empty and their dag hashes differ;
    /// counts alone are insufficient - a dag-hash match implies topological
    /// identity by construction
    fn requires_crossfade(old: &ProgramSignature, new: &ProgramSignature) -> bool {
        old.instruction_count > 0 && new.instruction_count > 0 && old.dag_hash != new.dag_hash
    }

    // ---- transport --------------------------------------------------------

    /// Jump to an absolute beat position
    pub fn seek(&mut self, beat_position: f64, options: SeekOptions) {
        self.core.timing.seek_beats(beat_position);
        self.finish_seek(options);
    }

    /// Jump to an absolute sample position
    pub fn seek_samples(&mut self, sample_position: u64, options: SeekOptions) {
        self.core.timing.seek_samples(sample_position);
        self.finish_seek(options);
    }

    fn finish_seek(&mut self, options: SeekOptions) {
        if options.reset_history_dependent {
            self.core.states.reset_history();
            self.core.arena.zero_used();
        }
        if options.preroll_blocks > 0 {
            debug!(blocks = options.preroll_blocks, "seek preroll");
            let mut scratch_l = [0.0; BLOCK_SIZE];
            let mut scratch_r = [0.0; BLOCK_SIZE];
            let origin = self.core.timing.global_sample;
            for _ in 0..options.preroll_blocks {
                self.process_block(&mut scratch_l, &mut scratch_r);
            }
            // preroll warms feedback lines without moving the timeline
            self.core.timing.seek_samples(origin);
        }
    }

    /// Full reset to the just-constructed state (sample rate and BPM are
    /// kept; they are configuration, not state)
    pub fn reset(&mut self) {
        self.controller.reset();
        self.core.states.reset();
        self.core.arena.reset();
        self.core.buffers.clear_all();
        self.params.reset();
        self.fader.complete();
        self.core.timing.seek_samples(0);
        self.core.timing.block_count = 0;
    }

    // ---- queries ----------------------------------------------------------

    pub fn is_crossfading(&self) -> bool {
        self.fader.is_engaged()
    }

    pub fn crossfade_position(&self) -> f32 {
        self.fader.position()
    }

    pub fn has_program(&self) -> bool {
        self.controller
            .current_data()
            .map(|d| !d.is_empty())
            .unwrap_or(false)
    }

    pub fn swap_count(&self) -> u64 {
        self.controller.swap_count()
    }

    pub fn current_beat_position(&self) -> f64 {
        self.core.timing.beat_position
    }

    pub fn current_sample_position(&self) -> u64 {
        self.core.timing.global_sample
    }

    pub fn active_states(&self) -> usize {
        self.core.states.active_count()
    }

    pub fn fading_states(&self) -> usize {
        self.core.states.fading_count()
    }

    pub fn arena_used(&self) -> usize {
        self.core.arena.used()
    }

    /// Per-state fade gain query (1.0 active / decaying / 0.0)
    pub fn state_fade_gain(&self, state_id: u32) -> f32 {
        self.core.states.fade_gain(state_id)
    }

    /// True if the state pool ever overflowed into its scratch fallback
    /// (e.g. a crossfade between two near-capacity programs); cleared by
    /// `reset`. A host seeing this should reduce patch size.
    pub fn state_pool_overflowed(&self) -> bool {
        self.core.states.overflowed()
    }

    /// Compiler-side register allocator access
    pub fn buffer_pool_mut(&mut self) -> &mut BufferPool {
        &mut self.core.buffers
    }
}

impl Default for SynthVm {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheaply cloneable producer-side handle
///
/// Exposes exactly the thread-safe subset of the VM: program loads,
/// parameters, sample installation, and swap observation. A compiler thread
/// holds one of these and never touches the audio-side struct.
#[derive(Clone)]
pub struct EngineHandle {
    controller: Arc<SwapController>,
    params: Arc<ParamMap>,
    samples: Arc<SampleBank>,
}

impl EngineHandle {
    pub fn load_program(&self, bytecode: &[u8]) -> LoadResult {
        self.controller.load_program(bytecode, Vec::new())
    }

    pub fn load_program_with_state(&self, bytecode: &[u8], inits: Vec<StateInit>) -> LoadResult {
        self.controller.load_program(bytecode, inits)
    }

    pub fn set_param(&self, name: &str, value: f32) -> bool {
        self.params.set(name, value, None)
    }

    pub fn set_param_slewed(&self, name: &str, value: f32, slew_ms: f32) -> bool {
        self.params.set(name, value, Some(slew_ms))
    }

    pub fn remove_param(&self, name: &str) {
        self.params.remove(name);
    }

    pub fn insert_sample(&self, slot: usize, data: Arc<crate::sample_bank::SampleData>) {
        self.samples.insert(slot, data);
    }

    /// Completed-swap counter; lets a producer confirm a program went live
    pub fn swap_count(&self) -> u64 {
        self.controller.swap_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{pack_rate, Instruction};
    use crate::program::encode_program;

    fn stereo_const_program(value: f32) -> Vec<u8> {
        encode_program(&[
            Instruction::new(Opcode::PushConst, 0).with_const(value),
            Instruction::new(Opcode::Output, 0)
                .with_inputs(&[0])
                .with_rate(pack_rate(false, 0)),
            Instruction::new(Opcode::Output, 0)
                .with_inputs(&[0])
                .with_rate(pack_rate(false, 1)),
        ])
    }

    fn sine_program(freq: f32, state_id: u32) -> Vec<u8> {
        encode_program(&[
            Instruction::new(Opcode::PushConst, 0).with_const(freq),
            Instruction::new(Opcode::OscSin, 1)
                .with_inputs(&[0])
                .with_state(state_id),
            Instruction::new(Opcode::Output, 1).with_inputs(&[1]),
        ])
    }

    fn run_block(vm: &mut SynthVm) -> (Block, Block) {
        let mut l = [0.0; BLOCK_SIZE];
        let mut r = [0.0; BLOCK_SIZE];
        vm.process_block(&mut l, &mut r);
        (l, r)
    }

    #[test]
    fn test_empty_engine_outputs_silence() {
        let mut vm = SynthVm::new();
        let (l, r) = run_block(&mut vm);
        assert!(l.iter().all(|&x| x == 0.0));
        assert!(r.iter().all(|&x| x == 0.0));
        assert_eq!(vm.current_sample_position(), BLOCK_SIZE as u64);
        assert!(!vm.has_program());
    }

    #[test]
    fn test_constant_program_fills_both_channels() {
        let mut vm = SynthVm::new();
        assert_eq!(vm.load_program(&stereo_const_program(0.5)), LoadResult::Success);
        let (l, r) = run_block(&mut vm);
        assert!(l.iter().all(|&x| x == 0.5));
        assert!(r.iter().all(|&x| x == 0.5));
        assert!(vm.has_program());
        assert_eq!(vm.swap_count(), 1);
    }

    #[test]
    fn test_mono_output_duplicates() {
        let mut vm = SynthVm::new();
        let program = encode_program(&[
            Instruction::new(Opcode::PushConst, 0).with_const(0.25),
            Instruction::new(Opcode::Output, 0).with_inputs(&[0]),
        ]);
        vm.load_program(&program);
        let (l, r) = run_block(&mut vm);
        assert_eq!(l, r);
        assert_eq!(l[0], 0.25);
    }

    #[test]
    fn test_equal_signature_swap_preserves_phase() {
        let mut vm = SynthVm::new();
        vm.load_program(&sine_program(440.0, 0xaa));
        for _ in 0..10 {
            run_block(&mut vm);
        }
        // same state ID, different constant: same dag hash, no crossfade
        vm.load_program(&sine_program(440.0, 0xaa));
        let before = match vm.core.states.get(0xaa) {
            Some(crate::state_pool::DspState::Phase { phase }) => *phase,
            other => panic!("missing oscillator state: {:?}", other),
        };
        run_block(&mut vm);
        assert!(!vm.is_crossfading());
        let after = match vm.core.states.get(0xaa) {
            Some(crate::state_pool::DspState::Phase { phase }) => *phase,
            other => panic!("missing oscillator state: {:?}", other),
        };
        // phase advanced by exactly one block's worth
        let expected = (before + 440.0 / 48_000.0 * BLOCK_SIZE as f64).fract();
        assert!(
            (after - expected).abs() < 1e-9,
            "phase discontinuity across swap: {} vs {}",
            after,
            expected
        );
    }

    #[test]
    fn test_structural_swap_engages_crossfade() {
        let mut vm = SynthVm::new();
        vm.set_crossfade_blocks(3);
        vm.load_program(&sine_program(440.0, 1));
        for _ in 0..5 {
            run_block(&mut vm);
        }
        vm.load_program(&sine_program(880.0, 2));
        run_block(&mut vm);
        assert!(vm.is_crossfading());
        run_block(&mut vm);
        run_block(&mut vm);
        assert!(!vm.is_crossfading(), "fade must end after 3 blocks");
        assert_eq!(vm.swap_count(), 2);
    }

    #[test]
    fn test_first_program_load_does_not_crossfade() {
        let mut vm = SynthVm::new();
        vm.load_program(&sine_program(440.0, 1));
        run_block(&mut vm);
        assert!(!vm.is_crossfading());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut vm = SynthVm::new();
        vm.load_program(&sine_program(440.0, 1));
        for _ in 0..4 {
            run_block(&mut vm);
        }
        vm.reset();
        let snapshot = (
            vm.has_program(),
            vm.current_sample_position(),
            vm.active_states(),
            vm.swap_count(),
        );
        vm.reset();
        let again = (
            vm.has_program(),
            vm.current_sample_position(),
            vm.active_states(),
            vm.swap_count(),
        );
        assert_eq!(snapshot, again);
        assert!(!snapshot.0);
        assert_eq!(snapshot.1, 0);
    }

    #[test]
    fn test_seek_moves_the_beat_clock() {
        let mut vm = SynthVm::new();
        vm.seek(8.0, SeekOptions::default());
        assert!((vm.current_beat_position() - 8.0).abs() < 1e-6);
        // preroll must not move the timeline
        vm.seek(
            4.0,
            SeekOptions {
                reset_history_dependent: false,
                preroll_blocks: 3,
            },
        );
        assert!((vm.current_beat_position() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_handle_loads_from_another_thread() {
        let mut vm = SynthVm::new();
        let handle = vm.handle();
        let worker = std::thread::spawn(move || handle.load_program(&sine_program(440.0, 3)));
        assert_eq!(worker.join().unwrap(), LoadResult::Success);
        run_block(&mut vm);
        assert!(vm.has_program());
    }

    #[test]
    fn test_determinism_two_instances() {
        let render = || {
            let mut vm = SynthVm::new();
            vm.load_program(&sine_program(777.0, 9));
            let mut collected = Vec::new();
            for _ in 0..20 {
                let (l, _) = run_block(&mut vm);
                collected.extend_from_slice(&l);
            }
            collected
        };
        assert_eq!(render(), render(), "two engines fed the same history diverged");
    }
}
