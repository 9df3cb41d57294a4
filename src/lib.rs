//! # Magnon - a bytecode VM for live-coded audio
//!
//! Magnon executes compiled DSP graphs as register-based bytecode inside a
//! real-time audio callback, and lets a producer thread replace the running
//! program with a new one - no clicks, no audio-thread allocation, and with
//! stateful nodes (oscillator phase, filter memory, delay lines) carried
//! across the swap by semantic identity.
//!
//! ## Core pieces
//!
//! - [`vm::SynthVm`] - the VM: owns everything, drives one stereo block per
//!   `process_block` call
//! - [`swap_controller::SwapController`] - lock-free triple-buffered program
//!   handoff between producer and audio threads
//! - [`state_pool::StatePool`] - fixed-capacity map from 32-bit semantic IDs
//!   to tagged DSP state, with mark-and-sweep GC and fade-out of orphans
//! - [`crossfade::Crossfader`] - equal-power output crossfade over
//!   structural program changes
//! - [`buffer_pool::BufferPool`] - the register file of block-sized buffers
//! - [`kernels`] - the ~90 opcode implementations
//! - [`param_map::ParamMap`] - lock-free name->value registry with
//!   per-sample slew, for host parameter control
//!
//! ## Quick start
//!
//! ```rust
//! use magnon::builder::ProgramBuilder;
//! use magnon::constants::BLOCK_SIZE;
//! use magnon::instruction::Opcode;
//! use magnon::vm::SynthVm;
//!
//! // hand-assemble: saw -> lowpass -> output
//! let mut b = ProgramBuilder::new();
//! let freq = b.konst(110.0).unwrap();
//! let saw = b.stateful(Opcode::OscSawBlep, "bass/osc", &[freq]).unwrap();
//! let cutoff = b.konst(800.0).unwrap();
//! let q = b.konst(2.0).unwrap();
//! let filtered = b.stateful(Opcode::SvfLp, "bass/lpf", &[saw, cutoff, q]).unwrap();
//! b.stereo_output(filtered);
//!
//! let mut vm = SynthVm::new();
//! vm.load_program(&b.build());
//!
//! let mut left = [0.0f32; BLOCK_SIZE];
//! let mut right = [0.0f32; BLOCK_SIZE];
//! vm.process_block(&mut left, &mut right);
//! ```
//!
//! ## Hot-swap
//!
//! Load a new program from any thread while audio runs. Structurally equal
//! programs (same stateful nodes, different constants) swap silently with
//! full state continuity; structural changes crossfade over a few blocks
//! with an equal-power curve, while orphaned states fade out through the
//! state pool's fading compartment.
//!
//! ```rust
//! use magnon::vm::SynthVm;
//!
//! let vm = SynthVm::new();
//! let handle = vm.handle(); // Clone + Send; give it to the compiler thread
//! # drop(handle);
//! ```
//!
//! ## What this crate is not
//!
//! No language front-end, no pattern evaluation, no audio driver, no file
//! I/O. The host compiles bytecode, populates the sample bank, and owns the
//! callback; Magnon is the part in the middle that must never glitch.

pub mod analysis;
pub mod arena;
pub mod buffer_pool;
pub mod builder;
pub mod config;
pub mod constants;
pub mod context;
pub mod crossfade;
pub mod hash;
pub mod instruction;
pub mod kernels;
pub mod param_map;
pub mod program;
pub mod sample_bank;
pub mod state_pool;
pub mod swap_controller;
pub mod vm;

pub use builder::ProgramBuilder;
pub use config::EngineConfig;
pub use instruction::{Instruction, Opcode};
pub use program::{LoadResult, ProgramSignature, SeqEvent, StateInit, TimelinePoint};
pub use vm::{EngineHandle, SeekOptions, SynthVm};
