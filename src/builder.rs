//! Producer-side program builder
//!
//! The minimal "compiler" the tests and demos need: allocates registers from
//! a buffer-pool allocator, emits packed instructions in dependency order,
//! and collects state-init records for the load-time side channel. This is
//! not a language front-end - callers wire opcodes by hand - but it is the
//! reference producer for the bytecode format.
//!
//! Semantic IDs are FNV-1a hashes of caller-chosen node names, the same
//! scheme a real front-end uses for its node paths, so state identity
//! survives across rebuilt programs that keep their names.

use crate::buffer_pool::BufferPool;
use crate::hash::hash_name;
use crate::instruction::{pack_rate, Instruction, Opcode};
use crate::program::{encode_program, SeqEvent, StateInit, TimelinePoint};

pub struct ProgramBuilder {
    registers: BufferPool,
    instructions: Vec<Instruction>,
    inits: Vec<StateInit>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        ProgramBuilder {
            registers: BufferPool::new(),
            instructions: Vec::new(),
            inits: Vec::new(),
        }
    }

    /// Allocate a fresh output register
    pub fn alloc(&mut self) -> Result<u16, String> {
        self.registers.allocate()
    }

    /// Emit a constant; returns its register
    pub fn konst(&mut self, value: f32) -> Result<u16, String> {
        let out = self.alloc()?;
        self.instructions
            .push(Instruction::new(Opcode::PushConst, out).with_const(value));
        Ok(out)
    }

    /// Emit a stateless operation; returns its output register
    pub fn op(&mut self, opcode: Opcode, inputs: &[u16]) -> Result<u16, String> {
        let out = self.alloc()?;
        self.instructions
            .push(Instruction::new(opcode, out).with_inputs(inputs));
        Ok(out)
    }

    /// Emit a stateful operation whose identity is the hash of `name`
    pub fn stateful(&mut self, opcode: Opcode, name: &str, inputs: &[u16]) -> Result<u16, String> {
        let out = self.alloc()?;
        self.instructions.push(
            Instruction::new(opcode, out)
                .with_inputs(inputs)
                .with_state(hash_name(name)),
        );
        Ok(out)
    }

    /// As [`ProgramBuilder::stateful`] with a packed rate-byte constant
    /// (LFO shape, sequencer mode, clock divisor)
    pub fn stateful_shaped(
        &mut self,
        opcode: Opcode,
        name: &str,
        inputs: &[u16],
        shape: u8,
    ) -> Result<u16, String> {
        let out = self.alloc()?;
        self.instructions.push(
            Instruction::new(opcode, out)
                .with_inputs(inputs)
                .with_state(hash_name(name))
                .with_rate(pack_rate(false, shape)),
        );
        Ok(out)
    }

    /// Read a named host parameter with a fallback register
    pub fn env_param(&mut self, name: &str, fallback: Option<u16>) -> Result<u16, String> {
        let out = self.alloc()?;
        let mut instr = Instruction::new(Opcode::EnvGet, out).with_state(hash_name(name));
        if let Some(reg) = fallback {
            instr = instr.with_inputs(&[reg]);
        }
        self.instructions.push(instr);
        Ok(out)
    }

    /// Route a register to output channel 0 (left) or 1 (right)
    pub fn output(&mut self, source: u16, channel: u8) {
        self.instructions.push(
            Instruction::new(Opcode::Output, source)
                .with_inputs(&[source])
                .with_rate(pack_rate(false, channel.min(1))),
        );
    }

    /// Route a register to both channels
    pub fn stereo_output(&mut self, source: u16) {
        self.output(source, 0);
        self.output(source, 1);
    }

    /// Attach a sequencer event table to a named SEQ_STEP instance
    pub fn seq_table(&mut self, name: &str, events: &[SeqEvent]) {
        self.inits.push(StateInit::SeqTable {
            state_id: hash_name(name),
            events: events.to_vec(),
        });
    }

    /// Attach a timeline breakpoint table to a named TIMELINE instance
    pub fn timeline_table(&mut self, name: &str, points: &[TimelinePoint]) {
        self.inits.push(StateInit::Timeline {
            state_id: hash_name(name),
            points: points.to_vec(),
        });
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Encode to the flat byte stream
    pub fn build(&self) -> Vec<u8> {
        encode_program(&self.instructions)
    }

    /// Encode plus the state-init side channel
    pub fn build_with_state(&self) -> (Vec<u8>, Vec<StateInit>) {
        (self.build(), self.inits.clone())
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}
