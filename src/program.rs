//! Program slots, signatures, and the state-initialization side channel
//!
//! A `ProgramSlot` is one compartment of the triple buffer owned by the swap
//! controller. Its payload (instructions, signature, unique state IDs, init
//! records) is written by a producer thread while the slot is `Loading` and
//! read by the audio thread while it is `Active` or `Fading`; the atomic slot
//! state is the only synchronization point.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::constants::{MAX_PROGRAM_SIZE, MAX_SEQ_EVENTS, MAX_TIMELINE_POINTS};
use crate::hash::{fnv1a_fold_u32, fnv1a_seed};
use crate::instruction::{Instruction, INSTRUCTION_SIZE};

/// Result of a producer-side program load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Success,
    /// No free write slot; the producer is over-submitting
    SlotBusy,
    /// Bytecode exceeds `MAX_PROGRAM_SIZE` or arena capacity
    TooLarge,
    /// Bad opcode, out-of-range operand, malformed stream, or bad init table
    InvalidProgram,
    /// More unique state IDs than the state pool holds
    PoolFull,
}

/// Lifecycle state of one triple-buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Loading = 1,
    Ready = 2,
    Active = 3,
    Fading = 4,
}

impl SlotState {
    pub(crate) fn from_u8(v: u8) -> SlotState {
        match v {
            1 => SlotState::Loading,
            2 => SlotState::Ready,
            3 => SlotState::Active,
            4 => SlotState::Fading,
            _ => SlotState::Empty,
        }
    }
}

/// Structural identity of a program
///
/// Two programs are structurally equal iff all three fields match. A matching
/// `dag_hash` alone implies topological identity of the stateful node set, so
/// the crossfade predicate compares only hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramSignature {
    /// FNV-1a over the non-zero semantic state IDs in instruction order
    pub dag_hash: u32,
    pub instruction_count: u32,
    /// Number of unique non-zero state IDs
    pub state_id_count: u32,
}

impl ProgramSignature {
    /// Compute the signature of an instruction sequence
    ///
    /// Immediate payloads (PUSH_CONST, DC, ENV_GET name hashes) share the
    /// state-ID field but do not name persistent state, so only stateful
    /// opcodes contribute.
    pub fn of(instructions: &[Instruction]) -> ProgramSignature {
        let mut hash = fnv1a_seed();
        let mut unique: Vec<u32> = Vec::new();
        for instr in instructions {
            if instr.opcode.is_stateful() && instr.state_id != 0 {
                hash = fnv1a_fold_u32(hash, instr.state_id);
                if !unique.contains(&instr.state_id) {
                    unique.push(instr.state_id);
                }
            }
        }
        ProgramSignature {
            dag_hash: hash,
            instruction_count: instructions.len() as u32,
            state_id_count: unique.len() as u32,
        }
    }
}

/// One `(time, value, velocity)` triple of a sequencer event table
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SeqEvent {
    /// Beat position of the event within its cycle
    pub time: f32,
    pub value: f32,
    pub velocity: f32,
}

/// One breakpoint of a timeline automation table
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimelinePoint {
    /// Beat position of the breakpoint
    pub time: f32,
    pub value: f32,
}

/// Pre-evaluated tables injected alongside bytecode at program-load time
///
/// The front-end evaluates patterns offline; the VM only walks cursors. These
/// records are copied into the slot by the producer and installed into the
/// state pool by the audio thread between the swap and the program's first
/// execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StateInit {
    SeqTable {
        state_id: u32,
        events: Vec<SeqEvent>,
    },
    Timeline {
        state_id: u32,
        points: Vec<TimelinePoint>,
    },
}

impl StateInit {
    /// Reject tables that exceed the fixed in-state capacity
    pub fn within_capacity(&self) -> bool {
        match self {
            StateInit::SeqTable { events, .. } => events.len() <= MAX_SEQ_EVENTS,
            StateInit::Timeline { points, .. } => points.len() <= MAX_TIMELINE_POINTS,
        }
    }
}

/// Slot payload: everything the producer publishes with one program
#[derive(Debug, Default)]
pub struct SlotData {
    pub instructions: Vec<Instruction>,
    pub signature: ProgramSignature,
    /// Deduplicated non-zero semantic IDs, used to seed the GC touched set
    pub state_ids: Vec<u32>,
    pub inits: Vec<StateInit>,
}

impl SlotData {
    fn with_capacity() -> Self {
        SlotData {
            instructions: Vec::with_capacity(MAX_PROGRAM_SIZE),
            signature: ProgramSignature::default(),
            state_ids: Vec::new(),
            inits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Replace the payload with a decoded program
    pub fn fill(&mut self, instructions: &[Instruction], inits: Vec<StateInit>) {
        self.instructions.clear();
        self.instructions.extend_from_slice(instructions);
        self.signature = ProgramSignature::of(instructions);
        self.state_ids.clear();
        for instr in instructions {
            if instr.opcode.is_stateful()
                && instr.state_id != 0
                && !self.state_ids.contains(&instr.state_id)
            {
                self.state_ids.push(instr.state_id);
            }
        }
        self.inits = inits;
    }

    pub fn clear(&mut self) {
        self.instructions.clear();
        self.signature = ProgramSignature::default();
        self.state_ids.clear();
        self.inits.clear();
    }
}

/// One compartment of the triple buffer
///
/// The payload lives in an `UnsafeCell`; the atomic `state` is the ownership
/// token. Exactly one party may touch the payload at a time: the producer
/// that CAS-ed `Empty -> Loading`, or the audio thread while the slot is
/// `Active`/`Fading`. Transitions into readable states are release stores,
/// reads begin with acquire loads, which publishes the payload.
pub struct ProgramSlot {
    state: AtomicU8,
    /// Bumped on every clearing transition, for ABA resistance
    generation: AtomicU64,
    /// Submission stamp; the newest `Ready` slot wins a swap
    sequence: AtomicU64,
    data: UnsafeCell<SlotData>,
}

// Safety: the slot-state machine serializes all access to `data` (see the
// struct docs); the atomics themselves are Sync.
unsafe impl Sync for ProgramSlot {}

impl Default for ProgramSlot {
    fn default() -> Self {
        ProgramSlot {
            state: AtomicU8::new(SlotState::Empty as u8),
            generation: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            data: UnsafeCell::new(SlotData::with_capacity()),
        }
    }
}

impl ProgramSlot {
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_sequence(&self, seq: u64) {
        self.sequence.store(seq, Ordering::Release);
    }

    /// CAS the slot state; success orderings are AcqRel so that a transition
    /// both publishes prior writes and observes the previous owner's
    pub(crate) fn transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the slot `Empty` and bump the generation counter
    pub(crate) fn clear_to_empty(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.store(SlotState::Empty as u8, Ordering::Release);
    }

    /// Payload access for the current owner
    ///
    /// # Safety
    /// The caller must hold ownership per the slot-state machine: producer in
    /// `Loading`, audio thread in `Active`/`Fading` (or during single-threaded
    /// initialization).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut SlotData {
        &mut *self.data.get()
    }

    /// # Safety
    /// As for [`ProgramSlot::data_mut`], but shared reads only.
    pub(crate) unsafe fn data(&self) -> &SlotData {
        &*self.data.get()
    }
}

/// Decode a raw bytecode stream into instructions
///
/// Rejects streams whose length is not a multiple of the record size, whose
/// instruction count exceeds the program ceiling, that contain an unknown
/// opcode, or whose operands fall outside the register file.
pub fn decode_program(bytes: &[u8]) -> Result<Vec<Instruction>, LoadResult> {
    if bytes.len() % INSTRUCTION_SIZE != 0 {
        return Err(LoadResult::InvalidProgram);
    }
    let count = bytes.len() / INSTRUCTION_SIZE;
    if count > MAX_PROGRAM_SIZE {
        return Err(LoadResult::TooLarge);
    }
    let mut instructions = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(INSTRUCTION_SIZE) {
        let record: &[u8; INSTRUCTION_SIZE] = chunk.try_into().expect("chunk size");
        let instr = Instruction::decode(record).ok_or(LoadResult::InvalidProgram)?;
        if !instr.operands_in_range() {
            return Err(LoadResult::InvalidProgram);
        }
        instructions.push(instr);
    }
    Ok(instructions)
}

/// Encode instructions back into the flat byte stream
pub fn encode_program(instructions: &[Instruction]) -> Vec<u8> {
    let mut bytes = vec![0u8; instructions.len() * INSTRUCTION_SIZE];
    for (instr, chunk) in instructions
        .iter()
        .zip(bytes.chunks_exact_mut(INSTRUCTION_SIZE))
    {
        let record: &mut [u8; INSTRUCTION_SIZE] = chunk.try_into().expect("chunk size");
        instr.encode(record);
    }
    bytes
}
