//! Compile-time sizing and numerical constants
//!
//! Every capacity in the engine is fixed here so that construction can
//! preallocate all storage and the audio thread never touches the heap.

/// Samples per processed block, per channel
pub const BLOCK_SIZE: usize = 128;

/// Capacity of the buffer pool: the instruction operand space
pub const MAX_BUFFERS: usize = 4096;

/// Capacity of the persistent state pool
///
/// Deliberately below `MAX_PROGRAM_SIZE`: a maximum-length program can name
/// more unique states than the pool holds, and the loader rejects it with
/// `PoolFull` instead of letting the table overflow at runtime.
pub const MAX_STATES: usize = 2048;

/// Maximum instruction count per program
pub const MAX_PROGRAM_SIZE: usize = 4096;

/// Capacity of the host parameter map
pub const MAX_ENV_PARAMS: usize = 256;

/// Slots in the host-populated sample bank
pub const MAX_SAMPLE_SLOTS: usize = 128;

/// Total delay memory shared by all delay-family states, in samples
pub const ARENA_SAMPLES: usize = 1 << 22; // ~87 s of mono audio at 48 kHz

/// Maximum events in one sequencer table
pub const MAX_SEQ_EVENTS: usize = 64;

/// Maximum breakpoints in one timeline automation table
pub const MAX_TIMELINE_POINTS: usize = 32;

/// Voices per sampler instance
pub const MAX_SAMPLER_VOICES: usize = 16;

/// Sentinel for an unused instruction operand
pub const BUFFER_UNUSED: u16 = 0xFFFF;

pub const DEFAULT_SAMPLE_RATE: f32 = 48_000.0;
pub const DEFAULT_BPM: f32 = 120.0;
pub const HALF_PI: f32 = std::f32::consts::FRAC_PI_2;

/// Crossfade duration bounds, in blocks
pub const MIN_CROSSFADE_BLOCKS: u32 = 2;
pub const MAX_CROSSFADE_BLOCKS: u32 = 5;
pub const DEFAULT_CROSSFADE_BLOCKS: u32 = 3;

/// Blocks an orphaned state spends in the fading compartment before removal
pub const DEFAULT_FADE_BLOCKS: u16 = 8;

/// Beats per bar used for derived bar phase
pub const BEATS_PER_BAR: f64 = 4.0;
