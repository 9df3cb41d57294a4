//! Fixed-width instruction records and the opcode enumeration
//!
//! A program is a flat byte stream of 20-byte records. Each record selects a
//! kernel, names its destination register, up to five input registers, and an
//! optional 32-bit semantic state ID. For constant-style opcodes the state-ID
//! field instead carries an immediate payload (an `f32` bit pattern).
//!
//! The byte layout is host-native (producer and consumer are in-process) and
//! has no header; versioning is the host's responsibility.

use crate::constants::{BUFFER_UNUSED, MAX_BUFFERS};

/// Size of one encoded instruction record in bytes
pub const INSTRUCTION_SIZE: usize = 20;

/// Rate-byte bit 0: set for control-rate execution hints
pub const RATE_CONTROL: u8 = 0x01;

/// Pack the rate byte from a control-rate flag and a small per-opcode constant
/// (LFO shape, OUTPUT channel, sequencer output mode, ...)
#[inline]
pub fn pack_rate(control: bool, small_const: u8) -> u8 {
    (small_const << 1) | u8::from(control)
}

/// The closed opcode enumeration
///
/// Numeric bands are reserved per family; removed opcodes keep their slot.
/// `0xFF` is reserved and never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Trivial (0-9)
    Nop = 0,
    /// Fill output with a constant; `state_id` carries the f32 bit pattern
    PushConst = 1,
    Copy = 2,

    // Arithmetic (10-19), elementwise
    Add = 10,
    Sub = 11,
    Mul = 12,
    Div = 13,
    Pow = 14,
    Neg = 15,

    // Oscillators (20-29); frequency is an audio-rate input
    OscSin = 20,
    OscTri = 21,
    OscSaw = 22,
    OscSqr = 23,
    OscRamp = 24,
    OscPhasor = 25,

    // Filters (33-39); cutoff and resonance are audio-rate inputs
    SvfLp = 33,
    SvfHp = 34,
    SvfBp = 35,
    MoogLadder = 36,
    DiodeLadder = 37,
    FormantMorph = 38,
    SallenKey = 39,

    // Math (40-49), purely functional
    Abs = 40,
    Sqrt = 41,
    Log = 42,
    Exp = 43,
    Min = 44,
    Max = 45,
    Clamp = 46,
    Wrap = 47,
    Floor = 48,
    Ceil = 49,

    // Utility (50-59)
    /// Write the source buffer to a stereo output channel (channel in rate byte)
    Output = 50,
    /// White noise, deterministic per state-ID seed
    Noise = 51,
    /// MIDI note number to Hz
    Mtof = 52,
    /// Add a constant offset; `state_id` carries the f32 bit pattern
    Dc = 53,
    /// Rate-limited target following
    Slew = 54,
    /// Sample-and-hold driven by a trigger input
    Sah = 55,
    /// Read a named host parameter; `state_id` is the FNV-1a name hash
    EnvGet = 56,

    // Envelopes (60-62); all inputs are buffers, so all are sample-accurate
    EnvAdsr = 60,
    EnvAr = 61,
    EnvFollower = 62,

    // Samplers (63-69)
    SamplePlay = 63,
    SamplePlayLoop = 64,

    // Delays / reverbs (70-73)
    Delay = 70,
    ReverbFreeverb = 71,
    ReverbDattorro = 72,
    ReverbFdn = 73,

    // Effects (80-89)
    Chorus = 80,
    Flanger = 81,
    Phaser = 82,
    Comb = 83,
    DistTanh = 84,
    DistSoftClip = 85,
    /// Wavefolder with antiderivative anti-aliasing
    DistWavefold = 86,
    DistTube = 87,
    DistTape = 88,
    DistTransformer = 89,

    // Sequencing / timing (90-99)
    Clock = 90,
    /// Low-frequency oscillator; shape packed in the rate byte
    Lfo = 91,
    /// Step through a compiler-injected event table
    SeqStep = 92,
    /// Bjorklund distribution of k hits across n steps with rotation r
    Euclid = 93,
    /// Division-synced impulse
    Trigger = 94,
    /// Breakpoint automation over beats
    Timeline = 95,

    // Dynamics (100-109)
    Compressor = 100,
    Limiter = 101,
    Gate = 102,

    // Anti-aliased oscillators (110-119)
    OscSawBlep = 110,
    OscSqrBlep = 111,
    OscTriBlep = 112,
    OscPwmBlep = 113,
    OscSawMinblep = 114,
    OscSawBlep2x = 115,
    OscSawBlep4x = 116,
    OscSqrBlep4x = 117,

    // Extended math (120-139)
    Sin = 120,
    Cos = 121,
    Tan = 122,
    Asin = 123,
    Acos = 124,
    Atan = 125,
    Sinh = 126,
    Cosh = 127,
    Tanh = 128,
    Atan2 = 129,
    Log2 = 130,
    Log10 = 131,
    Exp2 = 132,
    Sign = 133,
    Fract = 134,
    Mod = 135,
    Round = 136,
    Lerp = 137,

    // Effect family overflow (140-149)
    Bitcrush = 140,
    Exciter = 141,
    RingMod = 142,
}

impl Opcode {
    /// Decode a byte into an opcode; unknown bytes are rejected
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0 => Nop,
            1 => PushConst,
            2 => Copy,
            10 => Add,
            11 => Sub,
            12 => Mul,
            13 => Div,
            14 => Pow,
            15 => Neg,
            20 => OscSin,
            21 => OscTri,
            22 => OscSaw,
            23 => OscSqr,
            24 => OscRamp,
            25 => OscPhasor,
            33 => SvfLp,
            34 => SvfHp,
            35 => SvfBp,
            36 => MoogLadder,
            37 => DiodeLadder,
            38 => FormantMorph,
            39 => SallenKey,
            40 => Abs,
            41 => Sqrt,
            42 => Log,
            43 => Exp,
            44 => Min,
            45 => Max,
            46 => Clamp,
            47 => Wrap,
            48 => Floor,
            49 => Ceil,
            50 => Output,
            51 => Noise,
            52 => Mtof,
            53 => Dc,
            54 => Slew,
            55 => Sah,
            56 => EnvGet,
            60 => EnvAdsr,
            61 => EnvAr,
            62 => EnvFollower,
            63 => SamplePlay,
            64 => SamplePlayLoop,
            70 => Delay,
            71 => ReverbFreeverb,
            72 => ReverbDattorro,
            73 => ReverbFdn,
            80 => Chorus,
            81 => Flanger,
            82 => Phaser,
            83 => Comb,
            84 => DistTanh,
            85 => DistSoftClip,
            86 => DistWavefold,
            87 => DistTube,
            88 => DistTape,
            89 => DistTransformer,
            90 => Clock,
            91 => Lfo,
            92 => SeqStep,
            93 => Euclid,
            94 => Trigger,
            95 => Timeline,
            100 => Compressor,
            101 => Limiter,
            102 => Gate,
            110 => OscSawBlep,
            111 => OscSqrBlep,
            112 => OscTriBlep,
            113 => OscPwmBlep,
            114 => OscSawMinblep,
            115 => OscSawBlep2x,
            116 => OscSawBlep4x,
            117 => OscSqrBlep4x,
            120 => Sin,
            121 => Cos,
            122 => Tan,
            123 => Asin,
            124 => Acos,
            125 => Atan,
            126 => Sinh,
            127 => Cosh,
            128 => Tanh,
            129 => Atan2,
            130 => Log2,
            131 => Log10,
            132 => Exp2,
            133 => Sign,
            134 => Fract,
            135 => Mod,
            136 => Round,
            137 => Lerp,
            140 => Bitcrush,
            141 => Exciter,
            142 => RingMod,
            _ => return None,
        })
    }

    /// True for opcodes whose `state_id` names persistent per-instance memory
    /// (as opposed to carrying an immediate or nothing at all)
    pub fn is_stateful(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            OscSin
                | OscTri
                | OscSaw
                | OscSqr
                | OscRamp
                | OscPhasor
                | SvfLp
                | SvfHp
                | SvfBp
                | MoogLadder
                | DiodeLadder
                | FormantMorph
                | SallenKey
                | Noise
                | Slew
                | Sah
                | EnvAdsr
                | EnvAr
                | EnvFollower
                | SamplePlay
                | SamplePlayLoop
                | Delay
                | ReverbFreeverb
                | ReverbDattorro
                | ReverbFdn
                | Chorus
                | Flanger
                | Phaser
                | Comb
                | DistWavefold
                | DistTape
                | Lfo
                | SeqStep
                | Euclid
                | Trigger
                | Timeline
                | Compressor
                | Limiter
                | Gate
                | OscSawBlep
                | OscSqrBlep
                | OscTriBlep
                | OscPwmBlep
                | OscSawMinblep
                | OscSawBlep2x
                | OscSawBlep4x
                | OscSqrBlep4x
                | Bitcrush
        )
    }
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Bit 0: control-rate hint. Bits 1-7: small per-opcode constant.
    pub rate: u8,
    /// Destination register
    pub out_buffer: u16,
    /// Input registers; `BUFFER_UNUSED` marks absent operands
    pub inputs: [u16; 5],
    /// Semantic identity for stateful opcodes, or an immediate payload
    pub state_id: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, out_buffer: u16) -> Self {
        Self {
            opcode,
            rate: 0,
            out_buffer,
            inputs: [BUFFER_UNUSED; 5],
            state_id: 0,
        }
    }

    pub fn with_inputs(mut self, inputs: &[u16]) -> Self {
        for (slot, &id) in self.inputs.iter_mut().zip(inputs.iter()) {
            *slot = id;
        }
        self
    }

    pub fn with_state(mut self, state_id: u32) -> Self {
        self.state_id = state_id;
        self
    }

    pub fn with_rate(mut self, rate: u8) -> Self {
        self.rate = rate;
        self
    }

    /// Store an f32 immediate in the state-ID field (PUSH_CONST, DC)
    pub fn with_const(mut self, value: f32) -> Self {
        self.state_id = value.to_bits();
        self
    }

    /// Read the state-ID field back as an f32 immediate
    #[inline]
    pub fn const_f32(&self) -> f32 {
        f32::from_bits(self.state_id)
    }

    #[inline]
    pub fn is_control_rate(&self) -> bool {
        self.rate & RATE_CONTROL != 0
    }

    /// The small per-opcode constant packed in the upper rate bits
    #[inline]
    pub fn packed_const(&self) -> u8 {
        self.rate >> 1
    }

    /// Register-safety check: destination and all present inputs in range
    pub fn operands_in_range(&self) -> bool {
        if self.out_buffer as usize >= MAX_BUFFERS {
            return false;
        }
        self.inputs
            .iter()
            .all(|&id| id == BUFFER_UNUSED || (id as usize) < MAX_BUFFERS)
    }

    /// Encode into the fixed 20-byte record
    pub fn encode(&self, out: &mut [u8; INSTRUCTION_SIZE]) {
        out[0] = self.opcode as u8;
        out[1] = self.rate;
        out[2..4].copy_from_slice(&self.out_buffer.to_ne_bytes());
        for (i, input) in self.inputs.iter().enumerate() {
            let at = 4 + i * 2;
            out[at..at + 2].copy_from_slice(&input.to_ne_bytes());
        }
        out[14..18].copy_from_slice(&self.state_id.to_ne_bytes());
        out[18] = 0;
        out[19] = 0;
    }

    /// Decode one record; `None` if the opcode byte is not in the enumeration
    pub fn decode(bytes: &[u8; INSTRUCTION_SIZE]) -> Option<Instruction> {
        let opcode = Opcode::from_u8(bytes[0])?;
        let mut inputs = [BUFFER_UNUSED; 5];
        for (i, input) in inputs.iter_mut().enumerate() {
            let at = 4 + i * 2;
            *input = u16::from_ne_bytes([bytes[at], bytes[at + 1]]);
        }
        Some(Instruction {
            opcode,
            rate: bytes[1],
            out_buffer: u16::from_ne_bytes([bytes[2], bytes[3]]),
            inputs,
            state_id: u32::from_ne_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]),
        })
    }
}
