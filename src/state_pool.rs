//! Persistent DSP state keyed by semantic identity
//!
//! A fixed-capacity open-addressing table (linear probing) from 32-bit
//! semantic IDs to tagged per-instance state: oscillator phases, filter
//! integrators, delay-line handles, envelope stage machines, voice pools,
//! sequencer cursors. Keys are FNV-1a hashes of the compiler's path to each
//! node, which is what lets state survive a hot-swap: the same node in the
//! next program hashes to the same key.
//!
//! A parallel table holds *fading* entries: states orphaned by a swap, each
//! with a decaying gain and a block countdown. An entry whose key is looked
//! up again before it expires is moved back to the active table, so the
//! outgoing program keeps its memory alive through the crossfade window.
//!
//! Everything is preallocated; probing is bounded by `MAX_STATES`; nothing
//! here allocates after construction.

use crate::arena::LineRef;
use crate::constants::{
    DEFAULT_FADE_BLOCKS, MAX_SAMPLER_VOICES, MAX_SEQ_EVENTS, MAX_STATES, MAX_TIMELINE_POINTS,
};
use crate::program::{SeqEvent, TimelinePoint};

/// Ring size of the MinBLEP residual overlap buffer
pub const MINBLEP_RING: usize = 32;

/// Envelope stage machine shared by ADSR and AR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvStage {
    #[default]
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// One sampler voice
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Voice {
    pub active: bool,
    /// Playback cursor in frames
    pub pos: f64,
    /// Playback rate (1.0 = root pitch)
    pub rate: f32,
    /// Sample-bank slot captured at trigger time
    pub slot: u16,
}

/// Discriminant of [`DspState`], used by `get_or_create`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    None,
    Phase,
    BlepTri,
    MinBlep,
    Oversample,
    Svf,
    Moog,
    Diode,
    SallenKey,
    Formant,
    Envelope,
    Follower,
    Slew,
    Sah,
    Noise,
    Lfo,
    DelayLine,
    Freeverb,
    Dattorro,
    Fdn,
    ModDelay,
    Comb,
    Phaser,
    Adaa,
    Tape,
    Bitcrush,
    GainEnv,
    Gate,
    Seq,
    Euclid,
    Trigger,
    Timeline,
    Sampler,
}

/// The tagged union of every stateful opcode's per-instance memory
///
/// Each variant is plain data. Delay-family variants hold arena `LineRef`s
/// claimed on first use, not heap pointers, so moving a state between the
/// active and fading tables is a plain move.
#[derive(Debug, Clone, PartialEq)]
pub enum DspState {
    None,
    /// Naive oscillators, phasor, ramp, PolyBLEP saw/square/PWM
    Phase { phase: f64 },
    /// PolyBLEP triangle: leaky-integrated BLEP square
    BlepTri { phase: f64, integ: f32 },
    /// MinBLEP saw: phase plus a ring of pending residual corrections
    MinBlep {
        phase: f64,
        ring: [f32; MINBLEP_RING],
        pos: u32,
    },
    /// Oversampled oscillators: phase plus halfband decimator history
    Oversample { phase: f64, hist: [f32; 8] },
    /// State-variable filter integrators
    Svf { ic1: f32, ic2: f32 },
    /// Moog ladder stage memory
    Moog { s: [f32; 4] },
    /// ZDF diode ladder stage memory
    Diode { s: [f32; 4] },
    /// Sallen-Key (MS-20) integrators
    SallenKey { s1: f32, s2: f32 },
    /// Three parallel bandpass sections for the formant morph
    Formant { ic: [[f32; 2]; 3] },
    /// ADSR / AR stage machine with edge detector
    Envelope {
        stage: EnvStage,
        value: f32,
        prev_gate: f32,
    },
    Follower { env: f32 },
    Slew { current: f32 },
    Sah { held: f32, prev_trigger: f32 },
    /// Xorshift state; seeded from the semantic ID on first use
    Noise { rng: u32 },
    Lfo { phase: f64, rng: u32, held: f32 },
    DelayLine { line: LineRef, write: u32 },
    Freeverb {
        combs: [LineRef; 8],
        comb_write: [u32; 8],
        comb_lp: [f32; 8],
        aps: [LineRef; 4],
        ap_write: [u32; 4],
    },
    Dattorro {
        pre: LineRef,
        pre_write: u32,
        aps: [LineRef; 8],
        ap_write: [u32; 8],
        delays: [LineRef; 4],
        delay_write: [u32; 4],
        damp: [f32; 2],
        excursion: f64,
    },
    Fdn {
        lines: [LineRef; 4],
        write: [u32; 4],
        lp: [f32; 4],
    },
    /// Chorus / flanger: modulated delay line
    ModDelay { line: LineRef, write: u32, lfo: f64 },
    Comb { line: LineRef, write: u32 },
    Phaser { ap: [f32; 6], lfo: f64 },
    /// First-order ADAA memory
    Adaa { prev_x: f32, prev_ad: f32 },
    Tape { lp: f32, hp_x: f32, hp_y: f32 },
    Bitcrush { held: f32, accum: f32 },
    /// Compressor / limiter gain envelope
    GainEnv { env: f32 },
    Gate { env: f32, open: bool },
    Seq {
        events: [SeqEvent; MAX_SEQ_EVENTS],
        count: u32,
        cursor: u32,
        last_beat: f64,
    },
    Euclid { last_step: i64 },
    Trigger { last_tick: i64 },
    Timeline {
        points: [TimelinePoint; MAX_TIMELINE_POINTS],
        count: u32,
    },
    Sampler {
        voices: [Voice; MAX_SAMPLER_VOICES],
        next: u32,
        prev_trigger: f32,
    },
}

impl DspState {
    pub fn kind(&self) -> StateKind {
        match self {
            DspState::None => StateKind::None,
            DspState::Phase { .. } => StateKind::Phase,
            DspState::BlepTri { .. } => StateKind::BlepTri,
            DspState::MinBlep { .. } => StateKind::MinBlep,
            DspState::Oversample { .. } => StateKind::Oversample,
            DspState::Svf { .. } => StateKind::Svf,
            DspState::Moog { .. } => StateKind::Moog,
            DspState::Diode { .. } => StateKind::Diode,
            DspState::SallenKey { .. } => StateKind::SallenKey,
            DspState::Formant { .. } => StateKind::Formant,
            DspState::Envelope { .. } => StateKind::Envelope,
            DspState::Follower { .. } => StateKind::Follower,
            DspState::Slew { .. } => StateKind::Slew,
            DspState::Sah { .. } => StateKind::Sah,
            DspState::Noise { .. } => StateKind::Noise,
            DspState::Lfo { .. } => StateKind::Lfo,
            DspState::DelayLine { .. } => StateKind::DelayLine,
            DspState::Freeverb { .. } => StateKind::Freeverb,
            DspState::Dattorro { .. } => StateKind::Dattorro,
            DspState::Fdn { .. } => StateKind::Fdn,
            DspState::ModDelay { .. } => StateKind::ModDelay,
            DspState::Comb { .. } => StateKind::Comb,
            DspState::Phaser { .. } => StateKind::Phaser,
            DspState::Adaa { .. } => StateKind::Adaa,
            DspState::Tape { .. } => StateKind::Tape,
            DspState::Bitcrush { .. } => StateKind::Bitcrush,
            DspState::GainEnv { .. } => StateKind::GainEnv,
            DspState::Gate { .. } => StateKind::Gate,
            DspState::Seq { .. } => StateKind::Seq,
            DspState::Euclid { .. } => StateKind::Euclid,
            DspState::Trigger { .. } => StateKind::Trigger,
            DspState::Timeline { .. } => StateKind::Timeline,
            DspState::Sampler { .. } => StateKind::Sampler,
        }
    }

    /// Default (silent, zeroed) value of a variant
    pub fn default_for(kind: StateKind) -> DspState {
        match kind {
            StateKind::None => DspState::None,
            StateKind::Phase => DspState::Phase { phase: 0.0 },
            StateKind::BlepTri => DspState::BlepTri {
                phase: 0.0,
                integ: 0.0,
            },
            StateKind::MinBlep => DspState::MinBlep {
                phase: 0.0,
                ring: [0.0; MINBLEP_RING],
                pos: 0,
            },
            StateKind::Oversample => DspState::Oversample {
                phase: 0.0,
                hist: [0.0; 8],
            },
            StateKind::Svf => DspState::Svf { ic1: 0.0, ic2: 0.0 },
            StateKind::Moog => DspState::Moog { s: [0.0; 4] },
            StateKind::Diode => DspState::Diode { s: [0.0; 4] },
            StateKind::SallenKey => DspState::SallenKey { s1: 0.0, s2: 0.0 },
            StateKind::Formant => DspState::Formant { ic: [[0.0; 2]; 3] },
            StateKind::Envelope => DspState::Envelope {
                stage: EnvStage::Idle,
                value: 0.0,
                prev_gate: 0.0,
            },
            StateKind::Follower => DspState::Follower { env: 0.0 },
            StateKind::Slew => DspState::Slew { current: 0.0 },
            StateKind::Sah => DspState::Sah {
                held: 0.0,
                prev_trigger: 0.0,
            },
            StateKind::Noise => DspState::Noise { rng: 0 },
            StateKind::Lfo => DspState::Lfo {
                phase: 0.0,
                rng: 0,
                held: 0.0,
            },
            StateKind::DelayLine => DspState::DelayLine {
                line: LineRef::default(),
                write: 0,
            },
            StateKind::Freeverb => DspState::Freeverb {
                combs: [LineRef::default(); 8],
                comb_write: [0; 8],
                comb_lp: [0.0; 8],
                aps: [LineRef::default(); 4],
                ap_write: [0; 4],
            },
            StateKind::Dattorro => DspState::Dattorro {
                pre: LineRef::default(),
                pre_write: 0,
                aps: [LineRef::default(); 8],
                ap_write: [0; 8],
                delays: [LineRef::default(); 4],
                delay_write: [0; 4],
                damp: [0.0; 2],
                excursion: 0.0,
            },
            StateKind::Fdn => DspState::Fdn {
                lines: [LineRef::default(); 4],
                write: [0; 4],
                lp: [0.0; 4],
            },
            StateKind::ModDelay => DspState::ModDelay {
                line: LineRef::default(),
                write: 0,
                lfo: 0.0,
            },
            StateKind::Comb => DspState::Comb {
                line: LineRef::default(),
                write: 0,
            },
            StateKind::Phaser => DspState::Phaser {
                ap: [0.0; 6],
                lfo: 0.0,
            },
            StateKind::Adaa => DspState::Adaa {
                prev_x: 0.0,
                prev_ad: 0.0,
            },
            StateKind::Tape => DspState::Tape {
                lp: 0.0,
                hp_x: 0.0,
                hp_y: 0.0,
            },
            StateKind::Bitcrush => DspState::Bitcrush {
                held: 0.0,
                accum: 0.0,
            },
            StateKind::GainEnv => DspState::GainEnv { env: 0.0 },
            StateKind::Gate => DspState::Gate {
                env: 0.0,
                open: false,
            },
            StateKind::Seq => DspState::Seq {
                events: [SeqEvent::default(); MAX_SEQ_EVENTS],
                count: 0,
                cursor: 0,
                last_beat: -1.0,
            },
            StateKind::Euclid => DspState::Euclid { last_step: -1 },
            StateKind::Trigger => DspState::Trigger { last_tick: -1 },
            StateKind::Timeline => DspState::Timeline {
                points: [TimelinePoint::default(); MAX_TIMELINE_POINTS],
                count: 0,
            },
            StateKind::Sampler => DspState::Sampler {
                voices: [Voice::default(); MAX_SAMPLER_VOICES],
                next: 0,
                prev_trigger: 0.0,
            },
        }
    }

    /// True for variants whose contents encode signal history rather than
    /// musical position; these are the ones `seek` may clear
    pub fn is_history_dependent(&self) -> bool {
        matches!(
            self.kind(),
            StateKind::Svf
                | StateKind::Moog
                | StateKind::Diode
                | StateKind::SallenKey
                | StateKind::Formant
                | StateKind::Follower
                | StateKind::DelayLine
                | StateKind::Freeverb
                | StateKind::Dattorro
                | StateKind::Fdn
                | StateKind::ModDelay
                | StateKind::Comb
                | StateKind::Phaser
                | StateKind::Adaa
                | StateKind::Tape
                | StateKind::GainEnv
                | StateKind::Gate
        )
    }
}

struct ActiveSlot {
    key: u32,
    occupied: bool,
    touched: bool,
    state: DspState,
}

struct FadingSlot {
    key: u32,
    occupied: bool,
    blocks_left: u16,
    gain: f32,
    step: f32,
    state: DspState,
}

enum Probe {
    Found(usize),
    Vacant(usize),
    Full,
}

pub struct StatePool {
    active: Vec<ActiveSlot>,
    fading: Vec<FadingSlot>,
    fade_blocks: u16,
    /// Latched when probing had to fall back to the scratch entry
    overflowed: bool,
    /// Out-of-table scratch entry handed out when the table is full, so an
    /// overflowing instance degrades alone instead of clobbering whichever
    /// unrelated state occupies a table slot
    fallback_key: u32,
    fallback: DspState,
}

impl StatePool {
    pub fn new() -> Self {
        let active = (0..MAX_STATES)
            .map(|_| ActiveSlot {
                key: 0,
                occupied: false,
                touched: false,
                state: DspState::None,
            })
            .collect();
        let fading = (0..MAX_STATES)
            .map(|_| FadingSlot {
                key: 0,
                occupied: false,
                blocks_left: 0,
                gain: 0.0,
                step: 0.0,
                state: DspState::None,
            })
            .collect();
        StatePool {
            active,
            fading,
            fade_blocks: DEFAULT_FADE_BLOCKS,
            overflowed: false,
            fallback_key: 0,
            fallback: DspState::None,
        }
    }

    pub fn set_fade_blocks(&mut self, blocks: u16) {
        self.fade_blocks = blocks;
    }

    fn probe_active(&self, key: u32) -> Probe {
        let start = key as usize % MAX_STATES;
        let mut vacant = None;
        for step in 0..MAX_STATES {
            let i = (start + step) % MAX_STATES;
            let slot = &self.active[i];
            if slot.occupied {
                if slot.key == key {
                    return Probe::Found(i);
                }
            } else if vacant.is_none() {
                vacant = Some(i);
            }
        }
        match vacant {
            Some(i) => Probe::Vacant(i),
            None => Probe::Full,
        }
    }

    /// Clear the touched set; called at the start of each executed program
    pub fn begin_frame(&mut self) {
        for slot in &mut self.active {
            slot.touched = false;
        }
    }

    /// Mark every listed ID touched (used to seed the set from an incoming
    /// program's ID list at swap time)
    pub fn seed_touched(&mut self, ids: &[u32]) {
        for &id in ids {
            if let Probe::Found(i) = self.probe_active(id) {
                self.active[i].touched = true;
            }
        }
    }

    /// Find or create the state for `id`, marking it touched
    ///
    /// An existing entry of a different variant is re-initialized (type
    /// change is tolerated but discards prior contents). A miss first checks
    /// the fading table and resurrects a matching entry, which is what keeps
    /// the outgoing program's memory alive during a crossfade. The loader
    /// rejects programs that could not fit (`PoolFull`), but a crossfade
    /// between two large programs can still fill the table transiently; a
    /// full table hands out the dedicated scratch entry, so only the
    /// overflowing instance loses its memory and no table resident is
    /// clobbered. The `overflowed` latch records that this happened.
    pub fn get_or_create(&mut self, id: u32, kind: StateKind) -> &mut DspState {
        let index = match self.probe_active(id) {
            Probe::Found(i) => {
                if self.active[i].state.kind() != kind {
                    self.active[i].state = DspState::default_for(kind);
                }
                i
            }
            Probe::Vacant(i) => {
                let state = match self.take_fading(id) {
                    Some(resurrected) if resurrected.kind() == kind => resurrected,
                    _ => DspState::default_for(kind),
                };
                let slot = &mut self.active[i];
                slot.key = id;
                slot.occupied = true;
                slot.state = state;
                i
            }
            Probe::Full => {
                self.overflowed = true;
                if self.fallback_key != id || self.fallback.kind() != kind {
                    self.fallback_key = id;
                    self.fallback = DspState::default_for(kind);
                }
                return &mut self.fallback;
            }
        };
        let slot = &mut self.active[index];
        slot.touched = true;
        &mut slot.state
    }

    /// Shared lookup without creation (queries, tests)
    pub fn get(&self, id: u32) -> Option<&DspState> {
        match self.probe_active(id) {
            Probe::Found(i) => Some(&self.active[i].state),
            _ => None,
        }
    }

    /// True once any `get_or_create` had to use the scratch fallback
    /// (cleared only by `reset`)
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Move every occupied-but-untouched entry into the fading compartment
    ///
    /// Called after a swap, never during normal processing. With
    /// `fade_blocks == 0` orphans are dropped outright.
    pub fn gc_sweep(&mut self) {
        for i in 0..MAX_STATES {
            if self.active[i].occupied && !self.active[i].touched {
                let key = self.active[i].key;
                let state = std::mem::replace(&mut self.active[i].state, DspState::None);
                self.active[i].occupied = false;
                if self.fade_blocks > 0 {
                    self.insert_fading(key, state);
                }
            }
        }
    }

    fn insert_fading(&mut self, key: u32, state: DspState) {
        let start = key as usize % MAX_STATES;
        let mut target = None;
        for step in 0..MAX_STATES {
            let i = (start + step) % MAX_STATES;
            if self.fading[i].occupied {
                if self.fading[i].key == key {
                    target = Some(i);
                    break;
                }
            } else {
                target = Some(i);
                break;
            }
        }
        // a full fading table just drops the orphan
        let Some(i) = target else { return };
        let slot = &mut self.fading[i];
        slot.key = key;
        slot.occupied = true;
        slot.blocks_left = self.fade_blocks;
        slot.gain = 1.0;
        slot.step = 1.0 / f32::from(self.fade_blocks.max(1));
        slot.state = state;
    }

    fn take_fading(&mut self, key: u32) -> Option<DspState> {
        let start = key as usize % MAX_STATES;
        for step in 0..MAX_STATES {
            let i = (start + step) % MAX_STATES;
            let slot = &mut self.fading[i];
            if slot.occupied && slot.key == key {
                slot.occupied = false;
                return Some(std::mem::replace(&mut slot.state, DspState::None));
            }
        }
        None
    }

    /// Decrement every fading entry's counter and gain
    pub fn advance_fading(&mut self) {
        for slot in &mut self.fading {
            if slot.occupied {
                slot.gain = (slot.gain - slot.step).max(0.0);
                slot.blocks_left = slot.blocks_left.saturating_sub(1);
            }
        }
    }

    /// Delete fading entries whose countdown reached zero
    pub fn gc_fading(&mut self) {
        for slot in &mut self.fading {
            if slot.occupied && slot.blocks_left == 0 {
                slot.occupied = false;
                slot.state = DspState::None;
            }
        }
    }

    /// `1.0` if `id` is active, its decaying gain if fading, `0.0` otherwise
    pub fn fade_gain(&self, id: u32) -> f32 {
        if let Probe::Found(_) = self.probe_active(id) {
            return 1.0;
        }
        let start = id as usize % MAX_STATES;
        for step in 0..MAX_STATES {
            let i = (start + step) % MAX_STATES;
            let slot = &self.fading[i];
            if slot.occupied && slot.key == id {
                return slot.gain;
            }
        }
        0.0
    }

    /// Install a sequencer event table (program-load side channel)
    pub fn init_seq_table(&mut self, id: u32, table: &[SeqEvent]) {
        let state = self.get_or_create(id, StateKind::Seq);
        if let DspState::Seq {
            events,
            count,
            cursor,
            last_beat,
        } = state
        {
            let n = table.len().min(MAX_SEQ_EVENTS);
            events[..n].copy_from_slice(&table[..n]);
            *count = n as u32;
            *cursor = 0;
            *last_beat = -1.0;
        }
    }

    /// Install a timeline breakpoint table (program-load side channel)
    pub fn init_timeline(&mut self, id: u32, table: &[TimelinePoint]) {
        let state = self.get_or_create(id, StateKind::Timeline);
        if let DspState::Timeline { points, count } = state {
            let n = table.len().min(MAX_TIMELINE_POINTS);
            points[..n].copy_from_slice(&table[..n]);
            *count = n as u32;
        }
    }

    /// Zero history-dependent contents in place (for seek); arena line
    /// handles survive, the caller clears the arena storage itself
    pub fn reset_history(&mut self) {
        for slot in &mut self.active {
            if !slot.occupied || !slot.state.is_history_dependent() {
                continue;
            }
            let kind = slot.state.kind();
            match &mut slot.state {
                DspState::Svf { ic1, ic2 } => {
                    *ic1 = 0.0;
                    *ic2 = 0.0;
                }
                DspState::Moog { s } | DspState::Diode { s } => *s = [0.0; 4],
                DspState::SallenKey { s1, s2 } => {
                    *s1 = 0.0;
                    *s2 = 0.0;
                }
                DspState::Formant { ic } => *ic = [[0.0; 2]; 3],
                DspState::Follower { env } => *env = 0.0,
                DspState::DelayLine { write, .. } => *write = 0,
                DspState::Freeverb {
                    comb_write,
                    comb_lp,
                    ap_write,
                    ..
                } => {
                    *comb_write = [0; 8];
                    *comb_lp = [0.0; 8];
                    *ap_write = [0; 4];
                }
                DspState::Dattorro {
                    pre_write,
                    ap_write,
                    delay_write,
                    damp,
                    excursion,
                    ..
                } => {
                    *pre_write = 0;
                    *ap_write = [0; 8];
                    *delay_write = [0; 4];
                    *damp = [0.0; 2];
                    *excursion = 0.0;
                }
                DspState::Fdn { write, lp, .. } => {
                    *write = [0; 4];
                    *lp = [0.0; 4];
                }
                DspState::ModDelay { write, lfo, .. } => {
                    *write = 0;
                    *lfo = 0.0;
                }
                DspState::Comb { write, .. } => *write = 0,
                DspState::Phaser { ap, lfo } => {
                    *ap = [0.0; 6];
                    *lfo = 0.0;
                }
                DspState::Adaa { prev_x, prev_ad } => {
                    *prev_x = 0.0;
                    *prev_ad = 0.0;
                }
                DspState::Tape { lp, hp_x, hp_y } => {
                    *lp = 0.0;
                    *hp_x = 0.0;
                    *hp_y = 0.0;
                }
                DspState::GainEnv { env } => *env = 0.0,
                DspState::Gate { env, open } => {
                    *env = 0.0;
                    *open = false;
                }
                _ => debug_assert!(false, "unhandled history-dependent kind {:?}", kind),
            }
        }
    }

    /// Drop everything, active and fading
    pub fn reset(&mut self) {
        for slot in &mut self.active {
            slot.occupied = false;
            slot.touched = false;
            slot.state = DspState::None;
        }
        for slot in &mut self.fading {
            slot.occupied = false;
            slot.state = DspState::None;
        }
        self.overflowed = false;
        self.fallback_key = 0;
        self.fallback = DspState::None;
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|s| s.occupied).count()
    }

    pub fn fading_count(&self) -> usize {
        self.fading.iter().filter(|s| s.occupied).count()
    }
}

impl Default for StatePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_persists_value() {
        let mut pool = StatePool::new();
        if let DspState::Phase { phase } = pool.get_or_create(42, StateKind::Phase) {
            *phase = 0.625;
        }
        match pool.get_or_create(42, StateKind::Phase) {
            DspState::Phase { phase } => assert_eq!(*phase, 0.625),
            other => panic!("wrong variant: {:?}", other),
        }
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_type_change_reinitializes() {
        let mut pool = StatePool::new();
        if let DspState::Phase { phase } = pool.get_or_create(42, StateKind::Phase) {
            *phase = 0.625;
        }
        match pool.get_or_create(42, StateKind::Svf) {
            DspState::Svf { ic1, ic2 } => {
                assert_eq!(*ic1, 0.0);
                assert_eq!(*ic2, 0.0);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_gc_sweep_moves_untouched_to_fading() {
        let mut pool = StatePool::new();
        pool.get_or_create(1, StateKind::Phase);
        pool.get_or_create(2, StateKind::Phase);

        pool.begin_frame();
        pool.get_or_create(1, StateKind::Phase); // only 1 touched this frame
        pool.gc_sweep();

        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.fading_count(), 1);
        assert_eq!(pool.fade_gain(1), 1.0);
        let g = pool.fade_gain(2);
        assert!(g > 0.0 && g <= 1.0);
        assert_eq!(pool.fade_gain(3), 0.0);
    }

    #[test]
    fn test_seeded_sweep_preserves_listed_ids() {
        let mut pool = StatePool::new();
        pool.get_or_create(1, StateKind::Phase);
        pool.get_or_create(2, StateKind::Phase);

        pool.begin_frame();
        pool.seed_touched(&[2]);
        pool.gc_sweep();
        assert!(pool.get(2).is_some());
        assert!(pool.get(1).is_none());
    }

    #[test]
    fn test_fading_expires_after_countdown() {
        let mut pool = StatePool::new();
        pool.set_fade_blocks(3);
        pool.get_or_create(9, StateKind::Phase);
        pool.begin_frame();
        pool.gc_sweep();
        assert_eq!(pool.fading_count(), 1);

        let mut last_gain = 1.0;
        for _ in 0..3 {
            pool.advance_fading();
            let g = pool.fade_gain(9);
            assert!(g < last_gain, "gain must decay: {} -> {}", last_gain, g);
            last_gain = g;
            pool.gc_fading();
        }
        assert_eq!(pool.fading_count(), 0);
        assert_eq!(pool.fade_gain(9), 0.0);
    }

    #[test]
    fn test_resurrection_preserves_contents() {
        let mut pool = StatePool::new();
        if let DspState::Phase { phase } = pool.get_or_create(5, StateKind::Phase) {
            *phase = 0.25;
        }
        pool.begin_frame();
        pool.gc_sweep();
        assert!(pool.get(5).is_none());

        // the old program looks the state up again mid-crossfade
        match pool.get_or_create(5, StateKind::Phase) {
            DspState::Phase { phase } => assert_eq!(*phase, 0.25),
            other => panic!("wrong variant: {:?}", other),
        }
        assert_eq!(pool.fading_count(), 0, "entry moved back, not copied");
    }

    #[test]
    fn test_pool_full_uses_scratch_without_corrupting_residents() {
        let mut pool = StatePool::new();
        for id in 0..MAX_STATES as u32 {
            if let DspState::Phase { phase } = pool.get_or_create(id + 1, StateKind::Phase) {
                *phase = f64::from(id + 1);
            }
        }
        assert!(!pool.overflowed());

        // one key past capacity lands on the scratch entry, latches the
        // overflow flag, and leaves the table untouched
        if let DspState::Phase { phase } = pool.get_or_create(0xffff_ffff, StateKind::Phase) {
            assert_eq!(*phase, 0.0);
            *phase = 0.5;
        }
        assert!(pool.overflowed());
        assert_eq!(pool.active_count(), MAX_STATES);
        for id in 0..MAX_STATES as u32 {
            assert_eq!(
                pool.get(id + 1),
                Some(&DspState::Phase {
                    phase: f64::from(id + 1)
                }),
                "resident {} was clobbered by the overflow fallback",
                id + 1
            );
        }

        // the scratch entry persists for the same key, like any state would
        match pool.get_or_create(0xffff_ffff, StateKind::Phase) {
            DspState::Phase { phase } => assert_eq!(*phase, 0.5),
            other => panic!("wrong variant: {:?}", other),
        }

        pool.reset();
        assert!(!pool.overflowed());
    }

    #[test]
    fn test_init_seq_table() {
        let mut pool = StatePool::new();
        let events = [
            SeqEvent {
                time: 0.0,
                value: 60.0,
                velocity: 1.0,
            },
            SeqEvent {
                time: 0.5,
                value: 62.0,
                velocity: 0.8,
            },
        ];
        pool.init_seq_table(11, &events);
        match pool.get(11) {
            Some(DspState::Seq { count, events, .. }) => {
                assert_eq!(*count, 2);
                assert_eq!(events[1].value, 62.0);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_reset_history_keeps_phase() {
        let mut pool = StatePool::new();
        if let DspState::Phase { phase } = pool.get_or_create(1, StateKind::Phase) {
            *phase = 0.5;
        }
        if let DspState::Svf { ic1, .. } = pool.get_or_create(2, StateKind::Svf) {
            *ic1 = 3.0;
        }
        pool.reset_history();
        assert_eq!(pool.get(1), Some(&DspState::Phase { phase: 0.5 }));
        assert_eq!(pool.get(2), Some(&DspState::Svf { ic1: 0.0, ic2: 0.0 }));
    }
}
