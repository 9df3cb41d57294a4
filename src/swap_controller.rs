//! Triple-buffered, lock-free program handoff
//!
//! Three `ProgramSlot`s and four atomics: the current slot index, the
//! previous (fading) slot index, a `swap_pending` flag, and a completed-swap
//! counter. A producer thread CAS-claims an `Empty` slot, fills it while
//! `Loading`, and publishes it `Ready`; the audio thread promotes the `Ready`
//! slot at a block boundary. No locks, no allocation on the audio side; slot
//! payload storage is only ever cleared (never freed) by the audio thread.
//!
//! If the producer outruns the audio thread and two slots are `Ready`, the
//! most recent submission wins and stale ones are discarded. That is the
//! live-coding contract: the newest code is the code you hear.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::arena::program_arena_demand;
use crate::constants::{DEFAULT_SAMPLE_RATE, MAX_STATES};
use crate::instruction::Instruction;
use crate::program::{
    decode_program, LoadResult, ProgramSignature, ProgramSlot, SlotData, SlotState, StateInit,
};

/// Index value meaning "no slot"
pub const NO_SLOT: usize = usize::MAX;

pub struct SwapController {
    slots: [ProgramSlot; 3],
    current: AtomicUsize,
    previous: AtomicUsize,
    swap_pending: AtomicBool,
    swap_count: AtomicU64,
    /// Stamps submissions so the newest `Ready` slot wins
    submit_seq: AtomicU64,
    /// f32 bits; written by the VM, read by load-time arena validation
    sample_rate: AtomicU32,
    arena_capacity: usize,
}

impl SwapController {
    pub fn new(arena_capacity: usize) -> Self {
        SwapController {
            slots: [
                ProgramSlot::default(),
                ProgramSlot::default(),
                ProgramSlot::default(),
            ],
            current: AtomicUsize::new(NO_SLOT),
            previous: AtomicUsize::new(NO_SLOT),
            swap_pending: AtomicBool::new(false),
            swap_count: AtomicU64::new(0),
            submit_seq: AtomicU64::new(0),
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE.to_bits()),
            arena_capacity,
        }
    }

    pub(crate) fn set_sample_rate(&self, hz: f32) {
        self.sample_rate.store(hz.to_bits(), Ordering::Release);
    }

    // ---- producer API -----------------------------------------------------

    /// Claim the first `Empty` slot for writing
    ///
    /// Under correct triple-buffer use two slots are free and this succeeds;
    /// `SlotBusy` indicates producer over-submission.
    pub fn acquire_write_slot(&self) -> Result<WriteSlot<'_>, LoadResult> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.transition(SlotState::Empty, SlotState::Loading) {
                // the previous occupant's payload is stale; clear it here, on
                // the producer thread, where dropping init tables is allowed
                unsafe { slot.data_mut().clear() };
                return Ok(WriteSlot {
                    controller: self,
                    index,
                    submitted: false,
                });
            }
        }
        warn!("no free program slot; producer is over-submitting");
        Err(LoadResult::SlotBusy)
    }

    /// Convenience: decode, validate, populate, submit
    pub fn load_program(&self, bytecode: &[u8], inits: Vec<StateInit>) -> LoadResult {
        let instructions = match decode_program(bytecode) {
            Ok(instructions) => instructions,
            Err(err) => {
                warn!(?err, "rejected program at decode");
                return err;
            }
        };
        if inits.iter().any(|init| !init.within_capacity()) {
            warn!("rejected program: oversized state-init table");
            return LoadResult::InvalidProgram;
        }
        let signature = ProgramSignature::of(&instructions);
        if signature.state_id_count as usize > MAX_STATES {
            warn!(
                state_ids = signature.state_id_count,
                capacity = MAX_STATES,
                "rejected program: more unique state IDs than the pool holds"
            );
            return LoadResult::PoolFull;
        }
        let sample_rate = f32::from_bits(self.sample_rate.load(Ordering::Acquire));
        let demand = program_arena_demand(&instructions, sample_rate);
        if demand > self.arena_capacity {
            warn!(
                demand,
                capacity = self.arena_capacity,
                "rejected program: delay memory demand exceeds arena"
            );
            return LoadResult::TooLarge;
        }

        let mut slot = match self.acquire_write_slot() {
            Ok(slot) => slot,
            Err(err) => return err,
        };
        slot.data_mut().fill(&instructions, inits);
        slot.submit();
        debug!(
            instructions = signature.instruction_count,
            state_ids = signature.state_id_count,
            dag_hash = format_args!("{:08x}", signature.dag_hash),
            "program submitted"
        );
        LoadResult::Success
    }

    // ---- audio-thread API -------------------------------------------------

    /// Acquire-read of the pending flag; called once per block
    pub fn has_pending_swap(&self) -> bool {
        self.swap_pending.load(Ordering::Acquire)
    }

    /// Promote the newest `Ready` slot to `Active`, demote the old `Active`
    /// to `Fading`, and expose it via `previous_data`. The only mutation of
    /// the current/previous indices. Returns false if no `Ready` slot exists.
    pub fn execute_swap(&self) -> bool {
        let mut newest: Option<(usize, u64)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.state() == SlotState::Ready {
                let seq = slot.sequence();
                if newest.map_or(true, |(_, best)| seq > best) {
                    newest = Some((index, seq));
                }
            }
        }
        let Some((ready, _)) = newest else {
            // logic bug or a raced cancel; clear the flag and carry on
            self.swap_pending.store(false, Ordering::Release);
            return false;
        };

        // stale Ready submissions lose to the newest one
        for (index, slot) in self.slots.iter().enumerate() {
            if index != ready && slot.state() == SlotState::Ready {
                slot.clear_to_empty();
            }
        }

        // a previous slot still fading from the last swap is released now
        let prev = self.previous.load(Ordering::Acquire);
        if prev != NO_SLOT {
            self.previous.store(NO_SLOT, Ordering::Release);
            self.slots[prev].clear_to_empty();
        }

        let cur = self.current.load(Ordering::Acquire);
        if cur != NO_SLOT && self.slots[cur].transition(SlotState::Active, SlotState::Fading) {
            self.previous.store(cur, Ordering::Release);
        }

        self.slots[ready].transition(SlotState::Ready, SlotState::Active);
        self.current.store(ready, Ordering::Release);
        self.swap_pending.store(false, Ordering::Release);
        self.swap_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Payload of the `Active` slot
    ///
    /// Audio-thread only: the returned borrow is valid because only the audio
    /// thread retires `Active`/`Fading` slots.
    pub(crate) fn current_data(&self) -> Option<&SlotData> {
        let index = self.current.load(Ordering::Acquire);
        if index == NO_SLOT {
            None
        } else {
            Some(unsafe { self.slots[index].data() })
        }
    }

    /// Payload of the `Fading` slot, if a crossfade is in flight
    pub(crate) fn previous_data(&self) -> Option<&SlotData> {
        let index = self.previous.load(Ordering::Acquire);
        if index == NO_SLOT {
            None
        } else {
            Some(unsafe { self.slots[index].data() })
        }
    }

    /// Retire the `Fading` slot; called when the crossfader completes
    pub fn release_previous(&self) {
        let prev = self.previous.swap(NO_SLOT, Ordering::AcqRel);
        if prev != NO_SLOT {
            self.slots[prev].clear_to_empty();
        }
    }

    pub fn swap_count(&self) -> u64 {
        self.swap_count.load(Ordering::Acquire)
    }

    pub(crate) fn slot_states(&self) -> [SlotState; 3] {
        [
            self.slots[0].state(),
            self.slots[1].state(),
            self.slots[2].state(),
        ]
    }

    /// Initialization-only: clear every slot and install a program as the
    /// current one directly, bypassing the swap path. Not safe concurrently
    /// with `process_block`.
    pub(crate) fn install_immediate(&self, instructions: &[Instruction], inits: Vec<StateInit>) {
        for slot in &self.slots {
            slot.clear_to_empty();
            unsafe { slot.data_mut().clear() };
        }
        self.previous.store(NO_SLOT, Ordering::Release);
        self.swap_pending.store(false, Ordering::Release);
        unsafe { self.slots[0].data_mut().fill(instructions, inits) };
        self.slots[0].transition(SlotState::Empty, SlotState::Loading);
        self.slots[0].transition(SlotState::Loading, SlotState::Ready);
        self.slots[0].transition(SlotState::Ready, SlotState::Active);
        self.current.store(0, Ordering::Release);
    }

    /// Full reset to the just-constructed state
    pub(crate) fn reset(&self) {
        for slot in &self.slots {
            slot.clear_to_empty();
            unsafe { slot.data_mut().clear() };
        }
        self.current.store(NO_SLOT, Ordering::Release);
        self.previous.store(NO_SLOT, Ordering::Release);
        self.swap_pending.store(false, Ordering::Release);
    }
}

/// Scoped producer ownership of a `Loading` slot
///
/// Dropping without `submit` cancels the acquisition back to `Empty`, so a
/// producer that errors out mid-fill cannot wedge the triple buffer.
pub struct WriteSlot<'a> {
    controller: &'a SwapController,
    index: usize,
    submitted: bool,
}

impl<'a> WriteSlot<'a> {
    pub fn data_mut(&mut self) -> &mut SlotData {
        unsafe { self.controller.slots[self.index].data_mut() }
    }

    /// Publish the slot `Ready` and raise the pending flag
    pub fn submit(mut self) -> bool {
        let slot = &self.controller.slots[self.index];
        let seq = self.controller.submit_seq.fetch_add(1, Ordering::AcqRel) + 1;
        slot.set_sequence(seq);
        let ok = slot.transition(SlotState::Loading, SlotState::Ready);
        if ok {
            self.controller.swap_pending.store(true, Ordering::Release);
        }
        self.submitted = true;
        ok
    }
}

impl<'a> Drop for WriteSlot<'a> {
    fn drop(&mut self) {
        if !self.submitted {
            self.controller.slots[self.index].transition(SlotState::Loading, SlotState::Empty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, Opcode};
    use crate::program::encode_program;

    fn tiny_program(state_id: u32) -> Vec<u8> {
        encode_program(&[
            Instruction::new(Opcode::PushConst, 0).with_const(0.5),
            Instruction::new(Opcode::OscSin, 1)
                .with_inputs(&[0])
                .with_state(state_id),
            Instruction::new(Opcode::Output, 1).with_inputs(&[1]),
        ])
    }

    #[test]
    fn test_load_then_swap_promotes_slot() {
        let ctl = SwapController::new(1 << 20);
        assert_eq!(
            ctl.load_program(&tiny_program(1), Vec::new()),
            LoadResult::Success
        );
        assert!(ctl.has_pending_swap());
        assert!(ctl.execute_swap());
        assert!(!ctl.has_pending_swap());
        assert_eq!(ctl.swap_count(), 1);

        let states = ctl.slot_states();
        assert_eq!(
            states.iter().filter(|s| **s == SlotState::Active).count(),
            1,
            "exactly one Active slot after swap: {:?}",
            states
        );
        assert!(ctl.current_data().is_some());
        assert!(ctl.previous_data().is_none(), "first swap has no fading slot");
    }

    #[test]
    fn test_second_swap_demotes_previous() {
        let ctl = SwapController::new(1 << 20);
        ctl.load_program(&tiny_program(1), Vec::new());
        ctl.execute_swap();
        ctl.load_program(&tiny_program(2), Vec::new());
        ctl.execute_swap();

        assert_eq!(ctl.swap_count(), 2);
        let states = ctl.slot_states();
        assert_eq!(states.iter().filter(|s| **s == SlotState::Active).count(), 1);
        assert_eq!(states.iter().filter(|s| **s == SlotState::Fading).count(), 1);
        assert!(ctl.previous_data().is_some());

        ctl.release_previous();
        assert!(ctl.previous_data().is_none());
        let states = ctl.slot_states();
        assert_eq!(states.iter().filter(|s| **s == SlotState::Fading).count(), 0);
    }

    #[test]
    fn test_newest_ready_wins() {
        let ctl = SwapController::new(1 << 20);
        // two submissions before the audio thread gets a block in
        ctl.load_program(&tiny_program(1), Vec::new());
        ctl.load_program(&tiny_program(2), Vec::new());
        assert!(ctl.execute_swap());
        let data = ctl.current_data().unwrap();
        assert_eq!(data.state_ids, vec![2], "latest submission should win");
        // the stale Ready slot was discarded, so two slots are free again
        let states = ctl.slot_states();
        assert_eq!(states.iter().filter(|s| **s == SlotState::Empty).count(), 2);
    }

    #[test]
    fn test_slot_busy_on_oversubmission() {
        let ctl = SwapController::new(1 << 20);
        let a = ctl.acquire_write_slot().unwrap();
        let b = ctl.acquire_write_slot().unwrap();
        let c = ctl.acquire_write_slot().unwrap();
        assert!(matches!(ctl.acquire_write_slot(), Err(LoadResult::SlotBusy)));
        drop((a, b, c));
        // cancel-on-drop frees the slots again
        assert!(ctl.acquire_write_slot().is_ok());
    }

    #[test]
    fn test_execute_swap_without_ready_clears_flag() {
        let ctl = SwapController::new(1 << 20);
        // raise the flag by hand to model the raced-cancel case
        ctl.swap_pending.store(true, Ordering::Release);
        assert!(!ctl.execute_swap());
        assert!(!ctl.has_pending_swap());
    }

    #[test]
    fn test_concurrent_producers() {
        use std::sync::Arc;
        use std::thread;

        let ctl = Arc::new(SwapController::new(1 << 20));
        let mut handles = vec![];
        for t in 0..4u32 {
            let ctl = Arc::clone(&ctl);
            handles.push(thread::spawn(move || {
                let mut accepted = 0;
                for i in 0..200 {
                    let program = tiny_program(t * 1000 + i + 1);
                    if ctl.load_program(&program, Vec::new()) == LoadResult::Success {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        // consumer drains swaps like an audio callback would
        let consumer = {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || {
                for _ in 0..2000 {
                    if ctl.has_pending_swap() {
                        ctl.execute_swap();
                        ctl.release_previous();
                    }
                    std::hint::spin_loop();
                }
            })
        };
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        consumer.join().unwrap();
        assert!(accepted > 0, "at least some submissions must land");
        // drain whatever is still pending
        while ctl.has_pending_swap() {
            ctl.execute_swap();
            ctl.release_previous();
        }
        let states = ctl.slot_states();
        assert_eq!(states.iter().filter(|s| **s == SlotState::Active).count(), 1);
    }
}
