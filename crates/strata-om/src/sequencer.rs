//! Log-order admission for concurrently applied commands
//!
//! Commands run on many threads, but two points must follow log order:
//! taking the resource locks and handing the mutation to the flush
//! pipeline. A command is admitted when `apply` starts. It may take its
//! locks once every lower admitted index holds its own, and may enqueue
//! once every lower admitted index has enqueued.
//!
//! Lock acquisition in log order keeps per-entity mutations in log order.
//! Enqueue in log order means a durable index never covers a command that
//! has not been applied yet. A lower index never waits on a higher one, so
//! the two gates cannot deadlock with the lock manager.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use strata_common::LogIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Admitted,
    Locked,
}

/// Admission order is the tie-breaker for equal indexes
type Slot = (LogIndex, u64);

#[derive(Default)]
struct SequencerState {
    next_seq: u64,
    in_flight: BTreeMap<Slot, Stage>,
    last_enqueued: LogIndex,
}

impl SequencerState {
    /// Any strictly lower index still short of `stage`
    fn lower_before(&self, log_index: LogIndex, stage: Option<Stage>) -> bool {
        self.in_flight
            .range(..(log_index, 0))
            .any(|(_, s)| stage.is_none_or(|stage| *s < stage))
    }
}

#[derive(Default)]
pub struct ApplySequencer {
    state: Mutex<SequencerState>,
    turn: Condvar,
}

impl ApplySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command; callers admit in log order
    pub fn admit(&self, log_index: LogIndex) -> ApplyTicket<'_> {
        let mut state = self.state.lock();
        let slot = (log_index, state.next_seq);
        state.next_seq += 1;
        state.in_flight.insert(slot, Stage::Admitted);
        ApplyTicket {
            sequencer: self,
            slot,
        }
    }

    /// Commands admitted and not yet enqueued
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Highest log index handed to the flush pipeline
    pub fn last_enqueued(&self) -> LogIndex {
        self.state.lock().last_enqueued
    }

    fn advance(&self, slot: Slot, stage: Stage) {
        let mut state = self.state.lock();
        if let Some(current) = state.in_flight.get_mut(&slot) {
            if *current < stage {
                *current = stage;
                self.turn.notify_all();
            }
        }
    }

    fn wait_for_lower(&self, log_index: LogIndex, stage: Option<Stage>) {
        let mut state = self.state.lock();
        while state.lower_before(log_index, stage) {
            self.turn.wait(&mut state);
        }
    }
}

/// Place of one command in the apply order. Dropping it retires the
/// command, so a failing command never stalls the ones behind it.
pub struct ApplyTicket<'a> {
    sequencer: &'a ApplySequencer,
    slot: Slot,
}

impl ApplyTicket<'_> {
    pub fn log_index(&self) -> LogIndex {
        self.slot.0
    }

    /// Block until every lower index holds its locks
    pub fn wait_to_lock(&self) {
        self.sequencer
            .wait_for_lower(self.log_index(), Some(Stage::Locked));
    }

    /// Locks are held; higher indexes may start locking
    pub fn locked(&self) {
        self.sequencer.advance(self.slot, Stage::Locked);
    }

    /// A higher index already reached the flush pipeline. Only happens
    /// when commands were admitted out of log order.
    pub fn overtaken_by(&self) -> Option<LogIndex> {
        let last = self.sequencer.state.lock().last_enqueued;
        (last > self.log_index()).then_some(last)
    }

    /// Wait for every lower index to enqueue, then run `enqueue` and
    /// retire the ticket
    pub fn enqueue<T>(self, enqueue: impl FnOnce() -> T) -> T {
        self.locked();
        self.sequencer.wait_for_lower(self.log_index(), None);
        let result = enqueue();
        {
            let mut state = self.sequencer.state.lock();
            state.last_enqueued = state.last_enqueued.max(self.log_index());
        }
        result
    }
}

impl Drop for ApplyTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.sequencer.state.lock();
        state.in_flight.remove(&self.slot);
        self.sequencer.turn.notify_all();
    }
}
