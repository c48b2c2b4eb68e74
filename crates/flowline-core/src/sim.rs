//! Virtual clock and timer queue.
//!
//! The [`Scheduler`] is a min-heap of timers keyed by `(time, sequence)`.
//! Timers registered for the same instant fire in registration order, so a
//! run is reproducible from its inputs alone. Cancellation is lazy: the
//! wakeup is dropped from the timer table and the stale heap entry is skipped
//! when it surfaces.

use crate::id::{EdgeId, TaskId, TimerId, TransitId};
use crate::reservation::ReservationHandle;
use crate::time::{SimDuration, SimTime};
use log::trace;
use slotmap::SlotMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

// ---------------------------------------------------------------------------
// Wakeups
// ---------------------------------------------------------------------------

/// Why a task is being interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// Downstream is full and the belt carrying the task's item has stopped.
    Backpressure,
    /// The model is shutting the task down.
    Shutdown,
    Other(String),
}

/// Everything the environment can be woken by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    /// First activation of a freshly spawned task.
    Start { task: TaskId },
    /// A timed wait requested by the task has elapsed.
    Timeout { task: TaskId },
    /// A reservation owned by the task was granted.
    Granted {
        task: TaskId,
        handle: ReservationHandle,
    },
    Interrupted {
        task: TaskId,
        reason: InterruptReason,
    },
    /// The current transit phase of a belt item has run to completion.
    PhaseElapsed { edge: EdgeId, item: TransitId },
    /// A delayed stall on an accumulating belt has come due.
    StallDue { edge: EdgeId, item: TransitId },
    /// An item held in a delayed buffer may now be taken.
    ItemReady { edge: EdgeId, seq: u64 },
}

/// A timer that has fired, as returned by [`Scheduler::pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired {
    pub at: SimTime,
    pub timer: TimerId,
    pub wakeup: Wakeup,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("cannot schedule at {at} (clock is at {now})")]
    InPast { at: SimTime, now: SimTime },
    #[error("cannot schedule a negative duration {duration}")]
    NegativeDuration { duration: SimDuration },
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Scheduler {
    now: SimTime,
    next_seq: u64,
    heap: BinaryHeap<Reverse<(SimTime, u64, TimerId)>>,
    timers: SlotMap<TimerId, Wakeup>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Register `wakeup` to fire at the absolute time `at`.
    pub fn schedule_at(&mut self, at: SimTime, wakeup: Wakeup) -> Result<TimerId, ScheduleError> {
        if at < self.now {
            return Err(ScheduleError::InPast { at, now: self.now });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        trace!("t={}: timer for {:?} at {}", self.now, wakeup, at);
        let timer = self.timers.insert(wakeup);
        self.heap.push(Reverse((at, seq, timer)));
        Ok(timer)
    }

    /// Register `wakeup` to fire `duration` from now.
    pub fn schedule_timeout(
        &mut self,
        duration: SimDuration,
        wakeup: Wakeup,
    ) -> Result<TimerId, ScheduleError> {
        if duration < SimDuration::ZERO {
            return Err(ScheduleError::NegativeDuration { duration });
        }
        self.schedule_at(self.now + duration, wakeup)
    }

    /// Register `wakeup` at the current instant, after everything already
    /// scheduled for it.
    pub fn schedule_now(&mut self, wakeup: Wakeup) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let timer = self.timers.insert(wakeup);
        self.heap.push(Reverse((self.now, seq, timer)));
        timer
    }

    /// Drop a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, timer: TimerId) -> bool {
        self.timers.remove(timer).is_some()
    }

    pub fn is_pending(&self, timer: TimerId) -> bool {
        self.timers.contains_key(timer)
    }

    /// The wakeup a live timer will deliver.
    pub fn wakeup(&self, timer: TimerId) -> Option<&Wakeup> {
        self.timers.get(timer)
    }

    /// Number of live timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Time of the earliest live timer.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Fire the earliest live timer, advancing the clock to its time.
    pub fn pop(&mut self) -> Option<Fired> {
        while let Some(Reverse((at, _, timer))) = self.heap.pop() {
            if let Some(wakeup) = self.timers.remove(timer) {
                self.now = at;
                return Some(Fired { at, timer, wakeup });
            }
        }
        None
    }

    /// Move the clock forward without firing anything. Times before the
    /// earliest live timer only; earlier or past targets are ignored.
    pub fn advance_to(&mut self, at: SimTime) {
        let limit = self.peek_time().unwrap_or(at);
        if at > self.now && at <= limit {
            self.now = at;
        }
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, _, timer))) = self.heap.peek() {
            if self.timers.contains_key(*timer) {
                break;
            }
            self.heap.pop();
        }
    }
}
