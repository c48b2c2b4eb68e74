//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::engine::{Context, Process, SimError, Signal, Step};
use crate::id::{EdgeId, TaskId};
use crate::reservation::ReservationHandle;
use crate::sim::{Scheduler, Wakeup};
use crate::time::{SimDuration, SimTime, time_from_f64};
use crate::transport::{Belt, BeltConfig, BeltError};
use slotmap::SlotMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

// ===========================================================================
// Time and id helpers
// ===========================================================================

pub fn t(v: f64) -> SimTime {
    time_from_f64(v)
}

/// Fresh task keys for driving stores and belts without an environment.
pub fn task_ids(n: usize) -> Vec<TaskId> {
    let mut tasks: SlotMap<TaskId, ()> = SlotMap::with_key();
    (0..n).map(|_| tasks.insert(())).collect()
}

pub fn belt_config(capacity: usize, speed: f64, item_length: f64, accumulating: bool) -> BeltConfig {
    BeltConfig::new(capacity, t(speed), t(item_length), accumulating)
}

// ===========================================================================
// Standalone belt driver
// ===========================================================================

/// Fire every timer due at or before `until`, routing belt wakeups to
/// `belt` and discarding the rest, then move the clock to `until`.
pub fn drive_belt<T>(
    belt: &mut Belt<T>,
    sched: &mut Scheduler,
    until: SimTime,
) -> Result<(), BeltError> {
    while let Some(at) = sched.peek_time() {
        if at > until {
            break;
        }
        let Some(fired) = sched.pop() else {
            break;
        };
        match fired.wakeup {
            Wakeup::PhaseElapsed { item, .. } => belt.on_phase_elapsed(sched, item)?,
            Wakeup::StallDue { item, .. } => belt.on_stall_due(sched, item)?,
            _ => {}
        }
    }
    sched.advance_to(until);
    Ok(())
}

// ===========================================================================
// Processes
// ===========================================================================

/// Timestamped record of items a process handled.
pub type SharedLog<T> = Rc<RefCell<Vec<(SimTime, T)>>>;

pub fn shared_log<T>() -> SharedLog<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Puts a fixed sequence of items into an edge, pausing `interval` after
/// each commit.
pub struct Feeder<T> {
    edge: EdgeId,
    items: VecDeque<T>,
    interval: SimDuration,
    pending: Option<ReservationHandle>,
}

impl<T> Feeder<T> {
    pub fn new(edge: EdgeId, items: impl IntoIterator<Item = T>, interval: SimDuration) -> Self {
        Self {
            edge,
            items: items.into_iter().collect(),
            interval,
            pending: None,
        }
    }

    fn request(&mut self, cx: &mut Context<'_, T>) -> Result<Step, SimError> {
        if self.items.is_empty() {
            return Ok(Step::Done);
        }
        self.pending = Some(cx.reserve_put(self.edge)?);
        Ok(Step::Continue)
    }
}

impl<T> Process<T> for Feeder<T> {
    fn resume(&mut self, cx: &mut Context<'_, T>, signal: Signal) -> Result<Step, SimError> {
        match signal {
            Signal::Start | Signal::Timeout(_) => self.request(cx),
            Signal::Granted(handle) if self.pending == Some(handle) => {
                self.pending = None;
                let item = self
                    .items
                    .pop_front()
                    .ok_or_else(|| cx.fail("feeder granted a put with nothing left"))?;
                cx.commit_put(handle, item)?;
                if self.items.is_empty() {
                    Ok(Step::Done)
                } else if self.interval > SimDuration::ZERO {
                    cx.timeout(self.interval)?;
                    Ok(Step::Continue)
                } else {
                    self.request(cx)
                }
            }
            Signal::Granted(_) => Ok(Step::Continue),
            Signal::Interrupted(_) => {
                if let Some(handle) = self.pending.take() {
                    cx.cancel_put(handle)?;
                }
                Ok(Step::Done)
            }
        }
    }

    fn name(&self) -> &str {
        "feeder"
    }
}

/// Takes items from an edge as soon as they are available and logs them.
pub struct Collector<T> {
    edge: EdgeId,
    log: SharedLog<T>,
    limit: Option<usize>,
    taken: usize,
    pending: Option<ReservationHandle>,
}

impl<T> Collector<T> {
    pub fn new(edge: EdgeId, log: SharedLog<T>) -> Self {
        Self {
            edge,
            log,
            limit: None,
            taken: 0,
            pending: None,
        }
    }

    /// Finish after taking `limit` items.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn request(&mut self, cx: &mut Context<'_, T>) -> Result<Step, SimError> {
        if self.limit.is_some_and(|limit| self.taken >= limit) {
            return Ok(Step::Done);
        }
        self.pending = Some(cx.reserve_get(self.edge)?);
        Ok(Step::Continue)
    }
}

impl<T> Process<T> for Collector<T> {
    fn resume(&mut self, cx: &mut Context<'_, T>, signal: Signal) -> Result<Step, SimError> {
        match signal {
            Signal::Start => self.request(cx),
            Signal::Granted(handle) if self.pending == Some(handle) => {
                self.pending = None;
                let item = cx.commit_get(handle)?;
                self.log.borrow_mut().push((cx.now(), item));
                self.taken += 1;
                self.request(cx)
            }
            Signal::Granted(_) | Signal::Timeout(_) => Ok(Step::Continue),
            Signal::Interrupted(_) => {
                if let Some(handle) = self.pending.take() {
                    cx.cancel_get(handle)?;
                }
                Ok(Step::Done)
            }
        }
    }

    fn name(&self) -> &str {
        "collector"
    }
}

enum RelayState<T> {
    Idle,
    /// Waiting for an upstream item.
    Getting(ReservationHandle),
    /// Holding an upstream item, waiting for downstream room.
    Putting {
        get: ReservationHandle,
        put: ReservationHandle,
    },
    /// Processing an item with downstream room already reserved.
    Working { item: T, put: ReservationHandle },
}

/// A single-slot machine: takes an item from `from`, holds it for `delay`,
/// and puts it into `to`. Both sides are reserved before the item moves.
pub struct Relay<T> {
    from: EdgeId,
    to: EdgeId,
    delay: SimDuration,
    state: RelayState<T>,
    processed: Rc<RefCell<usize>>,
}

impl<T> Relay<T> {
    pub fn new(from: EdgeId, to: EdgeId, delay: SimDuration) -> Self {
        Self {
            from,
            to,
            delay,
            state: RelayState::Idle,
            processed: Rc::new(RefCell::new(0)),
        }
    }

    /// Shared counter of items passed downstream.
    pub fn processed(&self) -> Rc<RefCell<usize>> {
        Rc::clone(&self.processed)
    }

    fn fetch(&mut self, cx: &mut Context<'_, T>) -> Result<Step, SimError> {
        self.state = RelayState::Getting(cx.reserve_get(self.from)?);
        Ok(Step::Continue)
    }

    fn deliver(&mut self, cx: &mut Context<'_, T>, put: ReservationHandle, item: T) -> Result<Step, SimError> {
        cx.commit_put(put, item)?;
        *self.processed.borrow_mut() += 1;
        self.fetch(cx)
    }
}

impl<T> Process<T> for Relay<T> {
    fn resume(&mut self, cx: &mut Context<'_, T>, signal: Signal) -> Result<Step, SimError> {
        let state = std::mem::replace(&mut self.state, RelayState::Idle);
        match (state, signal) {
            (RelayState::Idle, Signal::Start) => self.fetch(cx),
            (RelayState::Getting(get), Signal::Granted(h)) if h == get => {
                let put = cx.reserve_put(self.to)?;
                self.state = RelayState::Putting { get, put };
                Ok(Step::Continue)
            }
            (RelayState::Putting { get, put }, Signal::Granted(h)) if h == put => {
                let item = cx.commit_get(get)?;
                if self.delay > SimDuration::ZERO {
                    cx.timeout(self.delay)?;
                    self.state = RelayState::Working { item, put };
                    Ok(Step::Continue)
                } else {
                    self.deliver(cx, put, item)
                }
            }
            (RelayState::Working { item, put }, Signal::Timeout(_)) => self.deliver(cx, put, item),
            (state, Signal::Interrupted(_)) => {
                match state {
                    RelayState::Getting(get) => {
                        cx.cancel_get(get)?;
                    }
                    RelayState::Putting { get, put } => {
                        cx.cancel_get(get)?;
                        cx.cancel_put(put)?;
                    }
                    RelayState::Working { put, .. } => {
                        cx.cancel_put(put)?;
                    }
                    RelayState::Idle => {}
                }
                Ok(Step::Done)
            }
            (state, _) => {
                self.state = state;
                Ok(Step::Continue)
            }
        }
    }

    fn name(&self) -> &str {
        "relay"
    }
}
