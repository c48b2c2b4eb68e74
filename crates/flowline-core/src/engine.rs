//! The simulation environment: owns the clock, the edges and the processes,
//! and delivers wakeups in virtual-time order.
//!
//! # Processes
//!
//! Active stages (sources, machines, sinks) implement [`Process`]. A process
//! is an explicit state machine: the environment calls
//! [`Process::resume`] with the [`Signal`] that woke it, the process acts on
//! the edges through its [`Context`], arranges its next wakeup (a timeout, a
//! reservation grant) and returns. Every suspension point is a wakeup
//! delivered by the scheduler:
//!
//! - `Signal::Start` once after [`Environment::spawn`],
//! - `Signal::Timeout` when a [`Context::timeout`] elapses,
//! - `Signal::Granted` when one of the task's reservations is granted,
//! - `Signal::Interrupted` after [`Environment::interrupt`].
//!
//! Reserve calls never block: they return a handle immediately and the grant
//! arrives later as a signal, at the virtual time it was issued.
//!
//! # Errors
//!
//! Contract violations on any edge terminate the run. [`Environment::step`]
//! and the `run*` methods return them as [`SimError::Edge`] carrying the
//! edge id and the virtual time of the violation.

use crate::edge::{Edge, EdgeError, EdgeState};
use crate::id::{EdgeId, TaskId, TimerId};
use crate::reservation::{ReservationHandle, ReservationKind};
use crate::sim::{InterruptReason, ScheduleError, Scheduler, Wakeup};
use crate::stats::{OccupancyStats, StateTimes};
use crate::store::{ReservableStore, StoreMode};
use crate::time::{SimDuration, SimTime};
use crate::transport::{Belt, BeltConfig};
use log::{debug, trace};
use slotmap::SlotMap;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Process model
// ---------------------------------------------------------------------------

/// Why a process is being resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Start,
    Timeout(TimerId),
    Granted(ReservationHandle),
    Interrupted(InterruptReason),
}

/// What a process wants after handling a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep the task alive; it has arranged its next wakeup.
    Continue,
    /// The task is finished. Its outstanding timeouts are dropped and the
    /// reservations it still holds are withdrawn.
    Done,
}

/// A suspendable simulation task.
pub trait Process<T> {
    fn resume(&mut self, cx: &mut Context<'_, T>, signal: Signal) -> Result<Step, SimError>;

    /// Label used in logs and error reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

struct TaskSlot<T> {
    name: String,
    /// Taken out while the process is running.
    process: Option<Box<dyn Process<T>>>,
    timers: Vec<TimerId>,
    /// Reservations issued to the task and not yet committed or cancelled.
    handles: Vec<ReservationHandle>,
}

impl<T> fmt::Debug for TaskSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("name", &self.name)
            .field("running", &self.process.is_none())
            .field("timers", &self.timers)
            .field("handles", &self.handles)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    #[error("t={time}: edge {edge:?}: {source}")]
    Edge {
        edge: EdgeId,
        time: SimTime,
        #[source]
        source: EdgeError,
    },
    #[error("no edge {0:?}")]
    UnknownEdge(EdgeId),
    #[error("edge {0:?} is not a conveyor")]
    NotAConveyor(EdgeId),
    #[error("no live task {0:?}")]
    UnknownTask(TaskId),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("t={time}: task {task:?} failed: {message}")]
    Process {
        task: TaskId,
        time: SimTime,
        message: String,
    },
}

/// Summary of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub now: SimTime,
    pub events_processed: u64,
    pub tasks_finished: u64,
    pub live_tasks: usize,
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Environment<T> {
    sched: Scheduler,
    /// Indexed by `EdgeId`.
    edges: Vec<Edge<T>>,
    stats: Vec<OccupancyStats>,
    states: Vec<StateTimes<EdgeState>>,
    tasks: SlotMap<TaskId, TaskSlot<T>>,
    events_processed: u64,
    tasks_finished: u64,
}

impl<T> Default for Environment<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Environment<T> {
    pub fn new() -> Self {
        Self {
            sched: Scheduler::new(),
            edges: Vec::new(),
            stats: Vec::new(),
            states: Vec::new(),
            tasks: SlotMap::with_key(),
            events_processed: 0,
            tasks_finished: 0,
        }
    }

    pub fn now(&self) -> SimTime {
        self.sched.now()
    }

    // -----------------------------------------------------------------------
    // Model building
    // -----------------------------------------------------------------------

    pub fn add_buffer(&mut self, capacity: usize, mode: StoreMode) -> EdgeId {
        let id = self.next_edge_id();
        self.push_edge(Edge::Buffer(ReservableStore::new(id, capacity, mode)));
        id
    }

    /// Add a buffer whose items can only be taken `delay` after they were
    /// put.
    pub fn add_delayed_buffer(
        &mut self,
        capacity: usize,
        mode: StoreMode,
        delay: SimDuration,
    ) -> Result<EdgeId, SimError> {
        if delay < SimDuration::ZERO {
            return Err(ScheduleError::NegativeDuration { duration: delay }.into());
        }
        let id = self.next_edge_id();
        let store = ReservableStore::new(id, capacity, mode).with_delay(delay);
        self.push_edge(Edge::Buffer(store));
        Ok(id)
    }

    pub fn add_conveyor(&mut self, config: BeltConfig) -> Result<EdgeId, SimError> {
        let id = self.next_edge_id();
        let belt = Belt::new(id, config).map_err(|source| SimError::Edge {
            edge: id,
            time: self.sched.now(),
            source: source.into(),
        })?;
        self.push_edge(Edge::Conveyor(belt));
        Ok(id)
    }

    /// Register a process. It receives `Signal::Start` at the current time.
    pub fn spawn<P>(&mut self, process: P) -> TaskId
    where
        P: Process<T> + 'static,
    {
        let name = process.name().to_string();
        let task = self.tasks.insert(TaskSlot {
            name,
            process: Some(Box::new(process)),
            timers: Vec::new(),
            handles: Vec::new(),
        });
        self.sched.schedule_now(Wakeup::Start { task });
        debug!("t={}: spawned {:?} ({})", self.now(), task, self.task_name(task).unwrap_or("?"));
        task
    }

    /// Cancel the task's outstanding timeouts and deliver
    /// `Signal::Interrupted` at the current time. Reservations the task holds
    /// are left for it to cancel.
    pub fn interrupt(&mut self, task: TaskId, reason: InterruptReason) -> Result<(), SimError> {
        let slot = self.tasks.get_mut(task).ok_or(SimError::UnknownTask(task))?;
        for timer in slot.timers.drain(..) {
            self.sched.cancel(timer);
        }
        debug!("t={}: interrupting {:?} ({:?})", self.sched.now(), task, reason);
        self.sched.schedule_now(Wakeup::Interrupted { task, reason });
        Ok(())
    }

    /// Assert or release downstream backpressure on a conveyor.
    pub fn notify_backpressure(&mut self, edge: EdgeId, on: bool) -> Result<(), SimError> {
        let now = self.sched.now();
        let belt = belt_mut(&mut self.edges, edge)?;
        let result = belt.notify_backpressure(&mut self.sched, on);
        result.map_err(|source| SimError::Edge { edge, time: now, source: source.into() })?;
        self.touch(edge);
        Ok(())
    }

    /// Release asserted backpressure on a conveyor. Returns whether it is
    /// moving afterwards.
    pub fn resume_belt(&mut self, edge: EdgeId) -> Result<bool, SimError> {
        let now = self.sched.now();
        let belt = belt_mut(&mut self.edges, edge)?;
        let moving = belt
            .resume(&mut self.sched)
            .map_err(|source| SimError::Edge { edge, time: now, source: source.into() })?;
        self.touch(edge);
        Ok(moving)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Deliver the next wakeup. Returns false when nothing is scheduled.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let Some(fired) = self.sched.pop() else {
            return Ok(false);
        };
        self.events_processed += 1;
        trace!("t={}: {:?}", fired.at, fired.wakeup);
        match fired.wakeup {
            Wakeup::Start { task } => self.deliver(task, Signal::Start)?,
            Wakeup::Timeout { task } => {
                if let Some(slot) = self.tasks.get_mut(task) {
                    slot.timers.retain(|&t| t != fired.timer);
                }
                self.deliver(task, Signal::Timeout(fired.timer))?;
            }
            Wakeup::Granted { task, handle } => {
                let live = self
                    .edges
                    .get(handle.edge.0 as usize)
                    .is_some_and(|edge| edge.is_granted(handle));
                if !live {
                    debug!("t={}: dropping stale grant {:?} for {:?}", fired.at, handle, task);
                } else if !self.tasks.contains_key(task) {
                    self.withdraw(task, &[handle])?;
                } else {
                    self.deliver(task, Signal::Granted(handle))?;
                }
            }
            Wakeup::Interrupted { task, reason } => {
                self.deliver(task, Signal::Interrupted(reason))?;
            }
            Wakeup::PhaseElapsed { edge, item } => {
                let belt = belt_mut(&mut self.edges, edge)?;
                let result = belt.on_phase_elapsed(&mut self.sched, item);
                result.map_err(|source| SimError::Edge { edge, time: fired.at, source: source.into() })?;
                self.touch(edge);
            }
            Wakeup::StallDue { edge, item } => {
                let belt = belt_mut(&mut self.edges, edge)?;
                let result = belt.on_stall_due(&mut self.sched, item);
                result.map_err(|source| SimError::Edge { edge, time: fired.at, source: source.into() })?;
                self.touch(edge);
            }
            Wakeup::ItemReady { edge, seq } => {
                let store = self
                    .edges
                    .get_mut(edge.0 as usize)
                    .and_then(Edge::as_buffer_mut)
                    .ok_or(SimError::UnknownEdge(edge))?;
                if !store.release(seq) {
                    debug!("t={}: edge {:?} no longer holds item {}", fired.at, edge, seq);
                }
                self.touch(edge);
            }
        }
        Ok(true)
    }

    /// Deliver every wakeup scheduled at or before `until`, then move the
    /// clock to `until`.
    pub fn run_until(&mut self, until: SimTime) -> Result<RunReport, SimError> {
        while let Some(at) = self.sched.peek_time() {
            if at > until {
                break;
            }
            self.step()?;
        }
        self.sched.advance_to(until);
        Ok(self.report())
    }

    /// Deliver wakeups until none are left. Does not return for models with
    /// endless processes; use [`Environment::run_until`] for those.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        while self.step()? {}
        Ok(self.report())
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            now: self.sched.now(),
            events_processed: self.events_processed,
            tasks_finished: self.tasks_finished,
            live_tasks: self.tasks.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn edge(&self, id: EdgeId) -> Option<&Edge<T>> {
        self.edges.get(id.0 as usize)
    }

    pub fn edges(&self) -> &[Edge<T>] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Time-weighted average item count of an edge since time zero.
    pub fn occupancy_average(&self, id: EdgeId) -> Option<f64> {
        self.stats.get(id.0 as usize).map(|s| s.average(self.now()))
    }

    /// Virtual time an edge has spent in `state` since it was added.
    pub fn time_in_state(&self, id: EdgeId, state: EdgeState) -> Option<SimDuration> {
        self.states.get(id.0 as usize).map(|s| s.time_in(state, self.now()))
    }

    /// Virtual time per state visited by an edge since it was added.
    pub fn state_times(&self, id: EdgeId) -> Option<BTreeMap<EdgeState, SimDuration>> {
        self.states.get(id.0 as usize).map(|s| s.totals(self.now()))
    }

    pub fn is_live(&self, task: TaskId) -> bool {
        self.tasks.contains_key(task)
    }

    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.tasks.get(task).map(|slot| slot.name.as_str())
    }

    pub fn pending_events(&self) -> usize {
        self.sched.pending()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn deliver(&mut self, task: TaskId, signal: Signal) -> Result<(), SimError> {
        let Some(mut process) = self.tasks.get_mut(task).and_then(|slot| slot.process.take())
        else {
            trace!("t={}: {:?} is gone, dropping {:?}", self.now(), task, signal);
            return Ok(());
        };
        let step = process.resume(&mut Context { env: self, task }, signal);
        match step {
            Ok(Step::Done) => {
                if let Some(slot) = self.tasks.remove(task) {
                    for timer in slot.timers {
                        self.sched.cancel(timer);
                    }
                    debug!("t={}: {:?} ({}) finished", self.now(), task, slot.name);
                    self.withdraw(task, &slot.handles)?;
                }
                self.tasks_finished += 1;
                Ok(())
            }
            // A failed task stays registered.
            Ok(Step::Continue) | Err(_) => {
                if let Some(slot) = self.tasks.get_mut(task) {
                    slot.process = Some(process);
                }
                step.map(|_| ())
            }
        }
    }

    /// Cancel reservations that no live task will ever commit.
    fn withdraw(&mut self, task: TaskId, handles: &[ReservationHandle]) -> Result<(), SimError> {
        let now = self.sched.now();
        for &handle in handles {
            let edge = handle.edge;
            let Some(target) = self.edges.get_mut(edge.0 as usize) else {
                continue;
            };
            if target.status(handle).is_none() {
                continue;
            }
            let cancelled = match handle.kind {
                ReservationKind::Put => target.cancel_put(handle),
                ReservationKind::Get => target.cancel_get(handle),
            };
            cancelled.map_err(|source| SimError::Edge { edge, time: now, source })?;
            debug!("t={}: withdrew {:?} left behind by {:?}", now, handle, task);
            self.touch(edge);
        }
        Ok(())
    }

    /// Deliver the edge's new grants and record its occupancy and state.
    fn touch(&mut self, edge: EdgeId) {
        let idx = edge.0 as usize;
        let Some(e) = self.edges.get_mut(idx) else {
            return;
        };
        for grant in e.drain_grants() {
            self.sched.schedule_now(Wakeup::Granted {
                task: grant.owner,
                handle: grant.handle,
            });
        }
        let (level, state) = (e.len(), e.state());
        let now = self.sched.now();
        if let Some(stats) = self.stats.get_mut(idx) {
            stats.record(now, level);
        }
        if let Some(states) = self.states.get_mut(idx) {
            states.record(now, state);
        }
    }

    fn next_edge_id(&self) -> EdgeId {
        EdgeId(self.edges.len() as u32)
    }

    fn push_edge(&mut self, edge: Edge<T>) {
        debug!("edge {:?}: added {} of capacity {}", edge.id(), edge.kind(), edge.capacity());
        let now = self.sched.now();
        self.states.push(StateTimes::new(edge.state(), now));
        self.edges.push(edge);
        let mut stats = OccupancyStats::new();
        stats.record(now, 0);
        self.stats.push(stats);
    }

    fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge<T>, SimError> {
        self.edges.get_mut(id.0 as usize).ok_or(SimError::UnknownEdge(id))
    }
}

fn belt_mut<T>(edges: &mut [Edge<T>], id: EdgeId) -> Result<&mut Belt<T>, SimError> {
    edges
        .get_mut(id.0 as usize)
        .ok_or(SimError::UnknownEdge(id))?
        .as_belt_mut()
        .ok_or(SimError::NotAConveyor(id))
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A running task's view of the environment. Every reservation made through
/// a context is owned by the task it was handed to.
pub struct Context<'a, T> {
    env: &'a mut Environment<T>,
    task: TaskId,
}

impl<T> Context<'_, T> {
    pub fn now(&self) -> SimTime {
        self.env.now()
    }

    /// The task being resumed.
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge<T>> {
        self.env.edge(id)
    }

    pub fn reserve_put(&mut self, edge: EdgeId) -> Result<ReservationHandle, SimError> {
        self.reserve_put_with_priority(edge, 0)
    }

    pub fn reserve_put_with_priority(
        &mut self,
        edge: EdgeId,
        priority: i32,
    ) -> Result<ReservationHandle, SimError> {
        let handle = self.env.edge_mut(edge)?.reserve_put_with_priority(self.task, priority);
        self.track(handle);
        self.env.touch(edge);
        Ok(handle)
    }

    pub fn commit_put(&mut self, handle: ReservationHandle, item: T) -> Result<(), SimError> {
        let env = &mut *self.env;
        let edge = handle.edge;
        let time = env.sched.now();
        let target = env.edges.get_mut(edge.0 as usize).ok_or(SimError::UnknownEdge(edge))?;
        target
            .commit_put(&mut env.sched, self.task, handle, item)
            .map_err(|source| SimError::Edge { edge, time, source })?;
        env.touch(edge);
        self.forget(handle);
        Ok(())
    }

    pub fn cancel_put(&mut self, handle: ReservationHandle) -> Result<bool, SimError> {
        let time = self.now();
        let cancelled = self
            .env
            .edge_mut(handle.edge)?
            .cancel_put(handle)
            .map_err(|source| SimError::Edge { edge: handle.edge, time, source })?;
        self.env.touch(handle.edge);
        self.forget(handle);
        Ok(cancelled)
    }

    pub fn reserve_get(&mut self, edge: EdgeId) -> Result<ReservationHandle, SimError> {
        self.reserve_get_with_priority(edge, 0)
    }

    pub fn reserve_get_with_priority(
        &mut self,
        edge: EdgeId,
        priority: i32,
    ) -> Result<ReservationHandle, SimError> {
        let handle = self.env.edge_mut(edge)?.reserve_get_with_priority(self.task, priority);
        self.track(handle);
        self.env.touch(edge);
        Ok(handle)
    }

    pub fn commit_get(&mut self, handle: ReservationHandle) -> Result<T, SimError> {
        let env = &mut *self.env;
        let edge = handle.edge;
        let time = env.sched.now();
        let from = env.edges.get_mut(edge.0 as usize).ok_or(SimError::UnknownEdge(edge))?;
        let item = from
            .commit_get(&mut env.sched, self.task, handle)
            .map_err(|source| SimError::Edge { edge, time, source })?;
        env.touch(edge);
        self.forget(handle);
        Ok(item)
    }

    pub fn cancel_get(&mut self, handle: ReservationHandle) -> Result<bool, SimError> {
        let time = self.now();
        let cancelled = self
            .env
            .edge_mut(handle.edge)?
            .cancel_get(handle)
            .map_err(|source| SimError::Edge { edge: handle.edge, time, source })?;
        self.env.touch(handle.edge);
        self.forget(handle);
        Ok(cancelled)
    }

    /// Cancel a reservation of either kind.
    pub fn cancel(&mut self, handle: ReservationHandle) -> Result<bool, SimError> {
        match handle.kind {
            ReservationKind::Put => self.cancel_put(handle),
            ReservationKind::Get => self.cancel_get(handle),
        }
    }

    pub fn can_put(&self, edge: EdgeId) -> Result<bool, SimError> {
        self.env.edge(edge).map(Edge::can_put).ok_or(SimError::UnknownEdge(edge))
    }

    pub fn can_get(&self, edge: EdgeId) -> Result<bool, SimError> {
        self.env.edge(edge).map(Edge::can_get).ok_or(SimError::UnknownEdge(edge))
    }

    pub fn is_granted(&self, handle: ReservationHandle) -> bool {
        self.env.edge(handle.edge).is_some_and(|e| e.is_granted(handle))
    }

    /// Wake this task with `Signal::Timeout` after `duration`.
    pub fn timeout(&mut self, duration: SimDuration) -> Result<TimerId, SimError> {
        let task = self.task;
        let timer = self.env.sched.schedule_timeout(duration, Wakeup::Timeout { task })?;
        if let Some(slot) = self.env.tasks.get_mut(task) {
            slot.timers.push(timer);
        }
        Ok(timer)
    }

    pub fn cancel_timeout(&mut self, timer: TimerId) -> bool {
        if let Some(slot) = self.env.tasks.get_mut(self.task) {
            slot.timers.retain(|&t| t != timer);
        }
        self.env.sched.cancel(timer)
    }

    pub fn interrupt(&mut self, task: TaskId, reason: InterruptReason) -> Result<(), SimError> {
        self.env.interrupt(task, reason)
    }

    pub fn spawn<P>(&mut self, process: P) -> TaskId
    where
        P: Process<T> + 'static,
    {
        self.env.spawn(process)
    }

    pub fn notify_backpressure(&mut self, edge: EdgeId, on: bool) -> Result<(), SimError> {
        self.env.notify_backpressure(edge, on)
    }

    pub fn resume_belt(&mut self, edge: EdgeId) -> Result<bool, SimError> {
        self.env.resume_belt(edge)
    }

    fn track(&mut self, handle: ReservationHandle) {
        if let Some(slot) = self.env.tasks.get_mut(self.task) {
            slot.handles.push(handle);
        }
    }

    fn forget(&mut self, handle: ReservationHandle) {
        if let Some(slot) = self.env.tasks.get_mut(self.task) {
            slot.handles.retain(|&h| h != handle);
        }
    }

    /// Build a process failure report for this task.
    pub fn fail(&self, message: impl Into<String>) -> SimError {
        SimError::Process {
            task: self.task,
            time: self.now(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::ReservationError;
    use crate::store::StoreError;
    use crate::test_utils::{Collector, Feeder, Relay, belt_config, shared_log, t};

    fn times<T: Clone>(log: &crate::test_utils::SharedLog<T>) -> Vec<(SimTime, T)> {
        log.borrow().clone()
    }

    #[test]
    fn buffer_line_delivers_in_order() {
        let mut env = Environment::new();
        let buf = env.add_buffer(2, StoreMode::Fifo);
        let log = shared_log();
        env.spawn(Feeder::new(buf, [1u32, 2, 3, 4], t(1.0)));
        env.spawn(Collector::new(buf, log.clone()).with_limit(4));

        let report = env.run().unwrap();
        assert_eq!(
            times(&log),
            vec![(t(0.0), 1), (t(1.0), 2), (t(2.0), 3), (t(3.0), 4)]
        );
        assert_eq!(report.tasks_finished, 2);
        assert_eq!(report.live_tasks, 0);
    }

    #[test]
    fn belt_line_spaces_and_delays_items() {
        let mut env = Environment::new();
        let belt = env.add_conveyor(belt_config(4, 1.0, 1.0, false)).unwrap();
        let log = shared_log();
        env.spawn(Feeder::new(belt, ["a", "b", "c"], SimDuration::ZERO));
        env.spawn(Collector::new(belt, log.clone()).with_limit(3));

        env.run().unwrap();
        assert_eq!(
            times(&log),
            vec![(t(4.0), "a"), (t(5.0), "b"), (t(6.0), "c")]
        );
    }

    #[test]
    fn slow_consumer_backs_up_an_accumulating_belt() {
        let mut env = Environment::new();
        let belt = env.add_conveyor(belt_config(3, 1.0, 1.0, true)).unwrap();
        let out = env.add_buffer(1, StoreMode::Fifo);
        let log = shared_log();
        env.spawn(Feeder::new(belt, 0..6u32, SimDuration::ZERO));
        let relay = Relay::new(belt, out, t(4.0));
        let processed = relay.processed();
        env.spawn(relay);
        env.spawn(Collector::new(out, log.clone()));

        env.run().unwrap();
        let items: Vec<u32> = times(&log).into_iter().map(|(_, item)| item).collect();
        assert_eq!(items, (0..6).collect::<Vec<_>>());
        assert_eq!(*processed.borrow(), 6);
        let stamps: Vec<SimTime> = times(&log).into_iter().map(|(at, _)| at).collect();
        assert!(stamps.windows(2).all(|w| w[1] - w[0] >= t(4.0)));
    }

    #[test]
    fn relay_line_holds_each_item_for_its_delay() {
        let mut env = Environment::new();
        let input = env.add_buffer(1, StoreMode::Fifo);
        let output = env.add_buffer(1, StoreMode::Fifo);
        let log = shared_log();
        env.spawn(Feeder::new(input, [1u32, 2, 3], SimDuration::ZERO));
        env.spawn(Relay::new(input, output, t(2.0)));
        env.spawn(Collector::new(output, log.clone()));

        env.run().unwrap();
        assert_eq!(times(&log), vec![(t(2.0), 1), (t(4.0), 2), (t(6.0), 3)]);
    }

    #[test]
    fn interrupt_retracts_pending_reservations() {
        let mut env: Environment<u32> = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        let collector = env.spawn(Collector::new(buf, shared_log()));
        env.run_until(t(5.0)).unwrap();
        assert_eq!(env.edge(buf).and_then(Edge::as_buffer).map(|b| b.pending_gets()), Some(1));

        env.interrupt(collector, InterruptReason::Shutdown).unwrap();
        env.run().unwrap();
        assert!(!env.is_live(collector));
        assert_eq!(env.edge(buf).and_then(Edge::as_buffer).map(|b| b.pending_gets()), Some(0));
        assert_eq!(env.now(), t(5.0));
        assert!(matches!(
            env.interrupt(collector, InterruptReason::Shutdown),
            Err(SimError::UnknownTask(_))
        ));
    }

    struct Rogue {
        edge: EdgeId,
    }

    impl Process<u32> for Rogue {
        fn resume(&mut self, cx: &mut Context<'_, u32>, signal: Signal) -> Result<Step, SimError> {
            match signal {
                Signal::Start => {
                    cx.timeout(t(2.0))?;
                    Ok(Step::Continue)
                }
                _ => {
                    let handle = cx.reserve_get(self.edge)?;
                    cx.commit_get(handle)?;
                    Ok(Step::Done)
                }
            }
        }
    }

    #[test]
    fn contract_violation_terminates_the_run_with_context() {
        let mut env = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        env.spawn(Rogue { edge: buf });
        let err = env.run().unwrap_err();
        match err {
            SimError::Edge { edge, time, source } => {
                assert_eq!(edge, buf);
                assert_eq!(time, t(2.0));
                assert!(matches!(
                    source,
                    EdgeError::Store(StoreError::Reservation(ReservationError::NotGranted { .. }))
                ));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    /// Takes a grant and immediately cancels it, recording every signal.
    struct Fickle {
        edge: EdgeId,
        signals: std::rc::Rc<std::cell::RefCell<Vec<Signal>>>,
    }

    impl Process<u32> for Fickle {
        fn resume(&mut self, cx: &mut Context<'_, u32>, signal: Signal) -> Result<Step, SimError> {
            self.signals.borrow_mut().push(signal.clone());
            if signal == Signal::Start {
                let handle = cx.reserve_put(self.edge)?;
                assert!(cx.is_granted(handle));
                cx.cancel(handle)?;
            }
            Ok(Step::Continue)
        }
    }

    #[test]
    fn grants_cancelled_before_delivery_are_dropped() {
        let mut env = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        let signals = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let task = env.spawn(Fickle {
            edge: buf,
            signals: signals.clone(),
        });
        env.run().unwrap();
        assert_eq!(*signals.borrow(), vec![Signal::Start]);
        assert!(env.is_live(task));
        assert!(env.edge(buf).is_some_and(Edge::can_put));
    }

    /// Reserves on an edge and finishes without committing.
    struct Quitter {
        edge: EdgeId,
        kind: ReservationKind,
    }

    impl Process<u32> for Quitter {
        fn resume(&mut self, cx: &mut Context<'_, u32>, _signal: Signal) -> Result<Step, SimError> {
            match self.kind {
                ReservationKind::Put => cx.reserve_put(self.edge)?,
                ReservationKind::Get => cx.reserve_get(self.edge)?,
            };
            Ok(Step::Done)
        }
    }

    fn buffer_queues(env: &Environment<u32>, buf: EdgeId) -> (usize, usize, usize, usize) {
        let store = env.edge(buf).and_then(Edge::as_buffer).unwrap();
        (store.pending_puts(), store.granted_puts(), store.pending_gets(), store.granted_gets())
    }

    #[test]
    fn finished_task_releases_pending_put() {
        let mut env = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        let log = shared_log();
        env.spawn(Feeder::new(buf, [1u32], SimDuration::ZERO));
        env.run().unwrap();
        env.spawn(Quitter { edge: buf, kind: ReservationKind::Put });
        env.run().unwrap();
        assert_eq!(buffer_queues(&env, buf), (0, 0, 0, 0));

        env.spawn(Collector::new(buf, log.clone()).with_limit(2));
        env.spawn(Feeder::new(buf, [2u32], SimDuration::ZERO));
        let report = env.run().unwrap();
        assert_eq!(times(&log), vec![(t(0.0), 1), (t(0.0), 2)]);
        assert_eq!(buffer_queues(&env, buf), (0, 0, 0, 0));
        assert_eq!(report.live_tasks, 0);
    }

    #[test]
    fn finished_task_releases_granted_put_and_pending_get() {
        let mut env = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        env.spawn(Quitter { edge: buf, kind: ReservationKind::Put });
        env.spawn(Quitter { edge: buf, kind: ReservationKind::Get });
        env.run().unwrap();
        assert_eq!(buffer_queues(&env, buf), (0, 0, 0, 0));
        assert!(env.edge(buf).is_some_and(Edge::can_put));

        // The item is left for whoever asks next.
        env.spawn(Feeder::new(buf, [5u32], SimDuration::ZERO));
        env.run().unwrap();
        assert!(env.edge(buf).is_some_and(Edge::can_get));
    }

    /// Fails on its first timeout and exits cleanly when interrupted.
    struct Jammed {
        signals: std::rc::Rc<std::cell::RefCell<Vec<Signal>>>,
    }

    impl Process<u32> for Jammed {
        fn resume(&mut self, cx: &mut Context<'_, u32>, signal: Signal) -> Result<Step, SimError> {
            self.signals.borrow_mut().push(signal.clone());
            match signal {
                Signal::Start => {
                    cx.timeout(t(1.0))?;
                    Ok(Step::Continue)
                }
                Signal::Timeout(_) => Err(cx.fail("jammed")),
                _ => Ok(Step::Done),
            }
        }

        fn name(&self) -> &str {
            "jammed"
        }
    }

    #[test]
    fn failed_task_stays_registered() {
        let mut env: Environment<u32> = Environment::new();
        let signals = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let task = env.spawn(Jammed { signals: signals.clone() });

        let err = env.run().unwrap_err();
        assert!(matches!(err, SimError::Process { time, .. } if time == t(1.0)));
        assert!(env.is_live(task));
        assert_eq!(env.task_name(task), Some("jammed"));

        env.interrupt(task, InterruptReason::Shutdown).unwrap();
        let report = env.run().unwrap();
        assert_eq!(signals.borrow().last(), Some(&Signal::Interrupted(InterruptReason::Shutdown)));
        assert!(!env.is_live(task));
        assert_eq!(report.tasks_finished, 1);
    }

    #[test]
    fn occupancy_average_is_time_weighted() {
        let mut env = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        env.spawn(Feeder::new(buf, [9u32], SimDuration::ZERO));
        env.run_until(t(4.0)).unwrap();
        assert_eq!(env.occupancy_average(buf), Some(1.0));

        env.spawn(Collector::new(buf, shared_log()).with_limit(1));
        env.run_until(t(8.0)).unwrap();
        assert_eq!(env.occupancy_average(buf), Some(0.5));
        assert_eq!(env.occupancy_average(EdgeId(9)), None);
    }

    #[test]
    fn delayed_buffer_holds_items_back() {
        let mut env = Environment::new();
        let buf = env.add_delayed_buffer(2, StoreMode::Fifo, t(3.0)).unwrap();
        let log = shared_log();
        env.spawn(Feeder::new(buf, [1u32, 2], t(1.0)));
        env.spawn(Collector::new(buf, log.clone()).with_limit(2));

        env.run_until(t(2.0)).unwrap();
        let store = env.edge(buf).and_then(Edge::as_buffer).unwrap();
        assert_eq!((store.len(), store.held_len()), (2, 2));
        assert_eq!(store.pending_gets(), 1);

        env.run().unwrap();
        assert_eq!(times(&log), vec![(t(3.0), 1), (t(4.0), 2)]);
        assert!(matches!(
            env.add_delayed_buffer(1, StoreMode::Fifo, t(-1.0)),
            Err(SimError::Schedule(ScheduleError::NegativeDuration { .. }))
        ));
    }

    #[test]
    fn buffer_state_times_split_at_changes() {
        use crate::store::BufferState;

        let mut env = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        env.spawn(Feeder::new(buf, [9u32], SimDuration::ZERO));
        env.run_until(t(4.0)).unwrap();
        env.spawn(Collector::new(buf, shared_log()).with_limit(1));
        env.run_until(t(10.0)).unwrap();

        let releasing = EdgeState::Buffer(BufferState::Releasing);
        let empty = EdgeState::Buffer(BufferState::Empty);
        assert_eq!(env.time_in_state(buf, releasing), Some(t(4.0)));
        assert_eq!(env.time_in_state(buf, empty), Some(t(6.0)));
        assert_eq!(env.time_in_state(EdgeId(4), empty), None);
    }

    #[test]
    fn belt_state_times_cover_the_whole_run() {
        use crate::transport::BeltState;

        let mut env = Environment::new();
        let belt = env.add_conveyor(belt_config(2, 1.0, 1.0, false)).unwrap();
        env.spawn(Feeder::new(belt, ["x"], SimDuration::ZERO));
        env.run_until(t(5.0)).unwrap();
        env.spawn(Collector::new(belt, shared_log()).with_limit(1));
        env.run_until(t(8.0)).unwrap();

        let expected = BTreeMap::from([
            (EdgeState::Conveyor(BeltState::Stopped), t(3.0)),
            (EdgeState::Conveyor(BeltState::Moving), t(2.0)),
            (EdgeState::Conveyor(BeltState::StalledNonAccumulating), t(3.0)),
        ]);
        assert_eq!(env.state_times(belt), Some(expected));
    }

    #[test]
    fn belt_controls_reject_buffers() {
        let mut env: Environment<u32> = Environment::new();
        let buf = env.add_buffer(1, StoreMode::Fifo);
        assert_eq!(env.notify_backpressure(buf, true), Err(SimError::NotAConveyor(buf)));
        assert_eq!(env.resume_belt(EdgeId(3)), Err(SimError::UnknownEdge(EdgeId(3))));
        assert!(matches!(
            env.add_conveyor(belt_config(0, 1.0, 1.0, true)),
            Err(SimError::Edge { .. })
        ));
    }

    #[test]
    fn held_belt_delays_the_line() {
        let mut env = Environment::new();
        let belt = env.add_conveyor(belt_config(4, 1.0, 1.0, false)).unwrap();
        let log = shared_log();
        env.spawn(Feeder::new(belt, ["x"], SimDuration::ZERO));
        env.spawn(Collector::new(belt, log.clone()).with_limit(1));

        env.run_until(t(1.5)).unwrap();
        env.notify_backpressure(belt, true).unwrap();
        env.run_until(t(3.5)).unwrap();
        assert!(env.resume_belt(belt).unwrap());
        env.run().unwrap();
        assert_eq!(times(&log), vec![(t(6.0), "x")]);
    }
}
