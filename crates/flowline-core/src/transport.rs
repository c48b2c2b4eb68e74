//! Conveyor belt transport.
//!
//! A [`Belt`] moves items from its entry to its exit over virtual time. Each
//! admitted item goes through two timed phases:
//!
//! 1. **Entering** -- `item_length / speed`: the item is sliding onto the
//!    belt. No other item is admitted behind it until this phase ends, which
//!    enforces minimum spacing.
//! 2. **Traveling** -- `capacity * item_length / speed - entering`: the item
//!    moves toward the exit.
//!
//! Items that complete both phases move into the *arrived* partition, a FIFO
//! [`ReservableStore`] from which consumers take them through the usual
//! get reservation protocol.
//!
//! Either phase can be interrupted when the belt stalls and resumed later.
//! Every interruption is added to the item's cumulative interruption time, so
//! an item that stalled for a total of `d` arrives exactly `d` later than it
//! would have otherwise. Positions are never stored: they are derived from
//! entry time, elapsed time and interruption time whenever needed.
//!
//! # Stall disciplines
//!
//! The belt stalls while its exit is blocked: either items are waiting in
//! the arrived partition, or the owner asserted backpressure explicitly.
//!
//! - **Accumulating** belts stop each item selectively. An item with `k`
//!   empty slots directly ahead keeps moving for `k * item_length / speed`
//!   before it stops, so items pack together behind the blockage.
//! - **Non-accumulating** belts freeze every item at once, and admit at most
//!   one further item until motion resumes.

use crate::id::{EdgeId, ItemTag, TaskId, TimerId, TransitId};
use crate::reservation::{
    Grant, ReservationError, ReservationHandle, ReservationKind, ReservationQueue,
    ReservationStatus,
};
use crate::sim::{ScheduleError, Scheduler, Wakeup};
use crate::store::{ReservableStore, StoreError, StoreMode};
use crate::time::{SimDuration, SimTime, TIME_TOLERANCE, ceil_div, checked_div_time};
use log::{debug, trace};
use slotmap::SlotMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Physical parameters of a belt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeltConfig {
    /// Number of item-length slots between entry and exit.
    pub capacity: usize,
    /// Distance units per unit of virtual time.
    pub speed: SimTime,
    /// Length of every item, in distance units.
    pub item_length: SimTime,
    pub accumulating: bool,
}

impl BeltConfig {
    pub fn new(capacity: usize, speed: SimTime, item_length: SimTime, accumulating: bool) -> Self {
        Self {
            capacity,
            speed,
            item_length,
            accumulating,
        }
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Where an item is in its journey across the belt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitPhase {
    Entering,
    Traveling,
    Arrived,
}

/// A payload plus the transit bookkeeping the belt keeps for it.
///
/// Only the owning belt mutates these fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportItem<T> {
    payload: T,
    tag: ItemTag,
    entry_time: SimTime,
    length: SimTime,
    total_interruption: SimDuration,
    interruption_start: Option<SimTime>,
    phase: TransitPhase,
    arrival_time: Option<SimTime>,
}

impl<T> TransportItem<T> {
    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn tag(&self) -> ItemTag {
        self.tag
    }

    pub fn entry_time(&self) -> SimTime {
        self.entry_time
    }

    pub fn length(&self) -> SimTime {
        self.length
    }

    /// Interruption time from completed stall/resume cycles.
    pub fn total_interruption(&self) -> SimDuration {
        self.total_interruption
    }

    /// Start of the ongoing interruption, if the item is stopped.
    pub fn interruption_start(&self) -> Option<SimTime> {
        self.interruption_start
    }

    pub fn is_interrupted(&self) -> bool {
        self.interruption_start.is_some()
    }

    pub fn phase(&self) -> TransitPhase {
        self.phase
    }

    pub fn arrival_time(&self) -> Option<SimTime> {
        self.arrival_time
    }

    /// Time the item has actually spent moving as of `now`.
    pub fn time_on_belt(&self, now: SimTime) -> SimDuration {
        let end = self.arrival_time.unwrap_or(now);
        let mut moving = end - self.entry_time - self.total_interruption;
        if let Some(start) = self.interruption_start {
            moving -= now - start;
        }
        moving
    }
}

/// In-motion bookkeeping for the current phase of one item.
#[derive(Debug, Clone)]
struct Transit<T> {
    item: TransportItem<T>,
    phase_duration: SimDuration,
    phase_start: SimTime,
    /// Interruption accumulated since `phase_start`.
    phase_interruption: SimDuration,
    timer: Option<TimerId>,
    stall_timer: Option<TimerId>,
}

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BeltState {
    /// Nothing in motion and the exit is clear.
    Stopped,
    Moving,
    /// Exit blocked; items stop one by one as they close up.
    Accumulating,
    /// Exit blocked; every item frozen in place.
    StalledNonAccumulating,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BeltError {
    #[error("invalid belt configuration: {reason}")]
    InvalidConfig { reason: String },
    #[error(
        "edge {edge:?}: belt capacity {capacity} exceeded ({in_motion} in motion, {arrived} arrived)"
    )]
    CapacityExceeded {
        edge: EdgeId,
        capacity: usize,
        in_motion: usize,
        arrived: usize,
    },
    #[error("edge {edge:?}: no free slot for item {item} shifting toward the entry (pattern {pattern})")]
    NoFreeSlot {
        edge: EdgeId,
        item: ItemTag,
        pattern: String,
    },
    #[error("edge {edge:?}: item {item:?} is not in motion")]
    UnknownItem { edge: EdgeId, item: TransitId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

// ---------------------------------------------------------------------------
// Occupancy pattern
// ---------------------------------------------------------------------------

/// Slot-by-slot snapshot of a belt, entry first. Renders as `*` for an
/// occupied slot and `_` for an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyPattern {
    pub slots: Vec<bool>,
    pub labels: Vec<Option<ItemTag>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternParseError {
    #[error("invalid occupancy symbol {symbol:?} at slot {slot}")]
    InvalidSymbol { symbol: char, slot: usize },
}

impl OccupancyPattern {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| **s).count()
    }

    /// For each occupied slot, entry first, the number of empty slots
    /// anywhere between it and the exit.
    pub fn gaps_ahead(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i])
            .map(|i| gap_ahead(&self.slots, i))
            .collect()
    }

    /// How long each occupied slot's item keeps moving before it stops,
    /// entry first.
    pub fn stall_delays(&self, item_length: SimTime, speed: SimTime) -> Option<Vec<SimDuration>> {
        let per_slot = checked_div_time(item_length, speed)?;
        Some(
            self.gaps_ahead()
                .into_iter()
                .map(|gap| per_slot.saturating_mul_int(gap as i64))
                .collect(),
        )
    }
}

impl fmt::Display for OccupancyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for occupied in &self.slots {
            f.write_str(if *occupied { "*" } else { "_" })?;
        }
        Ok(())
    }
}

impl FromStr for OccupancyPattern {
    type Err = PatternParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slots = s
            .chars()
            .enumerate()
            .map(|(slot, symbol)| match symbol {
                '*' => Ok(true),
                '_' => Ok(false),
                _ => Err(PatternParseError::InvalidSymbol { symbol, slot }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let labels = vec![None; slots.len()];
        Ok(Self { slots, labels })
    }
}

/// Items ahead are packing toward the exit too, so every hole ahead is
/// closed before the item behind them stops.
fn gap_ahead(slots: &[bool], i: usize) -> usize {
    slots[i + 1..].iter().filter(|occupied| !**occupied).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupant {
    Arrived(ItemTag),
    InMotion(TransitId, ItemTag),
}

impl Occupant {
    fn tag(self) -> ItemTag {
        match self {
            Occupant::Arrived(tag) | Occupant::InMotion(_, tag) => tag,
        }
    }
}

fn render(slots: &[Option<Occupant>]) -> String {
    slots.iter().map(|s| if s.is_some() { '*' } else { '_' }).collect()
}

// ---------------------------------------------------------------------------
// Belt
// ---------------------------------------------------------------------------

/// A conveyor belt with a reservation-controlled entry and a FIFO exit.
///
/// Methods that start, stop or finish motion take the [`Scheduler`] so the
/// belt can register and cancel its phase timers. The owner must route
/// [`Wakeup::PhaseElapsed`] to [`Belt::on_phase_elapsed`] and
/// [`Wakeup::StallDue`] to [`Belt::on_stall_due`].
#[derive(Debug)]
pub struct Belt<T> {
    id: EdgeId,
    config: BeltConfig,
    entry_phase: SimDuration,
    travel_phase: SimDuration,
    state: BeltState,
    /// Backpressure asserted by the owner, independent of the exit.
    held: bool,
    puts: ReservationQueue,
    in_motion: SlotMap<TransitId, Transit<T>>,
    /// In-motion items in admission order, oldest (nearest the exit) first.
    order: Vec<TransitId>,
    last_admitted: Option<TransitId>,
    admitted_during_stall: usize,
    arrived: ReservableStore<TransportItem<T>>,
    next_tag: u64,
    grants: Vec<Grant>,
}

impl<T> Belt<T> {
    pub fn new(id: EdgeId, config: BeltConfig) -> Result<Self, BeltError> {
        let invalid = |reason: &str| BeltError::InvalidConfig {
            reason: reason.to_string(),
        };
        if config.capacity == 0 {
            return Err(invalid("capacity must be at least 1"));
        }
        if config.speed <= SimTime::ZERO {
            return Err(invalid("speed must be positive"));
        }
        if config.item_length <= SimTime::ZERO {
            return Err(invalid("item length must be positive"));
        }
        let entry_phase = checked_div_time(config.item_length, config.speed)
            .ok_or_else(|| invalid("entry phase overflows"))?;
        let total = SimTime::checked_from_num(config.capacity)
            .and_then(|cap| cap.checked_mul(config.item_length))
            .and_then(|distance| checked_div_time(distance, config.speed))
            .ok_or_else(|| invalid("transit time overflows"))?;
        Ok(Self {
            id,
            config,
            entry_phase,
            travel_phase: total - entry_phase,
            state: BeltState::Stopped,
            held: false,
            puts: ReservationQueue::new(id, ReservationKind::Put),
            in_motion: SlotMap::with_key(),
            order: Vec::new(),
            last_admitted: None,
            admitted_during_stall: 0,
            arrived: ReservableStore::new(id, config.capacity, StoreMode::Fifo),
            next_tag: 0,
            grants: Vec::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Entry side
    // -----------------------------------------------------------------------

    pub fn reserve_put(&mut self, owner: TaskId) -> ReservationHandle {
        self.reserve_put_with_priority(owner, 0)
    }

    /// Queue a put reservation. At most one put is granted at a time, and
    /// only when the belt has room and the previous item has fully entered.
    pub fn reserve_put_with_priority(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        let handle = self.puts.enqueue(owner, priority);
        self.grant_puts();
        handle
    }

    /// Place `payload` on the belt against a granted put reservation.
    pub fn commit_put(
        &mut self,
        sched: &mut Scheduler,
        owner: TaskId,
        handle: ReservationHandle,
        payload: T,
    ) -> Result<TransitId, BeltError> {
        self.puts.consume(owner, handle)?;
        self.admit(sched, payload)
    }

    pub fn cancel_put(&mut self, handle: ReservationHandle) -> Result<bool, BeltError> {
        self.puts.cancel(handle)?;
        self.grant_puts();
        Ok(true)
    }

    /// Start `payload` on its entering phase. Capacity is checked here;
    /// spacing is only enforced through put reservations.
    pub fn admit(&mut self, sched: &mut Scheduler, payload: T) -> Result<TransitId, BeltError> {
        if self.len() >= self.config.capacity {
            return Err(self.capacity_exceeded());
        }
        let now = sched.now();
        let tag = ItemTag(self.next_tag);
        self.next_tag += 1;
        let id = self.in_motion.insert(Transit {
            item: TransportItem {
                payload,
                tag,
                entry_time: now,
                length: self.config.item_length,
                total_interruption: SimDuration::ZERO,
                interruption_start: None,
                phase: TransitPhase::Entering,
                arrival_time: None,
            },
            phase_duration: self.entry_phase,
            phase_start: now,
            phase_interruption: SimDuration::ZERO,
            timer: None,
            stall_timer: None,
        });
        let timer = match sched.schedule_timeout(
            self.entry_phase,
            Wakeup::PhaseElapsed {
                edge: self.id,
                item: id,
            },
        ) {
            Ok(timer) => timer,
            Err(e) => {
                self.in_motion.remove(id);
                return Err(e.into());
            }
        };
        if let Some(transit) = self.in_motion.get_mut(id) {
            transit.timer = Some(timer);
        }
        self.order.push(id);
        self.last_admitted = Some(id);
        debug!(
            "edge {:?}: item {} admitted at {} ({:?}, {} on belt)",
            self.id,
            tag,
            now,
            self.state,
            self.len()
        );

        match self.state {
            BeltState::Stopped => self.state = BeltState::Moving,
            BeltState::Moving => {}
            BeltState::Accumulating => {
                self.admitted_during_stall += 1;
                let layout = self.layout(now)?;
                if let Some(gap) = in_motion_gaps(&layout)
                    .into_iter()
                    .find_map(|(transit, gap)| (transit == id).then_some(gap))
                {
                    self.stall_after(sched, id, gap)?;
                }
            }
            BeltState::StalledNonAccumulating => {
                self.admitted_during_stall += 1;
                self.interrupt_item(sched, id);
            }
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Exit side
    // -----------------------------------------------------------------------

    pub fn reserve_get(&mut self, owner: TaskId) -> ReservationHandle {
        self.reserve_get_with_priority(owner, 0)
    }

    pub fn reserve_get_with_priority(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        let handle = self.arrived.reserve_get_with_priority(owner, priority);
        self.collect_arrived_grants();
        handle
    }

    /// Take an arrived item off the belt. Clearing the exit may restart
    /// motion and admit new items.
    pub fn commit_get(
        &mut self,
        sched: &mut Scheduler,
        owner: TaskId,
        handle: ReservationHandle,
    ) -> Result<TransportItem<T>, BeltError> {
        let item = self.arrived.commit_get(owner, handle)?;
        debug!("edge {:?}: item {} left the belt at {}", self.id, item.tag, sched.now());
        self.collect_arrived_grants();
        self.sync_backpressure(sched)?;
        self.grant_puts();
        Ok(item)
    }

    pub fn cancel_get(&mut self, handle: ReservationHandle) -> Result<bool, BeltError> {
        let cancelled = self.arrived.cancel_get(handle)?;
        self.collect_arrived_grants();
        Ok(cancelled)
    }

    // -----------------------------------------------------------------------
    // Motion
    // -----------------------------------------------------------------------

    /// Handle the end of an item's current phase.
    pub fn on_phase_elapsed(&mut self, sched: &mut Scheduler, id: TransitId) -> Result<(), BeltError> {
        let now = sched.now();
        let transit = self.in_motion.get_mut(id).ok_or(BeltError::UnknownItem {
            edge: self.id,
            item: id,
        })?;
        transit.timer = None;
        if transit.item.phase != TransitPhase::Entering {
            return self.arrive(sched, id);
        }

        transit.item.phase = TransitPhase::Traveling;
        transit.phase_start = now;
        transit.phase_interruption = SimDuration::ZERO;
        transit.phase_duration = self.travel_phase;
        trace!("edge {:?}: item {} entered at {}", self.id, transit.item.tag, now);
        let timer = sched.schedule_timeout(
            self.travel_phase,
            Wakeup::PhaseElapsed {
                edge: self.id,
                item: id,
            },
        )?;
        if let Some(transit) = self.in_motion.get_mut(id) {
            transit.timer = Some(timer);
        }
        self.grant_puts();
        Ok(())
    }

    /// Handle a delayed stall coming due on an accumulating belt.
    pub fn on_stall_due(&mut self, sched: &mut Scheduler, id: TransitId) -> Result<(), BeltError> {
        let transit = self.in_motion.get_mut(id).ok_or(BeltError::UnknownItem {
            edge: self.id,
            item: id,
        })?;
        transit.stall_timer = None;
        self.interrupt_item(sched, id);
        Ok(())
    }

    /// Assert or release backpressure from downstream. The belt stalls while
    /// backpressure is asserted or arrived items wait at the exit.
    pub fn notify_backpressure(&mut self, sched: &mut Scheduler, on: bool) -> Result<(), BeltError> {
        self.held = on;
        self.sync_backpressure(sched)
    }

    /// Release asserted backpressure. Returns whether the belt is moving
    /// afterwards; it stays stalled while arrived items block the exit.
    pub fn resume(&mut self, sched: &mut Scheduler) -> Result<bool, BeltError> {
        self.held = false;
        self.sync_backpressure(sched)?;
        Ok(!self.is_stalled())
    }

    fn arrive(&mut self, sched: &mut Scheduler, id: TransitId) -> Result<(), BeltError> {
        let now = sched.now();
        let mut transit = self.in_motion.remove(id).ok_or(BeltError::UnknownItem {
            edge: self.id,
            item: id,
        })?;
        self.order.retain(|&other| other != id);
        if self.last_admitted == Some(id) {
            self.last_admitted = None;
        }
        if let Some(timer) = transit.stall_timer.take() {
            sched.cancel(timer);
        }
        transit.item.phase = TransitPhase::Arrived;
        transit.item.arrival_time = Some(now);
        let tag = transit.item.tag;
        self.arrived.settle(transit.item)?;
        if self.len() > self.config.capacity {
            return Err(self.capacity_exceeded());
        }
        debug!("edge {:?}: item {} arrived at {}", self.id, tag, now);
        self.collect_arrived_grants();
        self.sync_backpressure(sched)?;
        self.grant_puts();
        Ok(())
    }

    fn sync_backpressure(&mut self, sched: &mut Scheduler) -> Result<(), BeltError> {
        let blocked = self.held || !self.arrived.is_empty();
        match self.state {
            BeltState::Stopped | BeltState::Moving if blocked => self.stall(sched)?,
            BeltState::Accumulating | BeltState::StalledNonAccumulating if !blocked => {
                self.resume_all(sched)?
            }
            BeltState::Moving if self.in_motion.is_empty() => self.state = BeltState::Stopped,
            _ => {}
        }
        Ok(())
    }

    fn stall(&mut self, sched: &mut Scheduler) -> Result<(), BeltError> {
        let now = sched.now();
        self.admitted_during_stall = 0;
        if self.config.accumulating {
            self.state = BeltState::Accumulating;
            let layout = self.layout(now)?;
            for (id, gap) in in_motion_gaps(&layout) {
                self.stall_after(sched, id, gap)?;
            }
            debug!("edge {:?}: accumulating at {} ({})", self.id, now, render(&layout));
        } else {
            self.state = BeltState::StalledNonAccumulating;
            self.interrupt_all(sched);
            debug!("edge {:?}: stalled at {}", self.id, now);
        }
        Ok(())
    }

    /// Stop `id` once it has covered `gap` more slots.
    fn stall_after(&mut self, sched: &mut Scheduler, id: TransitId, gap: usize) -> Result<(), BeltError> {
        let delay = self.entry_phase.saturating_mul_int(gap as i64);
        if delay == SimDuration::ZERO {
            self.interrupt_item(sched, id);
            return Ok(());
        }
        let timer = sched.schedule_timeout(
            delay,
            Wakeup::StallDue {
                edge: self.id,
                item: id,
            },
        )?;
        if let Some(transit) = self.in_motion.get_mut(id) {
            if let Some(previous) = transit.stall_timer.replace(timer) {
                sched.cancel(previous);
            }
        }
        Ok(())
    }

    fn interrupt_all(&mut self, sched: &mut Scheduler) {
        for id in self.order.clone() {
            self.interrupt_item(sched, id);
        }
    }

    fn interrupt_item(&mut self, sched: &mut Scheduler, id: TransitId) {
        let now = sched.now();
        let Some(transit) = self.in_motion.get_mut(id) else {
            return;
        };
        if let Some(timer) = transit.stall_timer.take() {
            sched.cancel(timer);
        }
        if transit.item.interruption_start.is_some() {
            return;
        }
        if let Some(timer) = transit.timer.take() {
            sched.cancel(timer);
        }
        transit.item.interruption_start = Some(now);
        trace!("edge {:?}: item {} stopped at {}", self.id, transit.item.tag, now);
    }

    fn resume_all(&mut self, sched: &mut Scheduler) -> Result<(), BeltError> {
        for id in self.order.clone() {
            self.resume_item(sched, id)?;
        }
        self.state = if self.in_motion.is_empty() {
            BeltState::Stopped
        } else {
            BeltState::Moving
        };
        self.admitted_during_stall = 0;
        debug!("edge {:?}: resumed at {}", self.id, sched.now());
        self.grant_puts();
        Ok(())
    }

    fn resume_item(&mut self, sched: &mut Scheduler, id: TransitId) -> Result<(), BeltError> {
        let now = sched.now();
        let Some(transit) = self.in_motion.get_mut(id) else {
            return Ok(());
        };
        if let Some(timer) = transit.stall_timer.take() {
            sched.cancel(timer);
        }
        let Some(start) = transit.item.interruption_start.take() else {
            return Ok(());
        };
        let stopped = now - start;
        transit.item.total_interruption += stopped;
        transit.phase_interruption += stopped;
        let moved = (now - transit.phase_start) - transit.phase_interruption;
        let remaining = (transit.phase_duration - moved).max(SimDuration::ZERO);
        trace!(
            "edge {:?}: item {} resumed at {} after {}, {} left in phase",
            self.id, transit.item.tag, now, stopped, remaining
        );
        let timer = sched.schedule_timeout(
            remaining,
            Wakeup::PhaseElapsed {
                edge: self.id,
                item: id,
            },
        )?;
        transit.timer = Some(timer);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    fn admission_open(&self) -> bool {
        let room = self.puts.granted_len() == 0 && self.len() < self.config.capacity;
        let spaced = self
            .last_admitted
            .and_then(|id| self.in_motion.get(id))
            .is_none_or(|t| t.item.phase != TransitPhase::Entering);
        let frozen =
            self.state == BeltState::StalledNonAccumulating && self.admitted_during_stall > 0;
        room && spaced && !frozen
    }

    fn grant_puts(&mut self) {
        while self.puts.has_pending() && self.admission_open() {
            let Some(grant) = self.puts.grant_head() else {
                break;
            };
            debug!("edge {:?}: put {:?} granted to {:?}", self.id, grant.handle.id, grant.owner);
            self.grants.push(grant);
        }
    }

    fn collect_arrived_grants(&mut self) {
        self.grants.extend(self.arrived.drain_grants());
    }

    // -----------------------------------------------------------------------
    // Positions
    // -----------------------------------------------------------------------

    /// Distance `id` has travelled from the entry as of `now`.
    pub fn position(&self, id: TransitId, now: SimTime) -> Option<SimTime> {
        self.in_motion
            .get(id)
            .map(|t| t.item.time_on_belt(now).saturating_mul(self.config.speed))
    }

    /// Discrete snapshot of the belt as of `now`.
    pub fn occupancy_pattern(&self, now: SimTime) -> Result<OccupancyPattern, BeltError> {
        let layout = self.layout(now)?;
        Ok(OccupancyPattern {
            slots: layout.iter().map(Option::is_some).collect(),
            labels: layout.iter().map(|s| s.map(Occupant::tag)).collect(),
        })
    }

    /// Arrived items fill the exit slots first. In-motion items, oldest
    /// first, take `ceil(distance / length)` clamped to the exit slot and
    /// shift toward the entry on collision.
    fn layout(&self, now: SimTime) -> Result<Vec<Option<Occupant>>, BeltError> {
        let exit = self.config.capacity - 1;
        let mut slots = vec![None; self.config.capacity];
        for item in self.arrived.items() {
            self.place(&mut slots, exit, Occupant::Arrived(item.tag))?;
        }
        for &id in &self.order {
            let Some(transit) = self.in_motion.get(id) else {
                continue;
            };
            let distance = transit.item.time_on_belt(now).saturating_mul(self.config.speed);
            let slot = ceil_div(distance - TIME_TOLERANCE, self.config.item_length)
                .map_or(exit, |slot| slot.min(exit));
            self.place(&mut slots, slot, Occupant::InMotion(id, transit.item.tag))?;
        }
        Ok(slots)
    }

    fn place(
        &self,
        slots: &mut [Option<Occupant>],
        from: usize,
        occupant: Occupant,
    ) -> Result<(), BeltError> {
        match slots[..=from].iter().rposition(Option::is_none) {
            Some(free) => {
                slots[free] = Some(occupant);
                Ok(())
            }
            None => Err(BeltError::NoFreeSlot {
                edge: self.id,
                item: occupant.tag(),
                pattern: render(slots),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn config(&self) -> &BeltConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn state(&self) -> BeltState {
        self.state
    }

    pub fn is_stalled(&self) -> bool {
        matches!(
            self.state,
            BeltState::Accumulating | BeltState::StalledNonAccumulating
        )
    }

    pub fn entry_phase(&self) -> SimDuration {
        self.entry_phase
    }

    pub fn travel_phase(&self) -> SimDuration {
        self.travel_phase
    }

    /// Items in motion plus arrived items.
    pub fn len(&self) -> usize {
        self.in_motion.len() + self.arrived.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_motion_count(&self) -> usize {
        self.in_motion.len()
    }

    pub fn arrived_count(&self) -> usize {
        self.arrived.len()
    }

    pub fn can_put(&self) -> bool {
        !self.puts.has_pending() && self.admission_open()
    }

    pub fn can_get(&self) -> bool {
        self.arrived.can_get()
    }

    /// In-motion items, oldest first.
    pub fn in_motion_items(&self) -> impl Iterator<Item = (TransitId, &TransportItem<T>)> {
        self.order
            .iter()
            .filter_map(|&id| self.in_motion.get(id).map(|t| (id, &t.item)))
    }

    pub fn in_motion_item(&self, id: TransitId) -> Option<&TransportItem<T>> {
        self.in_motion.get(id).map(|t| &t.item)
    }

    /// Arrived items in arrival order.
    pub fn arrived_items(&self) -> Vec<&TransportItem<T>> {
        self.arrived.items()
    }

    pub fn status(&self, handle: ReservationHandle) -> Option<ReservationStatus> {
        match handle.kind {
            ReservationKind::Put if handle.edge == self.id => self.puts.status(handle.id),
            ReservationKind::Put => None,
            ReservationKind::Get => self.arrived.status(handle),
        }
    }

    pub fn is_granted(&self, handle: ReservationHandle) -> bool {
        self.status(handle) == Some(ReservationStatus::Granted)
    }

    pub fn drain_grants(&mut self) -> Vec<Grant> {
        std::mem::take(&mut self.grants)
    }

    fn capacity_exceeded(&self) -> BeltError {
        BeltError::CapacityExceeded {
            edge: self.id,
            capacity: self.config.capacity,
            in_motion: self.in_motion.len(),
            arrived: self.arrived.len(),
        }
    }
}

/// Empty slots ahead of every in-motion occupant, entry first.
fn in_motion_gaps(layout: &[Option<Occupant>]) -> Vec<(TransitId, usize)> {
    let occupied: Vec<bool> = layout.iter().map(Option::is_some).collect();
    layout
        .iter()
        .enumerate()
        .filter_map(|(slot, occupant)| match occupant {
            Some(Occupant::InMotion(id, _)) => Some((*id, gap_ahead(&occupied, slot))),
            _ => None,
        })
        .collect()
}
