//! Bounded store with reservation-based flow control.
//!
//! [`ReservableStore`] separates *reserving* capacity or an item from
//! *committing* the transfer. A consumer can therefore reserve on two
//! independent stores (get upstream, put downstream) before committing
//! either, and an item is never in limbo between them.
//!
//! Invariants maintained by every operation:
//! - `granted puts + settled items <= capacity`
//! - every granted get reservation is bound to exactly one settled item,
//!   chosen positionally by [`StoreMode`] at grant time and stable until the
//!   reservation is committed or cancelled.
//!
//! A store may carry an availability delay. Items committed to it occupy
//! capacity at once but are held back from get reservations until the owner
//! calls [`ReservableStore::release`] for them.

use crate::id::{EdgeId, ReservationId, TaskId};
use crate::reservation::{
    Grant, ReservationError, ReservationHandle, ReservationKind, ReservationQueue,
    ReservationStatus,
};
use crate::time::SimDuration;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// Which settled item the next granted get reservation is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// Oldest settled item first.
    #[default]
    Fifo,
    /// Newest settled item first.
    Lifo,
}

/// Coarse activity of a buffer, for time accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferState {
    /// Holds no items.
    Empty,
    /// Holds at least one item.
    Releasing,
}

/// Errors raised by a store. All are contract violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error(
        "edge {edge:?}: capacity {capacity} exceeded ({settled} settled, {granted_put} granted puts)"
    )]
    CapacityExceeded {
        edge: EdgeId,
        capacity: usize,
        settled: usize,
        granted_put: usize,
    },
    #[error("edge {edge:?}: granted get reservation {reservation:?} has no bound item")]
    Unbound {
        edge: EdgeId,
        reservation: ReservationId,
    },
}

// ---------------------------------------------------------------------------
// ReservableStore
// ---------------------------------------------------------------------------

/// A bounded container of capacity `C` with reserve/commit/cancel semantics
/// on both the put and the get side.
#[derive(Debug, Clone)]
pub struct ReservableStore<T> {
    id: EdgeId,
    capacity: usize,
    mode: StoreMode,
    delay: SimDuration,
    puts: ReservationQueue,
    gets: ReservationQueue,
    /// Settled items not yet bound to a get reservation, keyed by commit
    /// sequence (lower = older).
    available: BTreeMap<u64, T>,
    /// Settled items bound to a granted get reservation, with their commit
    /// sequence so a cancelled binding can be undone in place.
    bound: BTreeMap<ReservationId, (u64, T)>,
    /// Committed items still inside their availability delay.
    held: BTreeMap<u64, T>,
    next_seq: u64,
    /// Grants not yet collected by the environment, in grant order.
    grants: Vec<Grant>,
}

impl<T> ReservableStore<T> {
    pub fn new(id: EdgeId, capacity: usize, mode: StoreMode) -> Self {
        Self {
            id,
            capacity,
            mode,
            delay: SimDuration::ZERO,
            puts: ReservationQueue::new(id, ReservationKind::Put),
            gets: ReservationQueue::new(id, ReservationKind::Get),
            available: BTreeMap::new(),
            bound: BTreeMap::new(),
            held: BTreeMap::new(),
            next_seq: 0,
            grants: Vec::new(),
        }
    }

    /// Hold every committed item back for `delay` before it can be taken.
    /// Negative delays are treated as zero.
    pub fn with_delay(mut self, delay: SimDuration) -> Self {
        self.delay = delay.max(SimDuration::ZERO);
        self
    }

    // -----------------------------------------------------------------------
    // Put side
    // -----------------------------------------------------------------------

    /// Queue a put reservation at default priority and run the put-granting
    /// pass.
    pub fn reserve_put(&mut self, owner: TaskId) -> ReservationHandle {
        self.reserve_put_with_priority(owner, 0)
    }

    pub fn reserve_put_with_priority(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        let handle = self.puts.enqueue(owner, priority);
        self.grant_puts();
        handle
    }

    /// Insert `item` against a granted put reservation owned by `owner`.
    ///
    /// Returns the item's sequence number when the store has an availability
    /// delay; the item stays held until [`ReservableStore::release`] is
    /// called with it.
    pub fn commit_put(
        &mut self,
        owner: TaskId,
        handle: ReservationHandle,
        item: T,
    ) -> Result<Option<u64>, StoreError> {
        self.puts.consume(owner, handle)?;
        if self.len() >= self.capacity {
            return Err(self.capacity_exceeded());
        }
        if self.delay > SimDuration::ZERO {
            let seq = self.next_seq();
            self.held.insert(seq, item);
            debug!("edge {:?}: put {:?} committed, item {} held", self.id, handle.id, seq);
            return Ok(Some(seq));
        }
        self.insert_settled(item);
        debug!("edge {:?}: put {:?} committed, {} settled", self.id, handle.id, self.len());
        self.grant_gets();
        Ok(None)
    }

    /// Make a held item available to get reservations. Returns false if no
    /// item with that sequence number is held.
    pub fn release(&mut self, seq: u64) -> bool {
        let Some(item) = self.held.remove(&seq) else {
            return false;
        };
        self.available.insert(seq, item);
        debug!("edge {:?}: item {} available", self.id, seq);
        self.grant_gets();
        true
    }

    /// Withdraw a put reservation, pending or granted.
    pub fn cancel_put(&mut self, handle: ReservationHandle) -> Result<bool, StoreError> {
        let (previous, _) = self.puts.cancel(handle)?;
        debug!("edge {:?}: put {:?} cancelled while {:?}", self.id, handle.id, previous);
        self.grant_puts();
        Ok(true)
    }

    /// Insert an item without a put reservation. Used by owners that manage
    /// their own admission, such as a belt delivering to its exit partition.
    pub fn settle(&mut self, item: T) -> Result<(), StoreError> {
        if self.len() + self.puts.granted_len() >= self.capacity {
            return Err(self.capacity_exceeded());
        }
        self.insert_settled(item);
        self.grant_gets();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Get side
    // -----------------------------------------------------------------------

    pub fn reserve_get(&mut self, owner: TaskId) -> ReservationHandle {
        self.reserve_get_with_priority(owner, 0)
    }

    /// Queue a get reservation and run the get-granting pass. A grant binds
    /// the reservation to one settled item immediately.
    pub fn reserve_get_with_priority(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        let handle = self.gets.enqueue(owner, priority);
        self.grant_gets();
        handle
    }

    /// Remove and return the item bound to a granted get reservation.
    pub fn commit_get(&mut self, owner: TaskId, handle: ReservationHandle) -> Result<T, StoreError> {
        self.gets.consume(owner, handle)?;
        let (_, item) = self.bound.remove(&handle.id).ok_or(StoreError::Unbound {
            edge: self.id,
            reservation: handle.id,
        })?;
        debug!("edge {:?}: get {:?} committed, {} settled", self.id, handle.id, self.len());
        self.grant_puts();
        Ok(item)
    }

    /// Withdraw a get reservation. A granted one releases its bound item
    /// back to its original position among the unbound items.
    pub fn cancel_get(&mut self, handle: ReservationHandle) -> Result<bool, StoreError> {
        let (previous, _) = self.gets.cancel(handle)?;
        if previous == ReservationStatus::Granted {
            let (seq, item) = self.bound.remove(&handle.id).ok_or(StoreError::Unbound {
                edge: self.id,
                reservation: handle.id,
            })?;
            self.available.insert(seq, item);
        }
        debug!("edge {:?}: get {:?} cancelled while {:?}", self.id, handle.id, previous);
        self.grant_gets();
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether a new put reservation would be granted without waiting.
    pub fn can_put(&self) -> bool {
        !self.puts.has_pending() && self.capacity.saturating_sub(self.len()) > self.puts.granted_len()
    }

    /// Whether a new get reservation would be granted without waiting.
    pub fn can_get(&self) -> bool {
        !self.gets.has_pending() && !self.available.is_empty()
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn delay(&self) -> SimDuration {
        self.delay
    }

    /// Items in the store: held, bound or available.
    pub fn len(&self) -> usize {
        self.available.len() + self.bound.len() + self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Settled items not bound to any get reservation.
    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Items still inside their availability delay.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn state(&self) -> BufferState {
        if self.is_empty() {
            BufferState::Empty
        } else {
            BufferState::Releasing
        }
    }

    pub fn pending_puts(&self) -> usize {
        self.puts.pending_len()
    }

    pub fn granted_puts(&self) -> usize {
        self.puts.granted_len()
    }

    pub fn pending_gets(&self) -> usize {
        self.gets.pending_len()
    }

    pub fn granted_gets(&self) -> usize {
        self.gets.granted_len()
    }

    pub fn status(&self, handle: ReservationHandle) -> Option<ReservationStatus> {
        if handle.edge != self.id {
            return None;
        }
        match handle.kind {
            ReservationKind::Put => self.puts.status(handle.id),
            ReservationKind::Get => self.gets.status(handle.id),
        }
    }

    pub fn is_granted(&self, handle: ReservationHandle) -> bool {
        self.status(handle) == Some(ReservationStatus::Granted)
    }

    /// The item a granted get reservation is bound to.
    pub fn bound_item(&self, handle: ReservationHandle) -> Option<&T> {
        self.bound.get(&handle.id).map(|(_, item)| item)
    }

    /// Every item in commit order, held, bound or not.
    pub fn items(&self) -> Vec<&T> {
        let mut all: Vec<(u64, &T)> = self
            .available
            .iter()
            .chain(self.held.iter())
            .map(|(seq, item)| (*seq, item))
            .chain(self.bound.values().map(|(seq, item)| (*seq, item)))
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, item)| item).collect()
    }

    /// Take the grants issued since the last call, in grant order.
    pub fn drain_grants(&mut self) -> Vec<Grant> {
        std::mem::take(&mut self.grants)
    }

    // -----------------------------------------------------------------------
    // Granting passes
    // -----------------------------------------------------------------------

    fn grant_puts(&mut self) {
        while self.puts.has_pending() && self.puts.granted_len() + self.len() < self.capacity {
            let Some(grant) = self.puts.grant_head() else {
                break;
            };
            debug!("edge {:?}: put {:?} granted to {:?}", self.id, grant.handle.id, grant.owner);
            self.grants.push(grant);
        }
    }

    fn grant_gets(&mut self) {
        while self.gets.has_pending() && !self.available.is_empty() {
            let entry = match self.mode {
                StoreMode::Fifo => self.available.pop_first(),
                StoreMode::Lifo => self.available.pop_last(),
            };
            let Some(entry) = entry else {
                break;
            };
            let Some(grant) = self.gets.grant_head() else {
                self.available.insert(entry.0, entry.1);
                break;
            };
            debug!("edge {:?}: get {:?} granted to {:?}", self.id, grant.handle.id, grant.owner);
            self.bound.insert(grant.handle.id, entry);
            self.grants.push(grant);
        }
    }

    fn insert_settled(&mut self, item: T) {
        let seq = self.next_seq();
        self.available.insert(seq, item);
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn capacity_exceeded(&self) -> StoreError {
        StoreError::CapacityExceeded {
            edge: self.id,
            capacity: self.capacity,
            settled: self.len(),
            granted_put: self.puts.granted_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn owners(n: usize) -> Vec<TaskId> {
        let mut tasks: SlotMap<TaskId, ()> = SlotMap::with_key();
        (0..n).map(|_| tasks.insert(())).collect()
    }

    fn put(store: &mut ReservableStore<&'static str>, owner: TaskId, item: &'static str) {
        let h = store.reserve_put(owner);
        store.commit_put(owner, h, item).unwrap();
    }

    #[test]
    fn cancelled_get_releases_item_to_next_reservation() {
        let t = owners(3);
        let mut store = ReservableStore::new(EdgeId(0), 2, StoreMode::Fifo);
        put(&mut store, t[0], "A");
        put(&mut store, t[0], "B");

        let g1 = store.reserve_get(t[1]);
        let g2 = store.reserve_get(t[2]);
        assert_eq!(store.bound_item(g1), Some(&"A"));
        assert_eq!(store.bound_item(g2), Some(&"B"));

        assert!(store.cancel_get(g1).unwrap());
        assert!(store.can_get());

        let g3 = store.reserve_get(t[1]);
        assert!(store.is_granted(g3));
        assert_eq!(store.bound_item(g3), Some(&"A"));
        assert_eq!(store.commit_get(t[2], g2).unwrap(), "B");
        assert_eq!(store.commit_get(t[1], g3).unwrap(), "A");
        assert!(store.is_empty());
    }

    #[test]
    fn lifo_binds_newest_first() {
        let t = owners(1);
        let mut store = ReservableStore::new(EdgeId(0), 3, StoreMode::Lifo);
        put(&mut store, t[0], "A");
        put(&mut store, t[0], "B");
        put(&mut store, t[0], "C");
        let g1 = store.reserve_get(t[0]);
        let g2 = store.reserve_get(t[0]);
        assert_eq!(store.bound_item(g1), Some(&"C"));
        assert_eq!(store.bound_item(g2), Some(&"B"));
    }

    #[test]
    fn lifo_cancel_restores_relative_position() {
        let t = owners(1);
        let mut store = ReservableStore::new(EdgeId(0), 4, StoreMode::Lifo);
        put(&mut store, t[0], "A");
        put(&mut store, t[0], "B");
        let g = store.reserve_get(t[0]);
        assert_eq!(store.bound_item(g), Some(&"B"));

        // C is committed after B was bound, so it is newer than B.
        put(&mut store, t[0], "C");
        store.cancel_get(g).unwrap();

        let g1 = store.reserve_get(t[0]);
        let g2 = store.reserve_get(t[0]);
        let g3 = store.reserve_get(t[0]);
        assert_eq!(store.bound_item(g1), Some(&"C"));
        assert_eq!(store.bound_item(g2), Some(&"B"));
        assert_eq!(store.bound_item(g3), Some(&"A"));
    }

    #[test]
    fn put_reservations_block_at_capacity_and_resume_on_get() {
        let t = owners(2);
        let mut store = ReservableStore::new(EdgeId(0), 1, StoreMode::Fifo);
        let p1 = store.reserve_put(t[0]);
        let p2 = store.reserve_put(t[1]);
        assert!(store.is_granted(p1));
        assert_eq!(store.status(p2), Some(ReservationStatus::Pending));
        assert!(!store.can_put());

        store.commit_put(t[0], p1, "A").unwrap();
        assert_eq!(store.status(p2), Some(ReservationStatus::Pending));

        let g = store.reserve_get(t[0]);
        store.commit_get(t[0], g).unwrap();
        assert!(store.is_granted(p2));

        let grants: Vec<_> = store.drain_grants().into_iter().map(|g| g.handle).collect();
        assert_eq!(grants, vec![p1, g, p2]);
        assert!(store.drain_grants().is_empty());
    }

    #[test]
    fn granted_put_occupies_capacity_until_cancelled() {
        let t = owners(2);
        let mut store: ReservableStore<u32> = ReservableStore::new(EdgeId(0), 1, StoreMode::Fifo);
        let p1 = store.reserve_put(t[0]);
        let p2 = store.reserve_put(t[1]);
        assert!(store.is_granted(p1));
        assert!(!store.is_granted(p2));
        store.cancel_put(p1).unwrap();
        assert!(store.is_granted(p2));
        assert!(store.commit_put(t[0], p1, 1).is_err());
    }

    #[test]
    fn head_of_line_blocking_holds_later_gets() {
        let t = owners(2);
        let mut store: ReservableStore<u32> = ReservableStore::new(EdgeId(0), 2, StoreMode::Fifo);
        let g1 = store.reserve_get(t[0]);
        let g2 = store.reserve_get(t[1]);
        assert!(!store.is_granted(g1) && !store.is_granted(g2));
        put_u32(&mut store, t[0], 10);
        assert!(store.is_granted(g1));
        assert!(!store.is_granted(g2));
        assert_eq!(store.available_len(), 0);
        assert!(!store.can_get());
    }

    fn put_u32(store: &mut ReservableStore<u32>, owner: TaskId, item: u32) {
        let h = store.reserve_put(owner);
        store.commit_put(owner, h, item).unwrap();
    }

    #[test]
    fn commit_get_checks_owner_and_grant() {
        let t = owners(2);
        let mut store = ReservableStore::new(EdgeId(7), 2, StoreMode::Fifo);
        put(&mut store, t[0], "A");
        let g = store.reserve_get(t[0]);

        let err = store.commit_get(t[1], g).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Reservation(ReservationError::WrongOwner { edge: EdgeId(7), .. })
        ));
        assert_eq!(store.commit_get(t[0], g).unwrap(), "A");
        let err = store.commit_get(t[0], g).unwrap_err();
        assert!(matches!(err, StoreError::Reservation(ReservationError::NotGranted { .. })));
    }

    #[test]
    fn settle_respects_capacity() {
        let mut store = ReservableStore::new(EdgeId(0), 1, StoreMode::Fifo);
        store.settle(1u8).unwrap();
        assert!(matches!(store.settle(2u8), Err(StoreError::CapacityExceeded { .. })));
        assert_eq!(store.items(), vec![&1u8]);
    }

    #[test]
    fn availability_checks_match_buffer_semantics() {
        let t = owners(1);
        let mut store: ReservableStore<u32> = ReservableStore::new(EdgeId(0), 2, StoreMode::Fifo);
        assert!(store.can_put());
        assert!(!store.can_get());
        let _p = store.reserve_put(t[0]);
        let _q = store.reserve_put(t[0]);
        assert!(!store.can_put());
    }

    #[test]
    fn delayed_items_take_capacity_but_not_gets() {
        let t = owners(2);
        let mut store = ReservableStore::new(EdgeId(0), 2, StoreMode::Fifo)
            .with_delay(SimDuration::from_num(3));
        let g = store.reserve_get(t[1]);

        let p = store.reserve_put(t[0]);
        let first = store.commit_put(t[0], p, "A").unwrap();
        let p = store.reserve_put(t[0]);
        let second = store.commit_put(t[0], p, "B").unwrap();
        assert_eq!((first, second), (Some(0), Some(1)));
        assert_eq!((store.len(), store.held_len()), (2, 2));
        assert_eq!(store.state(), BufferState::Releasing);
        assert!(!store.can_put());
        assert!(!store.is_granted(g));

        assert!(store.release(1));
        assert!(!store.release(1));
        assert_eq!(store.bound_item(g), Some(&"B"));
        assert_eq!(store.items(), vec![&"A", &"B"]);

        assert!(store.release(0));
        assert!(store.can_get());
        assert_eq!(store.commit_get(t[1], g).unwrap(), "B");
    }

    #[test]
    fn zero_delay_settles_at_commit() {
        let t = owners(1);
        let mut store = ReservableStore::new(EdgeId(0), 1, StoreMode::Fifo)
            .with_delay(SimDuration::from_num(-1));
        assert_eq!(store.delay(), SimDuration::ZERO);
        assert_eq!(store.state(), BufferState::Empty);
        let p = store.reserve_put(t[0]);
        assert_eq!(store.commit_put(t[0], p, 4u8).unwrap(), None);
        assert!(store.can_get());
    }

    #[test]
    fn items_are_listed_in_commit_order() {
        let t = owners(1);
        let mut store = ReservableStore::new(EdgeId(0), 3, StoreMode::Lifo);
        put(&mut store, t[0], "A");
        put(&mut store, t[0], "B");
        let _g = store.reserve_get(t[0]);
        put(&mut store, t[0], "C");
        assert_eq!(store.items(), vec![&"A", &"B", &"C"]);
    }
}
