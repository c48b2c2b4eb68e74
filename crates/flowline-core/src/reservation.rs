//! Reservation tickets and the ordered queue that grants them.
//!
//! A reservation is a single-use promise: a put reservation is the right to
//! insert one item later, a get reservation the right to remove one item
//! later. Reservations are granted strictly in queue order (priority first,
//! then request order). A head reservation that cannot be granted blocks
//! every reservation behind it.

use crate::id::{EdgeId, ReservationId, TaskId};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Tickets
// ---------------------------------------------------------------------------

/// Which side of a container a reservation is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationKind {
    Put,
    Get,
}

/// Lifecycle of a reservation. Granted at most once, consumed at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Granted,
    Cancelled,
    Consumed,
}

/// What a requester holds on to. Identifies the edge, the side and the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationHandle {
    pub edge: EdgeId,
    pub id: ReservationId,
    pub kind: ReservationKind,
}

/// A reservation as recorded in a queue's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: ReservationId,
    pub owner: TaskId,
    pub kind: ReservationKind,
    /// Lower values are served first.
    pub priority: i32,
    pub status: ReservationStatus,
}

/// Notification that a reservation has been granted, to be delivered to its
/// owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub handle: ReservationHandle,
    pub owner: TaskId,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Contract violations detected by a reservation queue. None of these are
/// retryable: they mean the caller skipped the reserve step, reused a
/// retired ticket, or handed its ticket to another task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error(
        "edge {edge:?}: {kind:?} reservation {reservation:?} is not granted (status {status:?}); granted registry {granted:?}"
    )]
    NotGranted {
        edge: EdgeId,
        kind: ReservationKind,
        reservation: ReservationId,
        status: Option<ReservationStatus>,
        granted: Vec<ReservationId>,
    },
    #[error("edge {edge:?}: reservation {reservation:?} is owned by {owner:?}, not {caller:?}")]
    WrongOwner {
        edge: EdgeId,
        reservation: ReservationId,
        owner: TaskId,
        caller: TaskId,
    },
    #[error(
        "edge {edge:?}: no {kind:?} reservation {reservation:?} in pending or granted registry; granted registry {granted:?}"
    )]
    Unknown {
        edge: EdgeId,
        kind: ReservationKind,
        reservation: ReservationId,
        granted: Vec<ReservationId>,
    },
    #[error("edge {edge:?}: handle for {actual:?} used where a {expected:?} reservation is required")]
    KindMismatch {
        edge: EdgeId,
        expected: ReservationKind,
        actual: ReservationKind,
    },
    #[error("edge {edge:?}: handle was issued by edge {issuer:?}")]
    ForeignHandle { edge: EdgeId, issuer: EdgeId },
}

// ---------------------------------------------------------------------------
// ReservationQueue
// ---------------------------------------------------------------------------

/// Ordered registry of pending and granted reservations for one side of one
/// edge.
#[derive(Debug, Clone)]
pub struct ReservationQueue {
    edge: EdgeId,
    kind: ReservationKind,
    next_id: u64,
    /// Waiting reservations keyed by service order.
    pending: BTreeMap<(i32, ReservationId), Reservation>,
    /// Priority of each pending reservation, for removal by id.
    pending_index: BTreeMap<ReservationId, i32>,
    /// Granted reservations in grant order.
    granted: Vec<Reservation>,
}

impl ReservationQueue {
    pub fn new(edge: EdgeId, kind: ReservationKind) -> Self {
        Self {
            edge,
            kind,
            next_id: 0,
            pending: BTreeMap::new(),
            pending_index: BTreeMap::new(),
            granted: Vec::new(),
        }
    }

    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    pub fn kind(&self) -> ReservationKind {
        self.kind
    }

    /// Append a pending reservation for `owner`. Does not grant anything.
    pub fn enqueue(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        let id = ReservationId(self.next_id);
        self.next_id += 1;
        self.pending.insert(
            (priority, id),
            Reservation {
                id,
                owner,
                kind: self.kind,
                priority,
                status: ReservationStatus::Pending,
            },
        );
        self.pending_index.insert(id, priority);
        trace!("edge {:?}: {:?} reservation {:?} queued for {:?}", self.edge, self.kind, id, owner);
        self.handle(id)
    }

    /// Grant the head of the pending queue, if any. The caller decides
    /// whether capacity allows it; this only moves the ticket.
    pub fn grant_head(&mut self) -> Option<Grant> {
        let (_, mut reservation) = self.pending.pop_first()?;
        self.pending_index.remove(&reservation.id);
        reservation.status = ReservationStatus::Granted;
        let grant = Grant {
            handle: self.handle(reservation.id),
            owner: reservation.owner,
        };
        self.granted.push(reservation);
        Some(grant)
    }

    /// Retire a granted reservation on commit. Fails unless `handle` is
    /// granted in this queue and owned by `caller`.
    pub fn consume(
        &mut self,
        caller: TaskId,
        handle: ReservationHandle,
    ) -> Result<Reservation, ReservationError> {
        self.check_handle(handle)?;
        let Some(pos) = self.granted.iter().position(|r| r.id == handle.id) else {
            let status = self
                .pending_index
                .contains_key(&handle.id)
                .then_some(ReservationStatus::Pending);
            return Err(ReservationError::NotGranted {
                edge: self.edge,
                kind: self.kind,
                reservation: handle.id,
                status,
                granted: self.granted_ids(),
            });
        };
        let owner = self.granted[pos].owner;
        if owner != caller {
            return Err(ReservationError::WrongOwner {
                edge: self.edge,
                reservation: handle.id,
                owner,
                caller,
            });
        }
        let mut reservation = self.granted.remove(pos);
        reservation.status = ReservationStatus::Consumed;
        Ok(reservation)
    }

    /// Withdraw a reservation whether it is still pending or already granted.
    /// Returns the retired reservation; its status is `Cancelled` and the
    /// previous status tells the caller which registry it came from.
    pub fn cancel(
        &mut self,
        handle: ReservationHandle,
    ) -> Result<(ReservationStatus, Reservation), ReservationError> {
        self.check_handle(handle)?;
        if let Some(priority) = self.pending_index.remove(&handle.id) {
            if let Some(mut reservation) = self.pending.remove(&(priority, handle.id)) {
                reservation.status = ReservationStatus::Cancelled;
                return Ok((ReservationStatus::Pending, reservation));
            }
        }
        if let Some(pos) = self.granted.iter().position(|r| r.id == handle.id) {
            let mut reservation = self.granted.remove(pos);
            reservation.status = ReservationStatus::Cancelled;
            return Ok((ReservationStatus::Granted, reservation));
        }
        Err(ReservationError::Unknown {
            edge: self.edge,
            kind: self.kind,
            reservation: handle.id,
            granted: self.granted_ids(),
        })
    }

    /// Live status of a reservation. Retired tickets report `None`.
    pub fn status(&self, id: ReservationId) -> Option<ReservationStatus> {
        if self.pending_index.contains_key(&id) {
            Some(ReservationStatus::Pending)
        } else if self.granted.iter().any(|r| r.id == id) {
            Some(ReservationStatus::Granted)
        } else {
            None
        }
    }

    pub fn is_granted(&self, id: ReservationId) -> bool {
        self.granted.iter().any(|r| r.id == id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn granted_len(&self) -> usize {
        self.granted.len()
    }

    /// Granted reservation ids in grant order.
    pub fn granted_ids(&self) -> Vec<ReservationId> {
        self.granted.iter().map(|r| r.id).collect()
    }

    fn handle(&self, id: ReservationId) -> ReservationHandle {
        ReservationHandle {
            edge: self.edge,
            id,
            kind: self.kind,
        }
    }

    fn check_handle(&self, handle: ReservationHandle) -> Result<(), ReservationError> {
        if handle.edge != self.edge {
            return Err(ReservationError::ForeignHandle {
                edge: self.edge,
                issuer: handle.edge,
            });
        }
        if handle.kind != self.kind {
            return Err(ReservationError::KindMismatch {
                edge: self.edge,
                expected: self.kind,
                actual: handle.kind,
            });
        }
        Ok(())
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

    #[test]
    fn grants_follow_request_order() {
        let t = owners(3);
        let mut q = ReservationQueue::new(EdgeId(0), ReservationKind::Put);
        let a = q.enqueue(t[0], 0);
        let b = q.enqueue(t[1], 0);
        let c = q.enqueue(t[2], 0);
        assert_eq!(q.grant_head().map(|g| g.handle), Some(a));
        assert_eq!(q.grant_head().map(|g| g.handle), Some(b));
        assert_eq!(q.grant_head().map(|g| g.handle), Some(c));
        assert!(q.grant_head().is_none());
        assert_eq!(q.granted_ids(), vec![a.id, b.id, c.id]);
    }

    #[test]
    fn lower_priority_value_is_served_first() {
        let t = owners(2);
        let mut q = ReservationQueue::new(EdgeId(0), ReservationKind::Get);
        let late_low = q.enqueue(t[0], 5);
        let early_high = q.enqueue(t[1], -1);
        assert_eq!(q.grant_head().map(|g| g.handle), Some(early_high));
        assert_eq!(q.grant_head().map(|g| g.handle), Some(late_low));
    }

    #[test]
    fn consume_requires_grant_and_owner() {
        let t = owners(2);
        let mut q = ReservationQueue::new(EdgeId(4), ReservationKind::Put);
        let h = q.enqueue(t[0], 0);

        let err = q.consume(t[0], h).unwrap_err();
        assert!(matches!(
            err,
            ReservationError::NotGranted { status: Some(ReservationStatus::Pending), .. }
        ));

        q.grant_head();
        let err = q.consume(t[1], h).unwrap_err();
        assert!(matches!(err, ReservationError::WrongOwner { .. }));

        let r = q.consume(t[0], h).unwrap();
        assert_eq!(r.status, ReservationStatus::Consumed);

        // A consumed ticket cannot be reused.
        let err = q.consume(t[0], h).unwrap_err();
        assert!(matches!(err, ReservationError::NotGranted { status: None, .. }));
    }

    #[test]
    fn cancel_reports_where_the_ticket_was() {
        let t = owners(1);
        let mut q = ReservationQueue::new(EdgeId(0), ReservationKind::Get);
        let granted = q.enqueue(t[0], 0);
        let pending = q.enqueue(t[0], 0);
        q.grant_head();

        let (prev, r) = q.cancel(pending).unwrap();
        assert_eq!(prev, ReservationStatus::Pending);
        assert_eq!(r.status, ReservationStatus::Cancelled);

        let (prev, _) = q.cancel(granted).unwrap();
        assert_eq!(prev, ReservationStatus::Granted);

        assert!(matches!(q.cancel(granted), Err(ReservationError::Unknown { .. })));
        assert_eq!(q.pending_len() + q.granted_len(), 0);
    }

    #[test]
    fn handles_are_checked_against_edge_and_kind() {
        let t = owners(1);
        let mut puts = ReservationQueue::new(EdgeId(1), ReservationKind::Put);
        let mut gets = ReservationQueue::new(EdgeId(1), ReservationKind::Get);
        let mut other = ReservationQueue::new(EdgeId(2), ReservationKind::Put);
        let h = puts.enqueue(t[0], 0);
        assert!(matches!(gets.cancel(h), Err(ReservationError::KindMismatch { .. })));
        assert!(matches!(other.cancel(h), Err(ReservationError::ForeignHandle { .. })));
    }

    #[test]
    fn status_tracks_lifecycle() {
        let t = owners(1);
        let mut q = ReservationQueue::new(EdgeId(0), ReservationKind::Put);
        let h = q.enqueue(t[0], 0);
        assert_eq!(q.status(h.id), Some(ReservationStatus::Pending));
        q.grant_head();
        assert_eq!(q.status(h.id), Some(ReservationStatus::Granted));
        assert!(q.is_granted(h.id));
        q.consume(t[0], h).unwrap();
        assert_eq!(q.status(h.id), None);
    }
}
