//! Passive transport elements between stages.
//!
//! An [`Edge`] is either a discrete buffer or a continuous belt. Both expose
//! the same reserve/commit/cancel contract, so stage logic never needs to
//! know which one it is talking to.

use crate::id::{EdgeId, TaskId};
use crate::reservation::{Grant, ReservationHandle, ReservationStatus};
use crate::sim::{ScheduleError, Scheduler, Wakeup};
use crate::store::{BufferState, ReservableStore, StoreError};
use crate::transport::{Belt, BeltError, BeltState};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Buffer,
    Conveyor,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Buffer => f.write_str("buffer"),
            EdgeKind::Conveyor => f.write_str("conveyor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EdgeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Belt(#[from] BeltError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// What an edge is doing, keyed for per-state time accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeState {
    Buffer(BufferState),
    Conveyor(BeltState),
}

#[derive(Debug)]
pub enum Edge<T> {
    Buffer(ReservableStore<T>),
    Conveyor(Belt<T>),
}

impl<T> Edge<T> {
    pub fn kind(&self) -> EdgeKind {
        match self {
            Edge::Buffer(_) => EdgeKind::Buffer,
            Edge::Conveyor(_) => EdgeKind::Conveyor,
        }
    }

    pub fn id(&self) -> EdgeId {
        match self {
            Edge::Buffer(store) => store.id(),
            Edge::Conveyor(belt) => belt.id(),
        }
    }

    pub fn reserve_put(&mut self, owner: TaskId) -> ReservationHandle {
        self.reserve_put_with_priority(owner, 0)
    }

    pub fn reserve_put_with_priority(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        match self {
            Edge::Buffer(store) => store.reserve_put_with_priority(owner, priority),
            Edge::Conveyor(belt) => belt.reserve_put_with_priority(owner, priority),
        }
    }

    pub fn commit_put(
        &mut self,
        sched: &mut Scheduler,
        owner: TaskId,
        handle: ReservationHandle,
        item: T,
    ) -> Result<(), EdgeError> {
        match self {
            Edge::Buffer(store) => {
                if let Some(seq) = store.commit_put(owner, handle, item)? {
                    let edge = store.id();
                    sched.schedule_timeout(store.delay(), Wakeup::ItemReady { edge, seq })?;
                }
            }
            Edge::Conveyor(belt) => {
                belt.commit_put(sched, owner, handle, item)?;
            }
        }
        Ok(())
    }

    pub fn cancel_put(&mut self, handle: ReservationHandle) -> Result<bool, EdgeError> {
        Ok(match self {
            Edge::Buffer(store) => store.cancel_put(handle)?,
            Edge::Conveyor(belt) => belt.cancel_put(handle)?,
        })
    }

    pub fn reserve_get(&mut self, owner: TaskId) -> ReservationHandle {
        self.reserve_get_with_priority(owner, 0)
    }

    pub fn reserve_get_with_priority(&mut self, owner: TaskId, priority: i32) -> ReservationHandle {
        match self {
            Edge::Buffer(store) => store.reserve_get_with_priority(owner, priority),
            Edge::Conveyor(belt) => belt.reserve_get_with_priority(owner, priority),
        }
    }

    /// Remove the item bound to `handle`. Belt items are unwrapped to their
    /// payload.
    pub fn commit_get(
        &mut self,
        sched: &mut Scheduler,
        owner: TaskId,
        handle: ReservationHandle,
    ) -> Result<T, EdgeError> {
        Ok(match self {
            Edge::Buffer(store) => store.commit_get(owner, handle)?,
            Edge::Conveyor(belt) => belt.commit_get(sched, owner, handle)?.into_payload(),
        })
    }

    pub fn cancel_get(&mut self, handle: ReservationHandle) -> Result<bool, EdgeError> {
        Ok(match self {
            Edge::Buffer(store) => store.cancel_get(handle)?,
            Edge::Conveyor(belt) => belt.cancel_get(handle)?,
        })
    }

    pub fn can_put(&self) -> bool {
        match self {
            Edge::Buffer(store) => store.can_put(),
            Edge::Conveyor(belt) => belt.can_put(),
        }
    }

    pub fn can_get(&self) -> bool {
        match self {
            Edge::Buffer(store) => store.can_get(),
            Edge::Conveyor(belt) => belt.can_get(),
        }
    }

    /// Items held: settled items for a buffer, in-motion plus arrived items
    /// for a belt.
    pub fn len(&self) -> usize {
        match self {
            Edge::Buffer(store) => store.len(),
            Edge::Conveyor(belt) => belt.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            Edge::Buffer(store) => store.capacity(),
            Edge::Conveyor(belt) => belt.capacity(),
        }
    }

    pub fn state(&self) -> EdgeState {
        match self {
            Edge::Buffer(store) => EdgeState::Buffer(store.state()),
            Edge::Conveyor(belt) => EdgeState::Conveyor(belt.state()),
        }
    }

    pub fn status(&self, handle: ReservationHandle) -> Option<ReservationStatus> {
        match self {
            Edge::Buffer(store) => store.status(handle),
            Edge::Conveyor(belt) => belt.status(handle),
        }
    }

    pub fn is_granted(&self, handle: ReservationHandle) -> bool {
        self.status(handle) == Some(ReservationStatus::Granted)
    }

    pub fn drain_grants(&mut self) -> Vec<Grant> {
        match self {
            Edge::Buffer(store) => store.drain_grants(),
            Edge::Conveyor(belt) => belt.drain_grants(),
        }
    }

    pub fn as_buffer(&self) -> Option<&ReservableStore<T>> {
        match self {
            Edge::Buffer(store) => Some(store),
            Edge::Conveyor(_) => None,
        }
    }

    pub fn as_buffer_mut(&mut self) -> Option<&mut ReservableStore<T>> {
        match self {
            Edge::Buffer(store) => Some(store),
            Edge::Conveyor(_) => None,
        }
    }

    pub fn as_belt(&self) -> Option<&Belt<T>> {
        match self {
            Edge::Conveyor(belt) => Some(belt),
            Edge::Buffer(_) => None,
        }
    }

    pub fn as_belt_mut(&mut self) -> Option<&mut Belt<T>> {
        match self {
            Edge::Conveyor(belt) => Some(belt),
            Edge::Buffer(_) => None,
        }
    }
}
