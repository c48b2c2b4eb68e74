use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a process (task) running in an environment.
    pub struct TaskId;

    /// Identifies a timer registered with the scheduler.
    pub struct TimerId;

    /// Identifies an item currently in motion on a belt.
    pub struct TransitId;
}

/// Identifies an edge (buffer or conveyor). Assigned by the environment in
/// creation order, or chosen by the caller for standalone stores and belts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

/// Identifies a reservation. Unique within the queue that issued it and
/// increasing in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub u64);

/// Stable label of an item admitted onto a belt, in admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemTag(pub u64);

impl std::fmt::Display for ItemTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_ids_order_by_request() {
        assert!(ReservationId(1) < ReservationId(2));
        assert_eq!(ReservationId(7), ReservationId(7));
    }

    #[test]
    fn task_keys_are_distinct() {
        let mut tasks: slotmap::SlotMap<TaskId, ()> = slotmap::SlotMap::with_key();
        let a = tasks.insert(());
        let b = tasks.insert(());
        assert_ne!(a, b);
    }

    #[test]
    fn item_tag_display() {
        assert_eq!(ItemTag(3).to_string(), "#3");
    }
}
