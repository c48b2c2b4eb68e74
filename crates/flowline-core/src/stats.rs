//! Per-edge statistics: time-weighted occupancy and time spent in each
//! state.

use crate::time::{SimDuration, SimTime};
use std::collections::BTreeMap;

/// Integral of an edge's item count over virtual time.
///
/// `record` must be called with the level *after* every change; the level
/// is assumed constant between calls.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OccupancyStats {
    last_change: SimTime,
    level: usize,
    weighted: SimTime,
}

impl OccupancyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, now: SimTime, level: usize) {
        if now > self.last_change {
            self.weighted = self
                .weighted
                .saturating_add((now - self.last_change).saturating_mul_int(self.level as i64));
            self.last_change = now;
        }
        self.level = level;
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Average level over `[0, now]`. Zero before any time has passed.
    pub fn average(&self, now: SimTime) -> f64 {
        if now <= SimTime::ZERO {
            return 0.0;
        }
        let pending = if now > self.last_change {
            (now - self.last_change).saturating_mul_int(self.level as i64)
        } else {
            SimTime::ZERO
        };
        (self.weighted.saturating_add(pending)).to_num::<f64>() / now.to_num::<f64>()
    }
}

/// Accumulated virtual time per state of a piecewise-constant state signal.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTimes<S> {
    current: S,
    since: SimTime,
    totals: BTreeMap<S, SimDuration>,
}

impl<S: Copy + Ord> StateTimes<S> {
    pub fn new(initial: S, now: SimTime) -> Self {
        Self {
            current: initial,
            since: now,
            totals: BTreeMap::new(),
        }
    }

    /// Close the current interval at `now` and continue in `state`.
    pub fn record(&mut self, now: SimTime, state: S) {
        if now > self.since {
            *self.totals.entry(self.current).or_insert(SimDuration::ZERO) += now - self.since;
            self.since = now;
        }
        self.current = state;
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Time spent in `state` up to `now`, including the open interval.
    pub fn time_in(&self, state: S, now: SimTime) -> SimDuration {
        let closed = self.totals.get(&state).copied().unwrap_or(SimDuration::ZERO);
        if state == self.current && now > self.since {
            closed + (now - self.since)
        } else {
            closed
        }
    }

    /// Every state visited so far with its time up to `now`.
    pub fn totals(&self, now: SimTime) -> BTreeMap<S, SimDuration> {
        let mut totals = self.totals.clone();
        if now > self.since {
            *totals.entry(self.current).or_insert(SimDuration::ZERO) += now - self.since;
        }
        totals
    }
}
