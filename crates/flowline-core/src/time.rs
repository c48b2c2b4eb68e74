use fixed::types::I32F32;

/// Q32.32 fixed-point instant on the virtual clock.
///
/// Instants and durations share one representation so that belt
/// bookkeeping (phase durations, interruption totals) stays exact under
/// addition and subtraction.
pub type SimTime = I32F32;

/// A span of virtual time. Same representation as [`SimTime`].
pub type SimDuration = I32F32;

/// Slack used when comparing continuous positions against slot boundaries.
/// About one microsecond of virtual time.
pub const TIME_TOLERANCE: SimTime = SimTime::from_bits(1 << 12);

/// Convert an f64 to SimTime. Use only for construction, never in the event loop.
#[inline]
pub fn time_from_f64(v: f64) -> SimTime {
    SimTime::from_num(v)
}

/// Convert SimTime to f64. Use only for display and reporting.
#[inline]
pub fn time_to_f64(v: SimTime) -> f64 {
    v.to_num::<f64>()
}

/// Checked division that rejects non-positive divisors and overflow.
#[inline]
pub fn checked_div_time(a: SimTime, b: SimTime) -> Option<SimTime> {
    if b <= SimTime::ZERO {
        return None;
    }
    a.checked_div(b)
}

/// `ceil(a / b)` as a slot index. Non-positive numerators map to slot 0.
///
/// Returns `None` when `b` is not positive or the quotient overflows.
pub fn ceil_div(a: SimTime, b: SimTime) -> Option<usize> {
    if a <= SimTime::ZERO {
        return checked_div_time(SimTime::ZERO, b).map(|_| 0);
    }
    let q = checked_div_time(a, b)?;
    let c = q.checked_ceil()?;
    Some(c.to_num::<u64>() as usize)
}
