//! Monotonic time in microseconds.
//!
//! Timer-driven units report their next event as an absolute timestamp on
//! this clock, and frame buffers are stamped with it.

use rustix::time::{ClockId, Timespec, clock_gettime};
use std::time::Duration;

/// Microseconds in one second.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Current monotonic time in microseconds.
#[inline]
pub fn now_micros() -> i64 {
    let ts = clock_gettime(ClockId::Monotonic);
    ts.tv_sec as i64 * MICROS_PER_SEC + ts.tv_nsec as i64 / 1_000
}

/// Microseconds from now until `deadline`, clamped at zero.
#[inline]
pub fn micros_until(deadline: i64) -> i64 {
    (deadline - now_micros()).max(0)
}

/// Convert a non-negative microsecond count to a `Duration`.
#[inline]
pub fn micros_to_duration(micros: i64) -> Duration {
    Duration::from_micros(micros.max(0) as u64)
}

/// Frame interval in microseconds for a rate in frames per second.
///
/// Rates at or below zero map to one frame per second.
#[inline]
pub fn frame_interval_micros(fps: f64) -> i64 {
    if fps <= 0.0 {
        return MICROS_PER_SEC;
    }
    (MICROS_PER_SEC as f64 / fps).round() as i64
}

/// Convert a `Duration` into the poll timeout representation.
#[inline]
pub fn to_timespec(duration: Duration) -> Timespec {
    Timespec {
        tv_sec: duration.as_secs().min(i64::MAX as u64) as i64,
        tv_nsec: duration.subsec_nanos() as _,
    }
}
