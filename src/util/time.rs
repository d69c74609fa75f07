//! Monotonic clock helpers.
//!
//! All dispatcher timestamps are signed nanoseconds on the monotonic clock so
//! that deadlines can be compared and offset with plain integer arithmetic.

use nix::time::{clock_gettime, ClockId};

/// Nanoseconds on the monotonic clock.
pub type Nsecs = i64;

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Deadline value meaning "no deadline".
pub const NEVER: Nsecs = i64::MAX;

/// Current monotonic time in nanoseconds.
pub fn now() -> Nsecs {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("monotonic clock unavailable");
    ts.tv_sec() * NANOS_PER_SECOND + ts.tv_nsec()
}

pub fn millis_to_nanos(millis: i64) -> Nsecs {
    millis.saturating_mul(NANOS_PER_MILLI)
}

pub fn nanos_to_millis(nanos: Nsecs) -> i64 {
    nanos / NANOS_PER_MILLI
}
