//! Time helpers.
//!
//! Monotonic `Instant`s drive every timeout; wall-clock pairs (seconds,
//! microseconds) appear only where the protocol itself carries them
//! (auth responses, ping bodies).

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Protocol timestamp: seconds and nanoseconds, as carried in headers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VTime {
    pub sec: u32,
    pub nsec: u32,
}

impl VTime {
    pub fn new(sec: u32, nsec: u32) -> Self {
        VTime { sec, nsec }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    /// Total nanoseconds as a signed 64-bit value; wide enough that
    /// per-client offset arithmetic cannot wrap.
    pub fn as_nanos(&self) -> i64 {
        self.sec as i64 * 1_000_000_000 + self.nsec as i64
    }
}

/// Wall-clock now as (seconds, microseconds).
pub fn walltime_now() -> (i64, i64) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_micros() as i64),
        Err(_) => (0, 0),
    }
}

/// Difference `a - b` between two wall-clock pairs, in milliseconds.
pub fn walltime_diff_ms(a: (i64, i64), b: (i64, i64)) -> i64 {
    (a.0 - b.0) * 1000 + (a.1 - b.1) / 1000
}

/// Milliseconds since `t`; an unset `t` reads as infinitely long ago.
pub fn since_ms(t: Option<Instant>, now: Instant) -> u64 {
    match t {
        Some(t) => now.saturating_duration_since(t).as_millis() as u64,
        None => u64::MAX,
    }
}
