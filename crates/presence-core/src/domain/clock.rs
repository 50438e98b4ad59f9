//! The single wall-clock source for liveness arithmetic.
//!
//! Every timestamp in the system is milliseconds since the Unix epoch as a
//! `u64`.  Registry methods take `now_ms` as a parameter rather than reading
//! the clock themselves, so tests can drive time explicitly.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_nonzero() {
        assert!(now_ms() > 0, "timestamp must be positive");
    }

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
