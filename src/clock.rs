//! Wall-clock helpers for cool-down bookkeeping.
//!
//! Records are shared across processes, so timestamps are seconds since
//! the Unix epoch rather than a per-process monotonic anchor.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in seconds since the Unix epoch.
pub(crate) fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Absolute instant at which an open window expires.
pub(crate) fn expires_at(opened_at: f64, ttl: f64) -> f64 {
    opened_at + ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_positive_and_advances() {
        let t1 = now();
        assert!(t1 > 0.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(now() > t1);
    }

    #[test]
    fn test_expires_at_offsets_by_ttl() {
        assert_eq!(expires_at(100.0, 30.0), 130.0);
    }
}
