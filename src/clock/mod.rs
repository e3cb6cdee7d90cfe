use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns current monotonic clock value in nanoseconds.
///
/// Same timebase as `bpf_ktime_get_ns()`, so it can be compared directly
/// against allocation timestamps written by the probes.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and does not
    // require any Rust-side invariants besides a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}

/// Milliseconds since the Unix epoch, used to name snapshots.
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Convert a duration to whole nanoseconds, saturating.
pub fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_ns_does_not_go_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_wall_clock_ms_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(wall_clock_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_duration_ns() {
        assert_eq!(duration_ns(Duration::from_millis(500)), 500_000_000);
        assert_eq!(duration_ns(Duration::MAX), u64::MAX);
    }
}
