use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to one allocation record (or stack) during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScanOutcome {
    /// Record passed the filters and was folded into a stack aggregate.
    Included = 0,
    /// Record was younger than the minimum age.
    TooYoung = 1,
    /// Stack capture failed in the instrumentation (negative stack id).
    NoStack = 2,
    /// Stack id had no trace left in the stack table.
    StackLost = 3,
}

/// Number of [`ScanOutcome`] variants, used for array sizing.
pub const SCAN_OUTCOMES: usize = 4;

impl ScanOutcome {
    /// Returns the log/metric label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Included => "included",
            Self::TooYoung => "too_young",
            Self::NoStack => "no_stack",
            Self::StackLost => "stack_lost",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Included),
            1 => Some(Self::TooYoung),
            2 => Some(Self::NoStack),
            3 => Some(Self::StackLost),
            _ => None,
        }
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::Included,
            Self::TooYoung,
            Self::NoStack,
            Self::StackLost,
        ]
    }
}

/// Lock-free per-outcome counters.
///
/// `snapshot()` reads and resets all counters, so each call reports the
/// activity since the previous one.
pub struct ScanStats {
    counts: [AtomicU64; SCAN_OUTCOMES],
}

impl ScanStats {
    /// Create a new zeroed ScanStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given outcome by one.
    pub fn record(&self, outcome: ScanOutcome) {
        self.record_n(outcome, 1);
    }

    /// Increment the counter for the given outcome by n.
    pub fn record_n(&self, outcome: ScanOutcome, n: u64) {
        if let Some(counter) = self.counts.get(outcome as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(ScanOutcome, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(outcome) = ScanOutcome::from_u8(i as u8) {
                    result.push((outcome, v));
                }
            }
        }

        result
    }
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_of(snap: &[(ScanOutcome, u64)], outcome: ScanOutcome) -> Option<u64> {
        snap.iter().find(|(o, _)| *o == outcome).map(|(_, v)| *v)
    }

    #[test]
    fn test_record_and_snapshot() {
        let stats = ScanStats::new();
        stats.record(ScanOutcome::Included);
        stats.record(ScanOutcome::Included);
        stats.record(ScanOutcome::TooYoung);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(count_of(&snap, ScanOutcome::Included), Some(2));
        assert_eq!(count_of(&snap, ScanOutcome::TooYoung), Some(1));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = ScanStats::new();
        stats.record(ScanOutcome::StackLost);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_record_n() {
        let stats = ScanStats::new();
        stats.record_n(ScanOutcome::NoStack, 42);

        let snap = stats.snapshot();
        assert_eq!(count_of(&snap, ScanOutcome::NoStack), Some(42));
    }

    #[test]
    fn test_outcome_round_trip_through_u8() {
        for outcome in ScanOutcome::all() {
            assert_eq!(ScanOutcome::from_u8(*outcome as u8), Some(*outcome));
        }
        assert_eq!(ScanOutcome::from_u8(SCAN_OUTCOMES as u8), None);
    }
}
