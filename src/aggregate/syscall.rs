//! Syscalls ranked by time spent within the current window.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tracer::syscalls::syscall_name;
use crate::tracer::SyscallTable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallEntry {
    pub name: String,
    pub syscall_id: u32,
    pub count: u64,
    pub total_ns: u64,
}

impl SyscallEntry {
    /// Total time in microseconds.
    pub fn total_us(&self) -> f64 {
        self.total_ns as f64 / 1e3
    }
}

pub struct SyscallAggregator {
    syscalls: Arc<dyn SyscallTable>,
    top: usize,
}

impl SyscallAggregator {
    pub fn new(syscalls: Arc<dyn SyscallTable>, top: usize) -> Self {
        Self { syscalls, top }
    }

    /// Read the window's counters, then clear them.
    ///
    /// The result is fully built before the clear. A failed clear is logged
    /// and the counters carry over into the next window.
    pub fn collect(&self) -> Vec<SyscallEntry> {
        let mut counters = self.syscalls.syscall_counters();
        counters.sort_by(|a, b| b.total_ns.cmp(&a.total_ns));
        counters.truncate(self.top);

        let entries: Vec<SyscallEntry> = counters
            .into_iter()
            .map(|c| SyscallEntry {
                name: syscall_name(c.syscall_id).into_owned(),
                syscall_id: c.syscall_id,
                count: c.count,
                total_ns: c.total_ns,
            })
            .collect();

        if let Err(e) = self.syscalls.clear() {
            tracing::warn!(error = %e, "failed to clear syscall counters");
        }

        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::SyscallCounter;
    use crate::tracer::memory::MemoryTables;
    use crate::tracer::TableError;

    #[test]
    fn test_sorted_by_time_desc_and_cleared() {
        let t = Arc::new(MemoryTables::new());
        t.record_syscall(0, 1_000);
        t.record_syscall(1, 9_000);
        t.record_syscall(9, 5_000);
        t.record_syscall(9, 5_000);

        let agg = SyscallAggregator::new(t.clone(), 2);
        let out = agg.collect();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].syscall_id, 9);
        assert_eq!(out[0].count, 2);
        assert_eq!(out[0].total_ns, 10_000);
        assert_eq!(out[1].syscall_id, 1);
        assert_eq!(out[1].total_us(), 9.0);

        assert!(t.syscall_counters().is_empty());
        assert!(agg.collect().is_empty());
    }

    #[test]
    fn test_unknown_syscall_name() {
        let t = Arc::new(MemoryTables::new());
        t.record_syscall(9999, 1);

        let out = SyscallAggregator::new(t, 10).collect();
        assert_eq!(out[0].name, "[unknown: 9999]");
    }

    struct FailingClear;

    impl SyscallTable for FailingClear {
        fn syscall_counters(&self) -> Vec<SyscallCounter> {
            vec![SyscallCounter {
                syscall_id: 0,
                count: 1,
                total_ns: 10,
            }]
        }

        fn clear(&self) -> Result<(), TableError> {
            Err(TableError::Clear {
                name: "syscall_counts",
                reason: "busy".to_string(),
            })
        }
    }

    #[test]
    fn test_failed_clear_does_not_fail_pass() {
        let out = SyscallAggregator::new(Arc::new(FailingClear), 10).collect();
        assert_eq!(out.len(), 1);
    }
}
