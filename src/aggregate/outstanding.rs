//! Outstanding allocations grouped by call stack.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resolve::StackResolver;
use crate::tracer::stats::{ScanOutcome, ScanStats};
use crate::tracer::AllocationTable;

use super::topk;

/// Outstanding bytes and allocation count attributed to one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackAggregate {
    pub stack_id: i64,
    pub frames: Vec<String>,
    pub total_size: u64,
    pub count: u64,
}

impl StackAggregate {
    /// Start an aggregate from its first record.
    pub fn new(stack_id: i64, frames: Vec<String>, size: u64) -> Self {
        Self {
            stack_id,
            frames,
            total_size: size,
            count: 1,
        }
    }

    /// Fold one more record into the aggregate.
    pub fn update(&mut self, size: u64) {
        self.count += 1;
        self.total_size = self.total_size.saturating_add(size);
    }
}

/// Builds per-stack aggregates from the live allocation table.
pub struct OutstandingTracker {
    allocs: Arc<dyn AllocationTable>,
    resolver: StackResolver,
    min_age_ns: u64,
    top: usize,
}

impl OutstandingTracker {
    pub fn new(
        allocs: Arc<dyn AllocationTable>,
        resolver: StackResolver,
        min_age_ns: u64,
        top: usize,
    ) -> Self {
        Self {
            allocs,
            resolver,
            min_age_ns,
            top,
        }
    }

    /// Scan the allocation table once and return the `top` stacks by
    /// outstanding bytes, ascending.
    ///
    /// Records younger than the minimum age or without a stack are skipped.
    /// Frames are resolved once per stack per call.
    pub fn collect(&self, stats: &ScanStats) -> Vec<StackAggregate> {
        let now_ns = self.allocs.monotonic_now_ns();
        let records = self.allocs.allocations();

        let mut by_stack: BTreeMap<i64, StackAggregate> = BTreeMap::new();

        for rec in &records {
            if !rec.is_older_than(self.min_age_ns, now_ns) {
                stats.record(ScanOutcome::TooYoung);
                continue;
            }
            if !rec.has_stack() {
                stats.record(ScanOutcome::NoStack);
                continue;
            }

            stats.record(ScanOutcome::Included);
            tracing::trace!(
                address = format_args!("{:#x}", rec.address),
                size = rec.size,
                stack_id = rec.stack_id,
                "outstanding allocation",
            );

            match by_stack.entry(rec.stack_id) {
                Entry::Occupied(mut e) => e.get_mut().update(rec.size),
                Entry::Vacant(e) => {
                    let frames = self.resolver.resolve_with_addresses(rec.stack_id);
                    if frames.is_empty() {
                        stats.record(ScanOutcome::StackLost);
                    }
                    e.insert(StackAggregate::new(rec.stack_id, frames, rec.size));
                }
            }
        }

        tracing::debug!(
            records = records.len(),
            stacks = by_stack.len(),
            "outstanding allocation scan complete",
        );

        topk::select(
            by_stack.into_values().collect(),
            |agg| agg.total_size,
            self.top,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::Symbol;
    use crate::tracer::memory::{CountingStacks, MemoryTables};

    fn tracker(tables: &Arc<MemoryTables>, min_age_ns: u64, top: usize) -> OutstandingTracker {
        let resolver = StackResolver::new(tables.clone(), tables.clone(), 1);
        OutstandingTracker::new(tables.clone(), resolver, min_age_ns, top)
    }

    #[test]
    fn test_three_records_one_stack() {
        let t = Arc::new(MemoryTables::new());
        t.insert_stack(1, vec![0x10]);
        t.insert_symbol(0x10, Symbol::new("leaky"));
        t.record_alloc_at(0xa, 100, 1, 0);
        t.record_alloc_at(0xb, 200, 1, 0);
        t.record_alloc_at(0xc, 300, 1, 0);
        t.set_now_ns(10_000);

        let stats = ScanStats::new();
        let out = tracker(&t, 500, 10).collect(&stats);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].total_size, 600);
        assert_eq!(out[0].count, 3);
        assert_eq!(out[0].frames, vec!["0x0000000000000010\tleaky"]);
    }

    #[test]
    fn test_stack_resolved_once_per_collect() {
        let t = Arc::new(MemoryTables::new());
        t.insert_stack(1, vec![0x10, 0x20]);
        t.insert_stack(2, vec![0x30]);
        t.record_alloc_at(0xa, 100, 1, 0);
        t.record_alloc_at(0xb, 200, 1, 0);
        t.record_alloc_at(0xc, 300, 1, 0);
        t.record_alloc_at(0xd, 50, 2, 0);
        t.set_now_ns(10_000);

        let stacks = Arc::new(CountingStacks::new(t.clone()));
        let resolver = StackResolver::new(stacks.clone(), t.clone(), 1);
        let tracker = OutstandingTracker::new(t.clone(), resolver, 0, 10);

        let out = tracker.collect(&ScanStats::new());
        assert_eq!(out.len(), 2);
        assert_eq!(stacks.lookups(), 2);

        // A second pass resolves afresh.
        tracker.collect(&ScanStats::new());
        assert_eq!(stacks.lookups(), 4);
    }

    #[test]
    fn test_age_boundary() {
        let t = Arc::new(MemoryTables::new());
        t.insert_stack(1, vec![0x10]);
        t.set_now_ns(1_000);
        t.record_alloc_at(0xa, 8, 1, 500); // exactly min_age old
        t.record_alloc_at(0xb, 16, 1, 501); // too young

        let stats = ScanStats::new();
        let out = tracker(&t, 500, 10).collect(&stats);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].total_size, 8);
        assert_eq!(out[0].count, 1);

        let snap = stats.snapshot();
        assert!(snap.contains(&(ScanOutcome::Included, 1)));
        assert!(snap.contains(&(ScanOutcome::TooYoung, 1)));
    }

    #[test]
    fn test_negative_stack_id_dropped() {
        let t = Arc::new(MemoryTables::new());
        t.record_alloc_at(0xa, 64, -1, 0);
        t.set_now_ns(1_000_000);

        let stats = ScanStats::new();
        assert!(tracker(&t, 0, 10).collect(&stats).is_empty());
        assert_eq!(stats.snapshot(), vec![(ScanOutcome::NoStack, 1)]);
    }

    #[test]
    fn test_evicted_stack_degrades_to_empty_frames() {
        let t = Arc::new(MemoryTables::new());
        t.record_alloc_at(0xa, 64, 9, 0);
        t.set_now_ns(1_000);

        let stats = ScanStats::new();
        let out = tracker(&t, 0, 10).collect(&stats);
        assert_eq!(out.len(), 1);
        assert!(out[0].frames.is_empty());
        assert!(stats.snapshot().contains(&(ScanOutcome::StackLost, 1)));
    }

    #[test]
    fn test_top_k_by_total_size() {
        let t = Arc::new(MemoryTables::new());
        for (i, size) in [10u64, 500, 40, 300].into_iter().enumerate() {
            let stack = i as i64;
            t.insert_stack(stack, vec![0x100 + i as u64]);
            t.record_alloc_at(0x1000 + i as u64, size, stack, 0);
        }
        t.set_now_ns(1_000);

        let out = tracker(&t, 0, 2).collect(&ScanStats::new());
        let sizes: Vec<u64> = out.iter().map(|a| a.total_size).collect();
        assert_eq!(sizes, vec![300, 500]);
    }

    #[test]
    fn test_update_is_order_independent() {
        let mut a = StackAggregate::new(1, Vec::new(), 7);
        a.update(11);
        let mut b = StackAggregate::new(1, Vec::new(), 11);
        b.update(7);
        assert_eq!(a, b);
        assert_eq!(a.count, 2);
        assert_eq!(a.total_size, 18);
    }
}
