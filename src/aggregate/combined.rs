//! Net outstanding memory per stack from the long-lived counters.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resolve::StackResolver;
use crate::tracer::event::CombinedStackCounter;
use crate::tracer::CombinedAllocTable;

use super::topk;

/// Frame reported in place of a stack that can no longer be resolved.
pub const STACK_LOST: &str = "stack information lost";

/// One leaking stack with its counters and resolved frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedStackEntry {
    pub stack_id: i64,
    pub alloc_size: u64,
    pub free_size: u64,
    pub number_of_allocs: u64,
    pub number_of_frees: u64,
    pub trace: Vec<String>,
}

impl CombinedStackEntry {
    fn counter(&self) -> CombinedStackCounter {
        CombinedStackCounter {
            stack_id: self.stack_id,
            alloc_size: self.alloc_size,
            free_size: self.free_size,
            number_of_allocs: self.number_of_allocs,
            number_of_frees: self.number_of_frees,
        }
    }

    pub fn net_size(&self) -> i64 {
        self.counter().net_size()
    }

    pub fn net_count(&self) -> i64 {
        self.counter().net_count()
    }

    pub fn events(&self) -> u64 {
        self.counter().events()
    }
}

/// Summary of the combined counters for one interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedStats {
    /// Net outstanding bytes summed over every counter, not just the top.
    pub memory: i64,
    /// Number of per-stack counters.
    pub allocations: usize,
    /// Stacks currently held by the stack table.
    pub stack_traces: usize,
    /// Top stacks by net outstanding, largest first.
    pub stacks: Vec<CombinedStackEntry>,
}

pub struct CombinedAggregator {
    combined: Arc<dyn CombinedAllocTable>,
    resolver: StackResolver,
    top: usize,
}

impl CombinedAggregator {
    pub fn new(combined: Arc<dyn CombinedAllocTable>, resolver: StackResolver, top: usize) -> Self {
        Self {
            combined,
            resolver,
            top,
        }
    }

    pub fn collect(&self) -> CombinedStats {
        let counters = self.combined.combined_counters();
        let stack_traces = self.resolver.trace_count();

        let memory = counters
            .iter()
            .fold(0i64, |acc, c| acc.saturating_add(c.net_size()));
        let allocations = counters.len();

        let stacks = topk::select_desc(counters, |c| c.net_size(), self.top)
            .into_iter()
            .map(|c| {
                let mut trace = self.resolver.resolve(c.stack_id);
                if trace.is_empty() {
                    trace.push(STACK_LOST.to_string());
                }
                CombinedStackEntry {
                    stack_id: c.stack_id,
                    alloc_size: c.alloc_size,
                    free_size: c.free_size,
                    number_of_allocs: c.number_of_allocs,
                    number_of_frees: c.number_of_frees,
                    trace,
                }
            })
            .collect();

        CombinedStats {
            memory,
            allocations,
            stack_traces,
            stacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::Symbol;
    use crate::tracer::memory::{CountingStacks, MemoryTables};

    fn counter(stack_id: i64, alloc_size: u64, free_size: u64) -> CombinedStackCounter {
        CombinedStackCounter {
            stack_id,
            alloc_size,
            free_size,
            number_of_allocs: 7,
            number_of_frees: 3,
        }
    }

    fn aggregator(t: &Arc<MemoryTables>, top: usize) -> CombinedAggregator {
        let resolver = StackResolver::new(t.clone(), t.clone(), 1);
        CombinedAggregator::new(t.clone(), resolver, top)
    }

    #[test]
    fn test_top_one_picks_largest_net() {
        let t = Arc::new(MemoryTables::new());
        t.set_combined(counter(1, 5000, 4000));
        t.set_combined(counter(2, 1000, 1000));
        t.insert_stack(1, vec![0x10]);
        t.insert_symbol(0x10, Symbol::new("grow"));

        let stats = aggregator(&t, 1).collect();
        assert_eq!(stats.stacks.len(), 1);
        assert_eq!(stats.stacks[0].stack_id, 1);
        assert_eq!(stats.stacks[0].net_size(), 1000);
        assert_eq!(stats.stacks[0].trace, vec!["grow"]);
        assert_eq!(stats.memory, 1000);
        assert_eq!(stats.allocations, 2);
    }

    #[test]
    fn test_resolves_only_selected_stacks() {
        let t = Arc::new(MemoryTables::new());
        for stack in 0..20 {
            t.set_combined(counter(stack, 100 + stack as u64, 0));
            t.insert_stack(stack, vec![0x1000 + stack as u64]);
        }

        let stacks = Arc::new(CountingStacks::new(t.clone()));
        let resolver = StackResolver::new(stacks.clone(), t.clone(), 1);
        let stats = CombinedAggregator::new(t.clone(), resolver, 3).collect();

        assert_eq!(stats.stacks.len(), 3);
        assert_eq!(stats.allocations, 20);
        assert_eq!(stacks.lookups(), 3);
    }

    #[test]
    fn test_total_covers_all_counters() {
        let t = Arc::new(MemoryTables::new());
        t.set_combined(counter(1, 300, 100));
        t.set_combined(counter(2, 100, 250));
        t.set_combined(counter(3, 900, 0));

        let stats = aggregator(&t, 1).collect();
        assert_eq!(stats.memory, 200 - 150 + 900);
        assert_eq!(stats.stacks.len(), 1);
    }

    #[test]
    fn test_lost_stack_marker() {
        let t = Arc::new(MemoryTables::new());
        t.set_combined(counter(8, 64, 0));

        let stats = aggregator(&t, 5).collect();
        assert_eq!(stats.stacks[0].trace, vec![STACK_LOST]);
    }

    #[test]
    fn test_entries_largest_first() {
        let t = Arc::new(MemoryTables::new());
        t.set_combined(counter(1, 10, 0));
        t.set_combined(counter(2, 30, 0));
        t.set_combined(counter(3, 20, 0));

        let nets: Vec<i64> = aggregator(&t, 3)
            .collect()
            .stacks
            .iter()
            .map(CombinedStackEntry::net_size)
            .collect();
        assert_eq!(nets, vec![30, 20, 10]);
    }

    #[test]
    fn test_counts_stack_traces() {
        let t = Arc::new(MemoryTables::new());
        t.insert_stack(1, vec![1]);
        t.insert_stack(2, vec![2]);
        assert_eq!(aggregator(&t, 1).collect().stack_traces, 2);
    }

    #[test]
    fn test_entry_counts() {
        let e = CombinedStackEntry {
            stack_id: 1,
            alloc_size: 10,
            free_size: 4,
            number_of_allocs: 5,
            number_of_frees: 2,
            trace: Vec::new(),
        };
        assert_eq!(e.net_size(), 6);
        assert_eq!(e.net_count(), 3);
        assert_eq!(e.events(), 7);
    }
}
