pub mod combined;
pub mod kernel_cache;
pub mod outstanding;
pub mod syscall;
pub mod topk;

use std::time::Instant;

use crate::config::Config;
use crate::resolve::StackResolver;
use crate::sink::snapshot::Snapshot;
use crate::tracer::stats::ScanStats;
use crate::tracer::Tables;

use self::combined::CombinedAggregator;
use self::kernel_cache::KernelCacheAggregator;
use self::outstanding::OutstandingTracker;
use self::syscall::SyscallAggregator;

/// Runs the four aggregators against one set of tables.
pub struct Collector {
    outstanding: OutstandingTracker,
    combined: CombinedAggregator,
    kernel_caches: KernelCacheAggregator,
    syscalls: SyscallAggregator,
}

impl Collector {
    pub fn new(tables: &Tables, cfg: &Config) -> Self {
        let resolver = StackResolver::new(
            tables.stacks.clone(),
            tables.symbolizer.clone(),
            cfg.target.pid,
        );

        Self {
            outstanding: OutstandingTracker::new(
                tables.allocs.clone(),
                resolver.clone(),
                cfg.min_age_ns(),
                cfg.top,
            ),
            combined: CombinedAggregator::new(tables.combined.clone(), resolver, cfg.top),
            kernel_caches: KernelCacheAggregator::new(tables.kernel_caches.clone(), cfg.top),
            syscalls: SyscallAggregator::new(tables.syscalls.clone(), cfg.top),
        }
    }

    /// Run one full pass. Syscall counters are cleared as a side effect.
    pub fn collect(&self, time_ms: u64, scan_stats: &ScanStats) -> Snapshot {
        let started = Instant::now();

        let stats = self.combined.collect();
        let outstanding = self.outstanding.collect(scan_stats);
        let kernel_caches = self.kernel_caches.collect();
        let syscalls = self.syscalls.collect();

        tracing::debug!(
            combined_stacks = stats.stacks.len(),
            outstanding_stacks = outstanding.len(),
            kernel_caches = kernel_caches.as_ref().map_or(0, Vec::len),
            syscalls = syscalls.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "aggregation pass complete",
        );

        Snapshot::compose(time_ms, stats, outstanding, kernel_caches, syscalls)
    }
}
