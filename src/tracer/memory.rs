//! In-process implementation of the instrumentation tables.
//!
//! Mirrors what the kernel-side probes do to their maps: allocation exits
//! insert a record and bump per-stack counters, frees remove the record and
//! bump the free side, syscall exits accumulate into a windowed counter.
//! Backed by sharded concurrent maps, so writers never block a reader and a
//! reader's enumeration is not atomic across shards, the same guarantee the
//! kernel maps give.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::event::{
    AllocationRecord, CombinedStackCounter, KernelCacheCounter, Symbol, SyscallCounter,
};
use super::{
    AllocationTable, CombinedAllocTable, KernelCacheTable, StackTable, SyscallTable, Symbolizer,
    TableError,
};

/// Concurrent in-memory tables with a settable monotonic clock.
#[derive(Default)]
pub struct MemoryTables {
    now_ns: AtomicU64,
    allocs: DashMap<u64, AllocationRecord>,
    stacks: DashMap<i64, Vec<u64>>,
    combined: DashMap<i64, CombinedStackCounter>,
    caches: DashMap<String, KernelCacheCounter>,
    syscalls: DashMap<u32, SyscallCounter>,
    symbols: DashMap<u64, Symbol>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the monotonic clock.
    pub fn set_now_ns(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Relaxed);
    }

    /// Move the monotonic clock forward.
    pub fn advance_ns(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    /// Store a captured stack, innermost frame first.
    pub fn insert_stack(&self, stack_id: i64, addresses: Vec<u64>) {
        self.stacks.insert(stack_id, addresses);
    }

    /// Drop a stack as the kernel does when the stack map is full.
    pub fn evict_stack(&self, stack_id: i64) {
        self.stacks.remove(&stack_id);
    }

    /// Register the symbol an address resolves to.
    pub fn insert_symbol(&self, address: u64, symbol: Symbol) {
        self.symbols.insert(address, symbol);
    }

    /// Record an allocation stamped with the current clock.
    pub fn record_alloc(&self, address: u64, size: u64, stack_id: i64) {
        let now = self.now_ns.load(Ordering::Relaxed);
        self.record_alloc_at(address, size, stack_id, now);
    }

    /// Record an allocation with an explicit timestamp.
    pub fn record_alloc_at(&self, address: u64, size: u64, stack_id: i64, timestamp_ns: u64) {
        self.allocs.insert(
            address,
            AllocationRecord {
                address,
                size,
                timestamp_ns,
                stack_id,
            },
        );

        if stack_id < 0 {
            return;
        }

        let mut entry = self
            .combined
            .entry(stack_id)
            .or_insert_with(|| CombinedStackCounter {
                stack_id,
                ..Default::default()
            });
        entry.alloc_size = entry.alloc_size.saturating_add(size);
        entry.number_of_allocs = entry.number_of_allocs.saturating_add(1);
    }

    /// Record a free. Returns false if the address was not tracked.
    pub fn record_free(&self, address: u64) -> bool {
        let Some((_, record)) = self.allocs.remove(&address) else {
            return false;
        };

        if let Some(mut entry) = self.combined.get_mut(&record.stack_id) {
            entry.free_size = entry.free_size.saturating_add(record.size);
            entry.number_of_frees = entry.number_of_frees.saturating_add(1);
        }

        true
    }

    /// Overwrite the combined counter for a stack.
    pub fn set_combined(&self, counter: CombinedStackCounter) {
        self.combined.insert(counter.stack_id, counter);
    }

    /// Record a slab cache allocation.
    pub fn record_cache_alloc(&self, name: &str, size: u64) {
        let mut entry = self.cache_entry(name);
        entry.alloc_count = entry.alloc_count.saturating_add(1);
        entry.alloc_size = entry.alloc_size.saturating_add(size);
    }

    /// Record a slab cache free.
    pub fn record_cache_free(&self, name: &str, size: u64) {
        let mut entry = self.cache_entry(name);
        entry.free_count = entry.free_count.saturating_add(1);
        entry.free_size = entry.free_size.saturating_add(size);
    }

    /// Overwrite the counters for a slab cache.
    pub fn set_cache(&self, counter: KernelCacheCounter) {
        self.caches.insert(counter.name.clone(), counter);
    }

    /// Record one completed syscall.
    pub fn record_syscall(&self, syscall_id: u32, duration_ns: u64) {
        let mut entry = self
            .syscalls
            .entry(syscall_id)
            .or_insert_with(|| SyscallCounter {
                syscall_id,
                ..Default::default()
            });
        entry.count = entry.count.saturating_add(1);
        entry.total_ns = entry.total_ns.saturating_add(duration_ns);
    }

    fn cache_entry(
        &self,
        name: &str,
    ) -> dashmap::mapref::one::RefMut<'_, String, KernelCacheCounter> {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| KernelCacheCounter {
                name: name.to_string(),
                alloc_count: 0,
                free_count: 0,
                alloc_size: 0,
                free_size: 0,
            })
    }
}

impl AllocationTable for MemoryTables {
    fn monotonic_now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }

    fn allocations(&self) -> Vec<AllocationRecord> {
        self.allocs.iter().map(|e| *e.value()).collect()
    }
}

impl StackTable for MemoryTables {
    fn addresses(&self, stack_id: i64) -> Option<Vec<u64>> {
        self.stacks.get(&stack_id).map(|e| e.value().clone())
    }

    fn stack_count(&self) -> usize {
        self.stacks.len()
    }
}

impl CombinedAllocTable for MemoryTables {
    fn combined_counters(&self) -> Vec<CombinedStackCounter> {
        self.combined.iter().map(|e| *e.value()).collect()
    }
}

impl KernelCacheTable for MemoryTables {
    fn cache_counters(&self) -> Vec<KernelCacheCounter> {
        self.caches.iter().map(|e| e.value().clone()).collect()
    }
}

impl SyscallTable for MemoryTables {
    fn syscall_counters(&self) -> Vec<SyscallCounter> {
        self.syscalls.iter().map(|e| *e.value()).collect()
    }

    fn clear(&self) -> Result<(), TableError> {
        self.syscalls.clear();
        Ok(())
    }
}

impl Symbolizer for MemoryTables {
    fn symbolize(&self, _pid: i32, address: u64) -> Option<Symbol> {
        self.symbols.get(&address).map(|e| e.value().clone())
    }
}

/// Stack table wrapper that counts lookups.
#[cfg(test)]
pub(crate) struct CountingStacks {
    inner: std::sync::Arc<MemoryTables>,
    lookups: AtomicU64,
}

#[cfg(test)]
impl CountingStacks {
    pub(crate) fn new(inner: std::sync::Arc<MemoryTables>) -> Self {
        Self {
            inner,
            lookups: AtomicU64::new(0),
        }
    }

    pub(crate) fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl StackTable for CountingStacks {
    fn addresses(&self, stack_id: i64) -> Option<Vec<u64>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.inner.addresses(stack_id)
    }

    fn stack_count(&self) -> usize {
        self.inner.stack_count()
    }
}
