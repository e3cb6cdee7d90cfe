pub mod event;
pub mod memory;
pub mod parse;
pub mod stats;
pub mod syscalls;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::sync::Arc;

use thiserror::Error;

use self::event::{
    AllocationRecord, CombinedStackCounter, KernelCacheCounter, Symbol, SyscallCounter,
};

/// Failures reported by an instrumentation table.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("clearing {name}: {reason}")]
    Clear { name: &'static str, reason: String },
}

impl TableError {
    /// Judge a key-by-key clear of `total` entries where `failed` deletes
    /// failed. Only a clear that removed nothing is an error; leftovers of a
    /// partial clear carry into the next window.
    pub fn check_clear(name: &'static str, failed: usize, total: usize) -> Result<(), Self> {
        if failed == 0 {
            return Ok(());
        }
        if failed == total {
            return Err(Self::Clear {
                name,
                reason: format!("failed to delete all {failed} keys"),
            });
        }

        tracing::debug!(table = name, failed, total, "partial clear, leftovers carry over");
        Ok(())
    }
}

/// Live allocations keyed by address.
///
/// `allocations()` enumerates entries as of the call; entries may be added
/// or removed while it runs and the result is not atomic across the table.
pub trait AllocationTable: Send + Sync {
    /// Monotonic clock reading on the same timebase as record timestamps.
    fn monotonic_now_ns(&self) -> u64;

    /// Copy out the current allocation records.
    fn allocations(&self) -> Vec<AllocationRecord>;
}

/// Captured call stacks keyed by stack id.
pub trait StackTable: Send + Sync {
    /// Return the instruction pointers of a stack, innermost frame first.
    /// `None` when the stack was evicted or never captured.
    fn addresses(&self, stack_id: i64) -> Option<Vec<u64>>;

    /// Number of stacks currently held.
    fn stack_count(&self) -> usize;
}

/// Long-lived per-stack alloc/free counters.
pub trait CombinedAllocTable: Send + Sync {
    fn combined_counters(&self) -> Vec<CombinedStackCounter>;
}

/// Per slab-cache counters.
pub trait KernelCacheTable: Send + Sync {
    fn cache_counters(&self) -> Vec<KernelCacheCounter>;
}

/// Windowed per-syscall counters.
pub trait SyscallTable: Send + Sync {
    fn syscall_counters(&self) -> Vec<SyscallCounter>;

    /// Remove every entry so the next window starts empty.
    fn clear(&self) -> Result<(), TableError>;
}

/// Resolves a code address in a process (or the kernel for pid <= 0).
pub trait Symbolizer: Send + Sync {
    fn symbolize(&self, pid: i32, address: u64) -> Option<Symbol>;
}

/// The set of collaborators an aggregation pass reads from.
#[derive(Clone)]
pub struct Tables {
    pub allocs: Arc<dyn AllocationTable>,
    pub stacks: Arc<dyn StackTable>,
    pub combined: Arc<dyn CombinedAllocTable>,
    pub kernel_caches: Arc<dyn KernelCacheTable>,
    pub syscalls: Arc<dyn SyscallTable>,
    pub symbolizer: Arc<dyn Symbolizer>,
}

impl Tables {
    /// Use one object for every table, as both backends do.
    pub fn from_shared<T>(tables: Arc<T>) -> Self
    where
        T: AllocationTable
            + StackTable
            + CombinedAllocTable
            + KernelCacheTable
            + SyscallTable
            + Symbolizer
            + 'static,
    {
        Self {
            allocs: tables.clone(),
            stacks: tables.clone(),
            combined: tables.clone(),
            kernel_caches: tables.clone(),
            syscalls: tables.clone(),
            symbolizer: tables,
        }
    }
}
