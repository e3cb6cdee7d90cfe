//! Typed entries read out of the instrumentation tables.
//!
//! Every value here is a point-in-time copy. The instrumentation keeps
//! mutating the underlying tables while a pass runs, so two reads of the
//! same key may disagree; nothing downstream assumes otherwise.

/// Stack id recorded when the instrumentation failed to capture a stack.
pub const STACK_CAPTURE_FAILED: i64 = -1;

/// A single live allocation keyed by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub address: u64,
    pub size: u64,
    /// Monotonic timestamp taken when the allocation returned.
    pub timestamp_ns: u64,
    /// Negative when stack capture failed.
    pub stack_id: i64,
}

impl AllocationRecord {
    /// Returns true if the record carries a usable stack id.
    pub fn has_stack(&self) -> bool {
        self.stack_id >= 0
    }

    /// Returns true if the record is at least `min_age_ns` old at `now_ns`.
    ///
    /// The boundary (`timestamp_ns == now_ns - min_age_ns`) counts as old
    /// enough. A clock that has not yet run for `min_age_ns` admits nothing.
    pub fn is_older_than(&self, min_age_ns: u64, now_ns: u64) -> bool {
        match now_ns.checked_sub(min_age_ns) {
            Some(cutoff) => self.timestamp_ns <= cutoff,
            None => false,
        }
    }
}

/// Long-lived alloc/free totals for one call stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombinedStackCounter {
    pub stack_id: i64,
    pub alloc_size: u64,
    pub free_size: u64,
    pub number_of_allocs: u64,
    pub number_of_frees: u64,
}

impl CombinedStackCounter {
    /// Bytes allocated minus bytes freed. Negative when a torn read or an
    /// untracked allocation made frees outrun allocs.
    pub fn net_size(&self) -> i64 {
        self.alloc_size.wrapping_sub(self.free_size) as i64
    }

    /// Allocations minus frees.
    pub fn net_count(&self) -> i64 {
        self.number_of_allocs.wrapping_sub(self.number_of_frees) as i64
    }

    /// Allocs plus frees observed on this stack.
    pub fn events(&self) -> u64 {
        self.number_of_allocs.saturating_add(self.number_of_frees)
    }

    /// True if the stack currently holds more than it released.
    pub fn is_leaking(&self) -> bool {
        self.alloc_size > self.free_size
    }
}

/// Alloc/free totals for one kernel slab cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCacheCounter {
    pub name: String,
    pub alloc_count: u64,
    pub free_count: u64,
    pub alloc_size: u64,
    pub free_size: u64,
}

impl KernelCacheCounter {
    pub fn net_size(&self) -> i64 {
        self.alloc_size.wrapping_sub(self.free_size) as i64
    }

    pub fn net_count(&self) -> i64 {
        self.alloc_count.wrapping_sub(self.free_count) as i64
    }

    pub fn is_leaking(&self) -> bool {
        self.alloc_size > self.free_size
    }
}

/// Calls and cumulative time for one syscall within the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallCounter {
    pub syscall_id: u32,
    pub count: u64,
    pub total_ns: u64,
}

/// A resolved symbol for a single code address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub function: String,
    /// Object file or kernel module containing the address.
    pub module: Option<String>,
    /// Offset of the address from the start of `function`.
    pub offset: Option<u64>,
}

impl Symbol {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            module: None,
            offset: None,
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}
