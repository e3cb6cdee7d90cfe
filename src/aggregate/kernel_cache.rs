//! Slab caches holding more than they released.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tracer::KernelCacheTable;

use super::topk;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelCacheEntry {
    pub name: String,
    pub alloc_count: u64,
    pub free_count: u64,
    pub alloc_size: u64,
    pub free_size: u64,
}

impl KernelCacheEntry {
    pub fn net_size(&self) -> i64 {
        self.alloc_size.wrapping_sub(self.free_size) as i64
    }

    pub fn net_count(&self) -> i64 {
        self.alloc_count.wrapping_sub(self.free_count) as i64
    }
}

pub struct KernelCacheAggregator {
    caches: Arc<dyn KernelCacheTable>,
    top: usize,
}

impl KernelCacheAggregator {
    pub fn new(caches: Arc<dyn KernelCacheTable>, top: usize) -> Self {
        Self { caches, top }
    }

    /// Caches with positive net size, the `top` largest in ascending order.
    /// `None` when no cache is leaking.
    pub fn collect(&self) -> Option<Vec<KernelCacheEntry>> {
        let leaking: Vec<KernelCacheEntry> = self
            .caches
            .cache_counters()
            .into_iter()
            .filter(|c| c.is_leaking())
            .map(|c| KernelCacheEntry {
                name: c.name,
                alloc_count: c.alloc_count,
                free_count: c.free_count,
                alloc_size: c.alloc_size,
                free_size: c.free_size,
            })
            .collect();

        let top = topk::select(leaking, KernelCacheEntry::net_size, self.top);
        (!top.is_empty()).then_some(top)
    }
}
