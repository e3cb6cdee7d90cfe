//! Stack id to human-readable frames.

use std::sync::Arc;

use crate::tracer::event::Symbol;
use crate::tracer::{StackTable, Symbolizer};

/// Placeholder symbol for an address the symbolizer could not resolve.
pub const UNKNOWN_SYMBOL: &str = "[unknown]";

/// Resolves stack ids of one target process into symbol strings.
#[derive(Clone)]
pub struct StackResolver {
    stacks: Arc<dyn StackTable>,
    symbolizer: Arc<dyn Symbolizer>,
    pid: i32,
}

impl StackResolver {
    /// `pid <= 0` resolves against the kernel.
    pub fn new(stacks: Arc<dyn StackTable>, symbolizer: Arc<dyn Symbolizer>, pid: i32) -> Self {
        Self {
            stacks,
            symbolizer,
            pid,
        }
    }

    /// Resolve a stack into `module+0xoffset\tfunction` frames, innermost
    /// first. Unresolvable addresses render as `0x%016x`. An evicted or
    /// never-captured stack yields an empty vector.
    pub fn resolve(&self, stack_id: i64) -> Vec<String> {
        let Some(addresses) = self.stacks.addresses(stack_id) else {
            return Vec::new();
        };

        addresses
            .into_iter()
            .map(|addr| match self.symbolizer.symbolize(self.pid, addr) {
                Some(sym) => format_symbol(&sym),
                None => format!("0x{addr:016x}"),
            })
            .collect()
    }

    /// Like [`resolve`](Self::resolve) but every frame is prefixed with the
    /// raw address: `0x%016x\t<symbol>`.
    pub fn resolve_with_addresses(&self, stack_id: i64) -> Vec<String> {
        let Some(addresses) = self.stacks.addresses(stack_id) else {
            return Vec::new();
        };

        addresses
            .into_iter()
            .map(|addr| {
                let sym = self
                    .symbolizer
                    .symbolize(self.pid, addr)
                    .map(|s| format_symbol(&s))
                    .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string());
                format!("0x{addr:016x}\t{sym}")
            })
            .collect()
    }

    /// Number of stacks currently held by the stack table.
    pub fn trace_count(&self) -> usize {
        self.stacks.stack_count()
    }
}

/// Render a symbol, dropping the module and offset parts that are unknown.
pub fn format_symbol(sym: &Symbol) -> String {
    match (&sym.module, sym.offset) {
        (Some(module), Some(offset)) => format!("{module}+0x{offset:x}\t{}", sym.function),
        (Some(module), None) => format!("{module}\t{}", sym.function),
        (None, _) => sym.function.clone(),
    }
}
