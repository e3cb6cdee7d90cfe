//! Plain-text rendering of a snapshot.

use std::fmt::Write as _;

use crate::aggregate::combined::CombinedStats;
use crate::aggregate::kernel_cache::KernelCacheEntry;
use crate::aggregate::outstanding::StackAggregate;
use crate::aggregate::syscall::SyscallEntry;
use crate::config::MemoryUnit;

use super::snapshot::Snapshot;

const FRAME_SEPARATOR: &str = "\n\t\t";

/// Render one report. `clock` is the local wall time shown in the header.
pub fn render(snapshot: &Snapshot, unit: MemoryUnit, top: usize, clock: &str) -> String {
    let mut out = String::with_capacity(4096);

    let _ = writeln!(out, "[{clock}]");
    render_statistics(&mut out, &snapshot.stats, unit, top);
    render_outstanding(&mut out, &snapshot.outstanding, top);
    if let Some(caches) = &snapshot.kernel_caches {
        render_kernel_caches(&mut out, caches);
    }
    render_syscalls(&mut out, &snapshot.syscalls);
    out.push('\n');

    out
}

fn render_statistics(out: &mut String, stats: &CombinedStats, unit: MemoryUnit, top: usize) {
    let _ = writeln!(out, "stack traces {}", stats.stack_traces);
    let _ = writeln!(
        out,
        "overall, allocated {} {} in {} allocations",
        unit.convert(stats.memory),
        unit.label(),
        stats.allocations,
    );
    let _ = writeln!(out, "Top {top} stacks with outstanding allocations:");
    for entry in &stats.stacks {
        let _ = writeln!(
            out,
            "\t{} bytes in {} allocations from stack ({} allocs/frees)\n\t\t{}",
            entry.net_size(),
            entry.net_count(),
            entry.events(),
            entry.trace.join(FRAME_SEPARATOR),
        );
    }
}

fn render_outstanding(out: &mut String, outstanding: &[StackAggregate], top: usize) {
    let _ = writeln!(out, "Top {top} stacks with outstanding allocations:");
    for agg in outstanding {
        let _ = writeln!(
            out,
            "\t{} bytes in {} allocations from stack\n\t\t{}",
            agg.total_size,
            agg.count,
            agg.frames.join(FRAME_SEPARATOR),
        );
    }
}

fn render_kernel_caches(out: &mut String, caches: &[KernelCacheEntry]) {
    out.push_str("---------------- Kernel Caches ---------------\n");
    for c in caches {
        let _ = writeln!(out, "Cache {} {} {}", c.name, c.net_count(), c.net_size());
    }
}

fn render_syscalls(out: &mut String, syscalls: &[SyscallEntry]) {
    out.push_str("SYSCALL                   COUNT             TIME\n");
    for s in syscalls {
        let _ = writeln!(out, "{:<22} {:>8} {:>16.3}", s.name, s.count, s.total_us());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::combined::CombinedStackEntry;

    fn snapshot(kernel_caches: Option<Vec<KernelCacheEntry>>) -> Snapshot {
        Snapshot::compose(
            0,
            CombinedStats {
                memory: 2048,
                allocations: 2,
                stack_traces: 5,
                stacks: vec![CombinedStackEntry {
                    stack_id: 1,
                    alloc_size: 5000,
                    free_size: 4000,
                    number_of_allocs: 7,
                    number_of_frees: 3,
                    trace: vec!["libc.so.6+0x10\tmalloc".to_string(), "app\tmain".to_string()],
                }],
            },
            vec![StackAggregate {
                stack_id: 1,
                frames: vec!["0x0000000000001000\tmain".to_string()],
                total_size: 600,
                count: 3,
            }],
            kernel_caches,
            vec![SyscallEntry {
                name: "mmap".to_string(),
                syscall_id: 9,
                count: 12,
                total_ns: 1_234_567,
            }],
        )
    }

    #[test]
    fn test_render_full_report() {
        let caches = vec![KernelCacheEntry {
            name: "kmalloc-64".to_string(),
            alloc_count: 10,
            free_count: 4,
            alloc_size: 640,
            free_size: 256,
        }];
        let text = render(&snapshot(Some(caches)), MemoryUnit::Kb, 10, "12:34:56");

        let expected = "\
[12:34:56]
stack traces 5
overall, allocated 2 kb in 2 allocations
Top 10 stacks with outstanding allocations:
\t1000 bytes in 4 allocations from stack (10 allocs/frees)
\t\tlibc.so.6+0x10\tmalloc
\t\tapp\tmain
Top 10 stacks with outstanding allocations:
\t600 bytes in 3 allocations from stack
\t\t0x0000000000001000\tmain
---------------- Kernel Caches ---------------
Cache kmalloc-64 6 384
SYSCALL                   COUNT             TIME
mmap                         12         1234.567

";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_kernel_cache_section_omitted_when_empty() {
        let text = render(&snapshot(None), MemoryUnit::Bytes, 10, "00:00:00");
        assert!(!text.contains("Kernel Caches"));
        assert!(text.contains("overall, allocated 2048 bytes in 2 allocations"));
    }

    #[test]
    fn test_report_ends_with_blank_line() {
        let text = render(&snapshot(None), MemoryUnit::Mb, 1, "00:00:00");
        assert!(text.ends_with("\n\n"));
    }
}
