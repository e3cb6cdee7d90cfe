//! eBPF instrumentation binding.
//!
//! Loads a prebuilt instrumentation object with aya, forwards the filter
//! globals, attaches the allocator/slab/syscall probes and exposes the maps
//! through the table traits. All code is gated behind
//! `#[cfg(feature = "bpf")]`.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::path::Path;

use anyhow::{Context, Result};
use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::{Map, MapData, StackTraceMap};
use aya::programs::{KProbe, TracePoint, UProbe};
use aya::util::kernel_symbols;
use aya::{Btf, Ebpf, EbpfLoader};
use blazesym::symbolize::{Input, Process, Source, Symbolizer as BlazeSymbolizer};
use blazesym::Pid;
use parking_lot::Mutex;

use crate::clock::monotonic_ns;
use crate::config::Config;

use super::event::{
    AllocationRecord, CombinedStackCounter, KernelCacheCounter, Symbol, SyscallCounter,
};
use super::parse::{
    parse_alloc_info, parse_combined_alloc, parse_kernel_cache, parse_syscall, ALLOC_INFO_SIZE,
    CACHE_NAME_LEN, COMBINED_ALLOC_INFO_SIZE, KERNEL_CACHE_INFO_SIZE, SYSCALL_INFO_SIZE,
};
use super::{
    AllocationTable, CombinedAllocTable, KernelCacheTable, StackTable, SyscallTable, Symbolizer,
    TableError,
};

/// Allocator entry points that get an entry uprobe and a return uretprobe.
const ALLOC_FUNCTIONS: &[&str] = &[
    "malloc",
    "calloc",
    "realloc",
    "mmap",
    "posix_memalign",
    "valloc",
    "memalign",
    "pvalloc",
    "aligned_alloc",
];

/// Release entry points, entry uprobe only.
const FREE_FUNCTIONS: &[&str] = &["free", "munmap"];

/// Slab allocation functions; which ones exist depends on the kernel.
const CACHE_ALLOC_FUNCTIONS: &[&str] = &[
    "kmem_cache_alloc_lru",
    "kmem_cache_alloc_bulk",
    "kmem_cache_alloc_node",
];

const CACHE_FREE_FUNCTIONS: &[&str] = &["kmem_cache_free", "kmem_cache_free_bulk"];

#[cfg(target_pointer_width = "64")]
const KERNEL_ADDR_START: u64 = 0xFFFF_8000_0000_0000;
#[cfg(not(target_pointer_width = "64"))]
const KERNEL_ADDR_START: u64 = 0xC000_0000;

type AllocMap = BpfHashMap<MapData, u64, [u8; ALLOC_INFO_SIZE]>;
type CombinedMap = BpfHashMap<MapData, u64, [u8; COMBINED_ALLOC_INFO_SIZE]>;
type CacheMap = BpfHashMap<MapData, [u8; CACHE_NAME_LEN], [u8; KERNEL_CACHE_INFO_SIZE]>;
type SyscallMap = BpfHashMap<MapData, u32, [u8; SYSCALL_INFO_SIZE]>;

/// Probe attachment counts, logged once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentStats {
    pub uprobes_attached: u32,
    pub uprobes_failed: u32,
    pub kprobes_attached: u32,
    pub kprobes_failed: u32,
    pub tracepoints_attached: u32,
    pub tracepoints_failed: u32,
}

impl AttachmentStats {
    /// `(type, attached, failed)` per probe type.
    pub fn by_type(&self) -> [(&'static str, u32, u32); 3] {
        [
            ("uprobe", self.uprobes_attached, self.uprobes_failed),
            ("kprobe", self.kprobes_attached, self.kprobes_failed),
            ("tracepoint", self.tracepoints_attached, self.tracepoints_failed),
        ]
    }
}

/// Tables backed by the live instrumentation maps.
pub struct BpfTables {
    // Keeps the programs loaded and attached for as long as the tables live.
    _ebpf: Mutex<Ebpf>,
    allocs: Mutex<AllocMap>,
    stacks: Mutex<StackTraceMap<MapData>>,
    combined: Mutex<CombinedMap>,
    caches: Mutex<CacheMap>,
    syscalls: Mutex<SyscallMap>,
    symbolizer: Mutex<BlazeSymbolizer>,
    ksyms: BTreeMap<u64, String>,
    attach_stats: AttachmentStats,
}

impl BpfTables {
    /// Load the instrumentation object, attach every probe and take the maps.
    pub fn load(cfg: &Config) -> Result<Self> {
        bump_memlock_rlimit();

        let pid: i32 = cfg.target.pid;
        let sample_every_n: u32 = cfg.sampling.every_nth;
        let min_size: u64 = cfg.size_filter.min.unwrap_or(0);
        let max_size: u64 = cfg.size_filter.max.unwrap_or(u64::MAX);
        let page_size: u64 = page_size();
        let user_stacks: u8 = u8::from(!cfg.bpf.kernel_stacks);

        let path = &cfg.bpf.object_path;
        let mut ebpf = EbpfLoader::new()
            .btf(Btf::from_sys_fs().ok().as_ref())
            .set_global("PROCESS_ID", &pid, true)
            .set_global("SAMPLE_EVERY_N", &sample_every_n, true)
            .set_global("PAGE_SIZE", &page_size, false)
            .set_global("MIN_SIZE", &min_size, false)
            .set_global("MAX_SIZE", &max_size, false)
            .set_global("USER_STACKS", &user_stacks, false)
            .load_file(path)
            .with_context(|| format!("loading BPF object {}", path.display()))?;

        let attach_stats = attach_programs(&mut ebpf, &cfg.target.object, pid)?;
        log_attachment_stats(&attach_stats);

        let allocs: AllocMap =
            BpfHashMap::try_from(take_map(&mut ebpf, "allocs")?).context("allocs map")?;
        let stacks = StackTraceMap::try_from(take_map(&mut ebpf, "stack_traces")?)
            .context("stack_traces map")?;
        let combined: CombinedMap = BpfHashMap::try_from(take_map(&mut ebpf, "combined_allocs")?)
            .context("combined_allocs map")?;
        let caches: CacheMap = BpfHashMap::try_from(take_map(&mut ebpf, "kernel_cache_counts")?)
            .context("kernel_cache_counts map")?;
        let syscalls: SyscallMap = BpfHashMap::try_from(take_map(&mut ebpf, "syscall_counts")?)
            .context("syscall_counts map")?;

        let ksyms = kernel_symbols().context("loading kernel symbols")?;

        tracing::info!(
            object = %path.display(),
            pid,
            kernel_symbols = ksyms.len(),
            "BPF instrumentation loaded",
        );

        Ok(Self {
            _ebpf: Mutex::new(ebpf),
            allocs: Mutex::new(allocs),
            stacks: Mutex::new(stacks),
            combined: Mutex::new(combined),
            caches: Mutex::new(caches),
            syscalls: Mutex::new(syscalls),
            symbolizer: Mutex::new(BlazeSymbolizer::new()),
            ksyms,
            attach_stats,
        })
    }

    /// Return a copy of the attachment statistics.
    pub fn attachment_stats(&self) -> AttachmentStats {
        self.attach_stats
    }
}

impl AllocationTable for BpfTables {
    fn monotonic_now_ns(&self) -> u64 {
        // bpf_ktime_get_ns() reads CLOCK_MONOTONIC.
        monotonic_ns()
    }

    fn allocations(&self) -> Vec<AllocationRecord> {
        let map = self.allocs.lock();
        map.iter()
            .filter_map(|item| match item {
                Ok((address, raw)) => match parse_alloc_info(address, &raw) {
                    Ok(rec) => Some(rec),
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping undecodable allocs entry");
                        None
                    }
                },
                // Entry freed between key lookup and value read.
                Err(e) => {
                    tracing::trace!(error = %e, "allocs entry vanished during iteration");
                    None
                }
            })
            .collect()
    }
}

impl StackTable for BpfTables {
    fn addresses(&self, stack_id: i64) -> Option<Vec<u64>> {
        let id = u32::try_from(stack_id).ok()?;
        let map = self.stacks.lock();
        match map.get(&id, 0) {
            Ok(trace) => Some(trace.frames().iter().map(|f| f.ip).collect()),
            Err(e) => {
                tracing::trace!(stack_id, error = %e, "stack trace not found");
                None
            }
        }
    }

    fn stack_count(&self) -> usize {
        self.stacks.lock().stack_ids().filter(|id| id.is_ok()).count()
    }
}

impl CombinedAllocTable for BpfTables {
    fn combined_counters(&self) -> Vec<CombinedStackCounter> {
        let map = self.combined.lock();
        map.iter()
            .filter_map(|item| {
                let (stack_id, raw) = item.ok()?;
                parse_combined_alloc(stack_id as i64, &raw)
                    .map_err(|e| tracing::debug!(error = %e, "skipping combined_allocs entry"))
                    .ok()
            })
            .collect()
    }
}

impl KernelCacheTable for BpfTables {
    fn cache_counters(&self) -> Vec<KernelCacheCounter> {
        let map = self.caches.lock();
        map.iter()
            .filter_map(|item| {
                let (name, raw) = item.ok()?;
                parse_kernel_cache(&name, &raw)
                    .map_err(|e| tracing::debug!(error = %e, "skipping kernel_cache_counts entry"))
                    .ok()
            })
            .collect()
    }
}

impl SyscallTable for BpfTables {
    fn syscall_counters(&self) -> Vec<SyscallCounter> {
        let map = self.syscalls.lock();
        map.iter()
            .filter_map(|item| {
                let (id, raw) = item.ok()?;
                parse_syscall(id, &raw)
                    .map_err(|e| tracing::debug!(error = %e, "skipping syscall_counts entry"))
                    .ok()
            })
            .collect()
    }

    fn clear(&self) -> Result<(), TableError> {
        let mut map = self.syscalls.lock();

        // Phase 1: collect keys.
        let keys: Vec<u32> = map.keys().filter_map(|k| k.ok()).collect();

        // Phase 2: delete. A key removed concurrently is not an error.
        let mut failed = 0usize;
        for key in &keys {
            if map.remove(key).is_err() {
                failed += 1;
            }
        }

        TableError::check_clear("syscall_counts", failed, keys.len())
    }
}

impl Symbolizer for BpfTables {
    fn symbolize(&self, pid: i32, address: u64) -> Option<Symbol> {
        if pid <= 0 || address >= KERNEL_ADDR_START {
            return ksymbols_search(&self.ksyms, address);
        }

        let pid = NonZeroU32::new(pid as u32)?;
        let src = Source::Process(Process::new(Pid::Pid(pid)));
        let symbolizer = self.symbolizer.lock();
        let syms = match symbolizer.symbolize(&src, Input::AbsAddr(&[address])) {
            Ok(syms) => syms,
            Err(e) => {
                tracing::debug!(address, error = %e, "symbolization failed");
                return None;
            }
        };

        let sym = syms.first()?.as_sym()?;
        let module = sym
            .module
            .as_deref()
            .and_then(|m| Path::new(m).file_name())
            .map(|n| n.to_string_lossy().into_owned());

        Some(Symbol {
            function: sym.name.to_string(),
            module,
            offset: Some(sym.offset as u64),
        })
    }
}

fn ksymbols_search(ksyms: &BTreeMap<u64, String>, ip: u64) -> Option<Symbol> {
    let (sym_addr, name) = ksyms.range(..=ip).next_back()?;
    Some(
        Symbol::new(name.clone())
            .with_module("kernel")
            .with_offset(ip - sym_addr),
    )
}

fn take_map(ebpf: &mut Ebpf, name: &'static str) -> Result<Map> {
    ebpf.take_map(name)
        .ok_or_else(|| anyhow::anyhow!("{name} map not found"))
}

// ---------------------------------------------------------------------------
// Probe attachment
// ---------------------------------------------------------------------------

/// Library names are given the way the linker takes them (`c` for libc).
fn uprobe_target(object: &str) -> String {
    if object.contains('/') || object.starts_with("lib") {
        object.to_string()
    } else {
        format!("lib{object}")
    }
}

fn attach_programs(ebpf: &mut Ebpf, object: &str, pid: i32) -> Result<AttachmentStats> {
    let mut stats = AttachmentStats::default();
    let target_pid = (pid > 0).then_some(pid);
    let target = uprobe_target(object);
    let object = target.as_str();

    for func in ALLOC_FUNCTIONS {
        attach_uprobe(ebpf, &format!("{func}_enter"), func, object, target_pid, &mut stats);
        attach_uprobe(ebpf, &format!("{func}_exit"), func, object, target_pid, &mut stats);
    }
    for func in FREE_FUNCTIONS {
        attach_uprobe(ebpf, &format!("{func}_enter"), func, object, target_pid, &mut stats);
    }

    if stats.uprobes_attached == 0 {
        anyhow::bail!("no allocator probes could be attached to {object}");
    }

    attach_kprobe_many(ebpf, "trace_cache_alloc", CACHE_ALLOC_FUNCTIONS, &mut stats);
    attach_kprobe_many(ebpf, "trace_cache_free", CACHE_FREE_FUNCTIONS, &mut stats);

    attach_tracepoint_optional(ebpf, "trace_sys_enter", "raw_syscalls", "sys_enter", &mut stats);
    attach_tracepoint_optional(ebpf, "trace_sys_exit", "raw_syscalls", "sys_exit", &mut stats);

    Ok(stats)
}

fn attach_uprobe(
    ebpf: &mut Ebpf,
    prog_name: &str,
    symbol: &str,
    object: &str,
    pid: Option<i32>,
    stats: &mut AttachmentStats,
) {
    let result: Result<()> = (|| {
        let prog: &mut UProbe = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
            .try_into()?;
        prog.load()?;
        prog.attach(Some(symbol), 0, object, pid)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            stats.uprobes_attached += 1;
            tracing::debug!(program = prog_name, symbol, object, "attached uprobe");
        }
        Err(e) => {
            stats.uprobes_failed += 1;
            tracing::warn!(program = prog_name, symbol, object, error = %e, "uprobe attach failed");
        }
    }
}

/// Load one kprobe program and attach it to every symbol that exists.
fn attach_kprobe_many(
    ebpf: &mut Ebpf,
    prog_name: &str,
    symbols: &[&str],
    stats: &mut AttachmentStats,
) {
    let prog: &mut KProbe = match ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))
        .and_then(|p| <&mut KProbe>::try_from(p).map_err(anyhow::Error::from))
    {
        Ok(prog) => prog,
        Err(e) => {
            stats.kprobes_failed += symbols.len() as u32;
            tracing::warn!(program = prog_name, error = %e, "kprobe program unavailable");
            return;
        }
    };

    if let Err(e) = prog.load() {
        stats.kprobes_failed += symbols.len() as u32;
        tracing::warn!(program = prog_name, error = %e, "kprobe load failed");
        return;
    }

    for symbol in symbols {
        match prog.attach(*symbol, 0) {
            Ok(_) => {
                stats.kprobes_attached += 1;
                tracing::debug!(program = prog_name, symbol, "attached kprobe");
            }
            Err(e) => {
                stats.kprobes_failed += 1;
                tracing::warn!(symbol, error = %e, "optional kprobe attach failed");
            }
        }
    }
}

fn attach_tracepoint_optional(
    ebpf: &mut Ebpf,
    prog_name: &str,
    group: &str,
    name: &str,
    stats: &mut AttachmentStats,
) {
    let result: Result<()> = (|| {
        let prog: &mut TracePoint = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
            .try_into()?;
        prog.load()?;
        prog.attach(group, name)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            stats.tracepoints_attached += 1;
            tracing::debug!(group, name, "attached optional tracepoint");
        }
        Err(e) => {
            stats.tracepoints_failed += 1;
            tracing::warn!(group, name, error = %e, "optional tracepoint attach failed");
        }
    }
}

fn log_attachment_stats(stats: &AttachmentStats) {
    tracing::info!(
        uprobes_attached = stats.uprobes_attached,
        uprobes_failed = stats.uprobes_failed,
        kprobes_attached = stats.kprobes_attached,
        kprobes_failed = stats.kprobes_failed,
        tracepoints_attached = stats.tracepoints_attached,
        tracepoints_failed = stats.tracepoints_failed,
        "BPF program attachment complete",
    );
}

/// Remove the locked-memory limit for kernels without memcg accounting.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: setrlimit only reads the provided struct.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::debug!(ret, "removing limit on locked memory failed");
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}
