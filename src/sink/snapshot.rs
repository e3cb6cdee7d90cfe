//! Per-interval snapshot record and its JSON persistence.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::combined::CombinedStats;
use crate::aggregate::kernel_cache::KernelCacheEntry;
use crate::aggregate::outstanding::StackAggregate;
use crate::aggregate::syscall::SyscallEntry;

/// Everything one aggregation pass produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Wall-clock milliseconds since the Unix epoch.
    pub time_ms: u64,
    pub stats: CombinedStats,
    pub outstanding: Vec<StackAggregate>,
    /// `null` when no cache is leaking.
    pub kernel_caches: Option<Vec<KernelCacheEntry>>,
    pub syscalls: Vec<SyscallEntry>,
}

impl Snapshot {
    pub fn compose(
        time_ms: u64,
        stats: CombinedStats,
        outstanding: Vec<StackAggregate>,
        kernel_caches: Option<Vec<KernelCacheEntry>>,
        syscalls: Vec<SyscallEntry>,
    ) -> Self {
        Self {
            time_ms,
            stats,
            outstanding,
            kernel_caches,
            syscalls,
        }
    }

    /// Load a snapshot previously written by [`SnapshotWriter`].
    pub fn read(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing snapshot {}", path.display()))
    }

    /// File name this snapshot is stored under.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.time_ms)
    }
}

/// Writes snapshots as `<time_ms>.json` into one directory.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the snapshot directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating snapshot directory {}", self.dir.display()))
    }

    /// Persist one snapshot. A file with the same timestamp is replaced.
    pub fn write(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        self.ensure_dir()?;

        let path = self.dir.join(snapshot.file_name());
        let file = fs::File::create(&path)
            .with_context(|| format!("creating snapshot file {}", path.display()))?;

        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, snapshot)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        w.flush()
            .with_context(|| format!("flushing snapshot {}", path.display()))?;

        tracing::debug!(path = %path.display(), "snapshot written");

        Ok(path)
    }
}
