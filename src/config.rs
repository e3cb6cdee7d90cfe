use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the leakwatch agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Process and allocator to trace.
    #[serde(default)]
    pub target: TargetConfig,

    /// Time between reports. Default: 5s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Allocations younger than this are not reported as outstanding.
    /// Default: 500ms.
    #[serde(default = "default_min_age", with = "humantime_serde")]
    pub min_age: Duration,

    /// Number of entries shown per section. Default: 10.
    #[serde(default = "default_top")]
    pub top: usize,

    /// Allocation sampling applied in the instrumentation.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Allocation size window applied in the instrumentation.
    #[serde(default)]
    pub size_filter: SizeFilterConfig,

    /// Output mode configuration.
    #[serde(default)]
    pub report: ReportConfig,

    /// BPF object configuration.
    #[serde(default)]
    pub bpf: BpfConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Process and allocator to trace.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Process id to trace; -1 traces kernel allocations. Default: -1.
    #[serde(default = "default_pid")]
    pub pid: i32,

    /// Object whose allocator functions get probed. Default: "c".
    #[serde(default = "default_object")]
    pub object: String,
}

/// Sampling configuration forwarded to the instrumentation.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Record every Nth allocation. Default: 1 (all). Reported totals are
    /// not scaled back up.
    #[serde(default = "default_every_nth")]
    pub every_nth: u32,
}

/// Only allocations with `min <= size <= max` are recorded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SizeFilterConfig {
    #[serde(default)]
    pub min: Option<u64>,

    #[serde(default)]
    pub max: Option<u64>,
}

/// Where each interval's results go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportMode {
    /// Text report on stdout.
    #[default]
    Report,
    /// One JSON file per interval.
    Snapshot,
}

/// Unit for the overall outstanding memory line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryUnit {
    Bytes,
    #[default]
    Kb,
    Mb,
}

impl MemoryUnit {
    /// Convert a byte count into this unit.
    pub fn convert(self, bytes: i64) -> f64 {
        match self {
            Self::Bytes => bytes as f64,
            Self::Kb => bytes as f64 / 1024.0,
            Self::Mb => bytes as f64 / (1024.0 * 1024.0),
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Bytes => "bytes",
            Self::Kb => "kb",
            Self::Mb => "mb",
        }
    }
}

/// Output mode configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Output mode. Default: report.
    #[serde(default)]
    pub mode: ReportMode,

    /// Directory for snapshot files. Default: "snapshots".
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Unit for the overall memory summary. Default: kb.
    #[serde(default)]
    pub memory_unit: MemoryUnit,
}

/// BPF object configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BpfConfig {
    /// Path to the compiled instrumentation object.
    #[serde(default = "default_object_path")]
    pub object_path: PathBuf,

    /// Capture kernel stacks instead of user stacks.
    #[serde(default)]
    pub kernel_stacks: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_level: Option<String>,
    pub interval: Option<Duration>,
    pub pid: Option<i32>,
    pub min_age: Option<Duration>,
    pub every_nth: Option<u32>,
    pub top: Option<usize>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub object: Option<String>,
    pub snapshot: bool,
    pub snapshot_dir: Option<PathBuf>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_min_age() -> Duration {
    Duration::from_millis(500)
}

fn default_top() -> usize {
    10
}

fn default_pid() -> i32 {
    -1
}

fn default_object() -> String {
    "c".to_string()
}

fn default_every_nth() -> u32 {
    1
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_object_path() -> PathBuf {
    PathBuf::from("leakwatch.bpf.o")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            target: TargetConfig::default(),
            interval: default_interval(),
            min_age: default_min_age(),
            top: default_top(),
            sampling: SamplingConfig::default(),
            size_filter: SizeFilterConfig::default(),
            report: ReportConfig::default(),
            bpf: BpfConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            pid: default_pid(),
            object: default_object(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            every_nth: default_every_nth(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            mode: ReportMode::default(),
            snapshot_dir: default_snapshot_dir(),
            memory_unit: MemoryUnit::default(),
        }
    }
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            object_path: default_object_path(),
            kernel_stacks: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Overlay command-line values onto the loaded configuration.
    pub fn apply_overrides(&mut self, o: CliOverrides) {
        if let Some(level) = o.log_level {
            self.log_level = level;
        }
        if let Some(interval) = o.interval {
            self.interval = interval;
        }
        if let Some(pid) = o.pid {
            self.target.pid = pid;
        }
        if let Some(min_age) = o.min_age {
            self.min_age = min_age;
        }
        if let Some(n) = o.every_nth {
            self.sampling.every_nth = n;
        }
        if let Some(top) = o.top {
            self.top = top;
        }
        if let Some(min) = o.min_size {
            self.size_filter.min = Some(min);
        }
        if let Some(max) = o.max_size {
            self.size_filter.max = Some(max);
        }
        if let Some(object) = o.object {
            self.target.object = object;
        }
        if o.snapshot {
            self.report.mode = ReportMode::Snapshot;
        }
        if let Some(dir) = o.snapshot_dir {
            self.report.snapshot_dir = dir;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.top == 0 {
            bail!("top must be positive");
        }

        if self.sampling.every_nth == 0 {
            bail!("sampling.every_nth must be at least 1");
        }

        if let (Some(min), Some(max)) = (self.size_filter.min, self.size_filter.max) {
            if min > max {
                bail!("size_filter.min ({min}) can't be greater than size_filter.max ({max})");
            }
        }

        if self.target.object.is_empty() {
            bail!("target.object is required");
        }

        if self.report.mode == ReportMode::Snapshot
            && self.report.snapshot_dir.as_os_str().is_empty()
        {
            bail!("report.snapshot_dir is required in snapshot mode");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }

    /// Minimum allocation age in nanoseconds.
    pub fn min_age_ns(&self) -> u64 {
        crate::clock::duration_ns(self.min_age)
    }
}
