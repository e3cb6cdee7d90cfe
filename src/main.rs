use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use leakwatch::agent::Agent;
use leakwatch::config::{CliOverrides, Config};
use leakwatch::tracer::Tables;

/// Trace outstanding memory allocations and report leaking call stacks.
#[derive(Parser)]
#[command(name = "leakwatch", about, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Seconds between reports.
    interval: Option<u64>,

    /// Process id to trace; -1 traces kernel allocations.
    #[arg(short, long, allow_hyphen_values = true)]
    pid: Option<i32>,

    /// Only report allocations older than this many milliseconds.
    #[arg(short = 'o', long = "older")]
    older: Option<u64>,

    /// Sample every Nth allocation.
    #[arg(short = 's', long = "sample-rate")]
    sample_rate: Option<u32>,

    /// Number of entries to show per section.
    #[arg(short = 'T', long)]
    top: Option<usize>,

    /// Capture only allocations of at least this many bytes.
    #[arg(short = 'z', long = "min-size")]
    min_size: Option<u64>,

    /// Capture only allocations of at most this many bytes.
    #[arg(short = 'Z', long = "max-size")]
    max_size: Option<u64>,

    /// Object (library or executable) whose allocator gets traced.
    #[arg(short = 'O', long = "obj")]
    obj: Option<String>,

    /// Write JSON snapshots instead of printing reports.
    #[arg(short = 'S', long)]
    snapshot: bool,

    /// Directory for snapshot files.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            log_level: self.log_level.clone(),
            interval: self.interval.map(Duration::from_secs),
            pid: self.pid,
            min_age: self.older.map(Duration::from_millis),
            every_nth: self.sample_rate,
            top: self.top,
            min_size: self.min_size,
            max_size: self.max_size,
            object: self.obj.clone(),
            snapshot: self.snapshot,
            snapshot_dir: self.snapshot_dir.clone(),
        }
    }
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("leakwatch {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply_overrides(cli.overrides());

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting leakwatch",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Set up signal handling.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            cancel.cancel();
        });
    }

    let (tables, probes) = open_tables(&cfg)?;

    let agent = Agent::new(cfg, tables)?;
    if let Some(health) = agent.health() {
        for (kind, attached, failed) in probes {
            health.set_probe_counts(kind, attached, failed);
        }
    }
    agent.start().await?;

    tracing::info!("Ctrl+C to quit");

    let passes = agent.run(cancel).await;

    agent.stop();

    tracing::info!(passes, "leakwatch stopped");

    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("received SIGINT, shutting down");
                }
                return;
            }
        };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}

/// Attached and failed probe counts per probe type.
type ProbeCounts = Vec<(&'static str, u32, u32)>;

#[cfg(feature = "bpf")]
fn open_tables(cfg: &Config) -> Result<(Tables, ProbeCounts)> {
    use std::sync::Arc;

    use leakwatch::tracer::bpf::BpfTables;

    let tables = BpfTables::load(cfg).context("loading BPF instrumentation")?;

    tracing::info!(
        pid = cfg.target.pid,
        object = %cfg.target.object,
        "attached to allocator",
    );

    let probes = tables.attachment_stats().by_type().to_vec();

    Ok((Tables::from_shared(Arc::new(tables)), probes))
}

#[cfg(not(feature = "bpf"))]
fn open_tables(_cfg: &Config) -> Result<(Tables, ProbeCounts)> {
    anyhow::bail!("leakwatch was built without the `bpf` feature; rebuild with --features bpf")
}
