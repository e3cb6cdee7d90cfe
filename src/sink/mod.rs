pub mod report;
pub mod snapshot;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::{Config, MemoryUnit, ReportMode};

use self::snapshot::{Snapshot, SnapshotWriter};

/// What a sink did with one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    /// Text report written to stdout.
    Printed,
    /// Snapshot persisted at the given path.
    Written(PathBuf),
}

/// Destination for each interval's snapshot, fixed at startup.
pub enum Sink {
    Report { unit: MemoryUnit, top: usize },
    Snapshot(SnapshotWriter),
}

impl Sink {
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.report.mode {
            ReportMode::Report => Self::Report {
                unit: cfg.report.memory_unit,
                top: cfg.top,
            },
            ReportMode::Snapshot => Self::Snapshot(SnapshotWriter::new(&cfg.report.snapshot_dir)),
        }
    }

    /// Returns the sink's name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Report { .. } => "report",
            Self::Snapshot(_) => "snapshot",
        }
    }

    /// Prepare the sink before the first interval.
    pub fn start(&self) -> Result<()> {
        match self {
            Self::Report { .. } => Ok(()),
            Self::Snapshot(writer) => {
                writer.ensure_dir()?;
                tracing::info!(dir = %writer.dir().display(), "writing snapshots");
                Ok(())
            }
        }
    }

    /// Deliver one snapshot.
    pub fn emit(&self, snapshot: &Snapshot) -> Result<Emitted> {
        match self {
            Self::Report { unit, top } => {
                let clock = chrono::Local::now().format("%H:%M:%S").to_string();
                let text = report::render(snapshot, *unit, *top, &clock);

                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(text.as_bytes())
                    .and_then(|()| stdout.flush())
                    .context("writing report to stdout")?;

                Ok(Emitted::Printed)
            }
            Self::Snapshot(writer) => writer.write(snapshot).map(Emitted::Written),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::combined::CombinedStats;

    fn empty_snapshot(time_ms: u64) -> Snapshot {
        Snapshot::compose(
            time_ms,
            CombinedStats {
                memory: 0,
                allocations: 0,
                stack_traces: 0,
                stacks: Vec::new(),
            },
            Vec::new(),
            None,
            Vec::new(),
        )
    }

    #[test]
    fn test_from_config_picks_mode() {
        let mut cfg = Config::default();
        assert_eq!(Sink::from_config(&cfg).name(), "report");

        cfg.report.mode = ReportMode::Snapshot;
        assert_eq!(Sink::from_config(&cfg).name(), "snapshot");
    }

    #[test]
    fn test_snapshot_sink_emits_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.report.mode = ReportMode::Snapshot;
        cfg.report.snapshot_dir = dir.path().join("out");

        let sink = Sink::from_config(&cfg);
        sink.start().unwrap();

        let emitted = sink.emit(&empty_snapshot(99)).unwrap();
        assert_eq!(emitted, Emitted::Written(dir.path().join("out/99.json")));
    }

    #[test]
    fn test_report_sink_prints() {
        let sink = Sink::from_config(&Config::default());
        assert_eq!(sink.emit(&empty_snapshot(1)).unwrap(), Emitted::Printed);
    }
}
