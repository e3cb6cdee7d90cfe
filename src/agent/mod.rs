use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregate::Collector;
use crate::clock::wall_clock_ms;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::{Emitted, Sink};
use crate::tracer::stats::ScanStats;
use crate::tracer::Tables;

/// Agent drives the reporting loop: aggregate on every tick, hand the
/// snapshot to the sink, repeat until cancelled.
pub struct Agent {
    cfg: Config,
    collector: Collector,
    sink: Sink,
    health: Option<Arc<HealthMetrics>>,
    scan_stats: Arc<ScanStats>,
}

impl Agent {
    /// Creates a new Agent over the given tables.
    pub fn new(cfg: Config, tables: Tables) -> Result<Self> {
        let health = if cfg.health.enabled {
            Some(Arc::new(
                HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
            ))
        } else {
            None
        };

        Ok(Self {
            collector: Collector::new(&tables, &cfg),
            sink: Sink::from_config(&cfg),
            health,
            scan_stats: Arc::new(ScanStats::new()),
            cfg,
        })
    }

    pub fn health(&self) -> Option<&HealthMetrics> {
        self.health.as_deref()
    }

    /// Prepare the sink and start the health server if enabled.
    pub async fn start(&self) -> Result<()> {
        if let Some(health) = &self.health {
            health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        self.sink.start().context("starting sink")?;

        info!(
            sink = self.sink.name(),
            pid = self.cfg.target.pid,
            interval = ?self.cfg.interval,
            min_age = ?self.cfg.min_age,
            top = self.cfg.top,
            "agent started",
        );

        Ok(())
    }

    /// Run one aggregation pass and deliver it to the sink.
    ///
    /// Sink failures are logged and counted; the next tick tries again.
    pub fn tick(&self) -> Option<Emitted> {
        let started = Instant::now();

        let snapshot = self.collector.collect(wall_clock_ms(), &self.scan_stats);
        let scan = self.scan_stats.snapshot();

        let emitted = match self.sink.emit(&snapshot) {
            Ok(emitted) => Some(emitted),
            Err(e) => {
                error!(sink = self.sink.name(), error = %e, "sink delivery failed");
                if let Some(h) = &self.health {
                    h.sink_errors.inc();
                }
                None
            }
        };

        let elapsed = started.elapsed();

        debug!(
            scan = ?scan,
            outstanding_bytes = snapshot.stats.memory,
            elapsed_ms = elapsed.as_millis() as u64,
            "pass complete",
        );

        if let Some(h) = &self.health {
            h.passes.inc();
            h.pass_duration.observe(elapsed.as_secs_f64());
            h.outstanding_bytes.set(snapshot.stats.memory as f64);
            h.observe_scan(&scan);
            if matches!(emitted, Some(Emitted::Written(_))) {
                h.snapshots_written.inc();
            }
        }

        emitted
    }

    /// Tick on the configured interval until `cancel` fires. Returns the
    /// number of completed passes.
    ///
    /// The first pass runs one full interval after the call. A pass that has
    /// started always completes; cancellation is only observed between
    /// passes.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let period = self.cfg.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut passes = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(passes, "reporting loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                    passes += 1;
                }
            }
        }

        passes
    }

    /// Stop the health server.
    pub fn stop(&self) {
        if let Some(health) = &self.health {
            health.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ReportMode;
    use crate::sink::snapshot::Snapshot;
    use crate::tracer::memory::MemoryTables;

    fn snapshot_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.report.mode = ReportMode::Snapshot;
        cfg.report.snapshot_dir = dir.to_path_buf();
        cfg.min_age = Duration::ZERO;
        cfg
    }

    #[test]
    fn test_tick_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let t = Arc::new(MemoryTables::new());
        t.insert_stack(1, vec![0x10]);
        t.record_alloc_at(0xa, 128, 1, 0);
        t.set_now_ns(1_000);

        let agent = Agent::new(snapshot_config(dir.path()), Tables::from_shared(t)).unwrap();

        let Some(Emitted::Written(path)) = agent.tick() else {
            panic!("expected a written snapshot");
        };
        let snap = Snapshot::read(&path).unwrap();
        assert_eq!(snap.outstanding.len(), 1);
        assert_eq!(snap.outstanding[0].total_size, 128);
        assert_eq!(snap.stats.memory, 128);
    }

    #[test]
    fn test_tick_updates_health() {
        let dir = tempfile::tempdir().unwrap();
        let t = Arc::new(MemoryTables::new());
        t.record_alloc_at(0xa, 64, -1, 0);
        t.set_now_ns(1_000);

        let mut cfg = snapshot_config(dir.path());
        cfg.health.enabled = true;
        cfg.health.addr = "127.0.0.1:0".to_string();

        let agent = Agent::new(cfg, Tables::from_shared(t)).unwrap();
        agent.tick();

        let h = agent.health().unwrap();
        assert_eq!(h.passes.get(), 1.0);
        assert_eq!(h.snapshots_written.get(), 1.0);
        assert_eq!(h.allocation_records.get(), 1.0);
    }

    #[test]
    fn test_sink_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the snapshot directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let mut cfg = snapshot_config(&blocker);
        cfg.health.enabled = true;

        let agent = Agent::new(cfg, Tables::from_shared(Arc::new(MemoryTables::new()))).unwrap();
        assert_eq!(agent.tick(), None);
        assert_eq!(agent.health().unwrap().sink_errors.get(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = snapshot_config(dir.path());
        cfg.interval = Duration::from_secs(1);

        let agent = Arc::new(
            Agent::new(cfg, Tables::from_shared(Arc::new(MemoryTables::new()))).unwrap(),
        );
        agent.start().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let agent = Arc::clone(&agent);
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();

        let passes = handle.await.unwrap();
        assert_eq!(passes, 3);
    }

    #[tokio::test]
    async fn test_cancel_before_first_tick_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let agent =
            Agent::new(snapshot_config(dir.path()), Tables::from_shared(Arc::new(MemoryTables::new())))
                .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(agent.run(cancel).await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
