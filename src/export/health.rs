use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::tracer::stats::ScanOutcome;

const NAMESPACE: &str = "leakwatch";

/// Prometheus metrics describing the agent itself.
///
/// All metrics use the "leakwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed aggregation passes.
    pub passes: Counter,
    /// Wall time of one aggregation pass plus sink delivery.
    pub pass_duration: Histogram,
    /// Snapshot files written.
    pub snapshots_written: Counter,
    /// Sink delivery failures.
    pub sink_errors: Counter,
    /// Net outstanding bytes across all stacks at the last pass.
    pub outstanding_bytes: Gauge,
    /// Allocation records read from the allocation table.
    pub allocation_records: Counter,
    /// Stacks referenced by a record but missing from the stack table.
    pub stacks_lost: Counter,
    /// Records by scan outcome.
    pub records_by_outcome: CounterVec,
    /// Instrumentation probes attached, by type.
    pub probes_attached: GaugeVec,
    /// Instrumentation probes that failed to attach, by type.
    pub probes_failed: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let passes = Counter::with_opts(
            Opts::new("passes_total", "Completed aggregation passes.").namespace(NAMESPACE),
        )?;
        let pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pass_duration_seconds",
                "Duration of one aggregation pass including sink delivery.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
        )?;
        let snapshots_written = Counter::with_opts(
            Opts::new("snapshots_written_total", "Snapshot files written.").namespace(NAMESPACE),
        )?;
        let sink_errors = Counter::with_opts(
            Opts::new("sink_errors_total", "Sink delivery failures.").namespace(NAMESPACE),
        )?;
        let outstanding_bytes = Gauge::with_opts(
            Opts::new(
                "outstanding_bytes",
                "Net outstanding bytes summed over all stacks.",
            )
            .namespace(NAMESPACE),
        )?;
        let allocation_records = Counter::with_opts(
            Opts::new(
                "allocation_records_total",
                "Allocation records read from the allocation table.",
            )
            .namespace(NAMESPACE),
        )?;
        let stacks_lost = Counter::with_opts(
            Opts::new(
                "stacks_lost_total",
                "Stacks referenced by a record but missing from the stack table.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_by_outcome = CounterVec::new(
            Opts::new(
                "records_by_outcome_total",
                "Allocation records by scan outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let probes_attached = GaugeVec::new(
            Opts::new(
                "probes_attached",
                "Number of successfully attached probes by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;
        let probes_failed = GaugeVec::new(
            Opts::new(
                "probes_failed",
                "Number of probes that failed to attach by type.",
            )
            .namespace(NAMESPACE),
            &["type"],
        )?;

        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        registry.register(Box::new(snapshots_written.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(outstanding_bytes.clone()))?;
        registry.register(Box::new(allocation_records.clone()))?;
        registry.register(Box::new(stacks_lost.clone()))?;
        registry.register(Box::new(records_by_outcome.clone()))?;
        registry.register(Box::new(probes_attached.clone()))?;
        registry.register(Box::new(probes_failed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            passes,
            pass_duration,
            snapshots_written,
            sink_errors,
            outstanding_bytes,
            allocation_records,
            stacks_lost,
            records_by_outcome,
            probes_attached,
            probes_failed,
        })
    }

    /// Fold one drained set of scan counters into the metrics.
    pub fn observe_scan(&self, counts: &[(ScanOutcome, u64)]) {
        for &(outcome, n) in counts {
            let n = n as f64;
            self.records_by_outcome
                .with_label_values(&[outcome.as_str()])
                .inc_by(n);

            match outcome {
                // Lost stacks are counted per stack, not per record.
                ScanOutcome::StackLost => self.stacks_lost.inc_by(n),
                _ => self.allocation_records.inc_by(n),
            }
        }
    }

    /// Record how many probes of one type attached.
    pub fn set_probe_counts(&self, kind: &str, attached: u32, failed: u32) {
        self.probes_attached
            .with_label_values(&[kind])
            .set(f64::from(attached));
        self.probes_failed
            .with_label_values(&[kind])
            .set(f64::from(failed));
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "serving metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
