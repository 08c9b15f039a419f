/*!
Logging and metrics bootstrap.

Logs go through `tracing`; [`init_observability`] installs the global
subscriber. With the `metrics` feature a Prometheus registry counts backups
and restores.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{PetstashError, Result};

/// Filter applied when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "petstash=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<PetstashMetrics> = OnceLock::new();

/// Prometheus metrics for backup and restore operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PetstashMetrics {
    pub backups_total: Counter,
    pub restores_total: Counter,
    pub restore_failures_total: Counter,
    pub restored_files_total: Counter,
    pub snapshot_size_bytes: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl PetstashMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let backups_total = Counter::new("petstash_backups_total", "Backups written")
            .map_err(|e| metric_error("backups_total", e))?;
        let restores_total = Counter::new("petstash_restores_total", "Restores committed")
            .map_err(|e| metric_error("restores_total", e))?;
        let restore_failures_total = Counter::new(
            "petstash_restore_failures_total",
            "Restores rolled back after an error",
        )
        .map_err(|e| metric_error("restore_failures_total", e))?;
        let restored_files_total =
            Counter::new("petstash_restored_files_total", "Files restored into the upload area")
                .map_err(|e| metric_error("restored_files_total", e))?;
        let snapshot_size_bytes = Histogram::with_opts(
            HistogramOpts::new("petstash_snapshot_size_bytes", "Size of written backup archives")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).map_err(|e| {
                    metric_error("snapshot_size_bytes buckets", e)
                })?),
        )
        .map_err(|e| metric_error("snapshot_size_bytes", e))?;

        for collector in [
            Box::new(backups_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(restores_total.clone()),
            Box::new(restore_failures_total.clone()),
            Box::new(restored_files_total.clone()),
            Box::new(snapshot_size_bytes.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| metric_error("registration", e))?;
        }

        Ok(Self {
            backups_total,
            restores_total,
            restore_failures_total,
            restored_files_total,
            snapshot_size_bytes,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> &'static PetstashMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize petstash metrics"))
    }

    pub fn record_backup(&self, size_bytes: usize) {
        self.backups_total.inc();
        self.snapshot_size_bytes.observe(size_bytes as f64);
    }

    pub fn record_restore(&self, files: usize) {
        self.restores_total.inc();
        self.restored_files_total.inc_by(files as f64);
    }

    pub fn record_restore_failure(&self) {
        self.restore_failures_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PetstashError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| PetstashError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> PetstashError {
    PetstashError::storage(format!("Failed to create metric {name}: {e}"))
}

/// Install the global tracing subscriber.
///
/// `json` selects structured JSON lines instead of the human readable format.
/// `RUST_LOG` overrides the default `petstash=info` filter.
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with_filter(json, DEFAULT_LOG_FILTER)
}

/// Same as [`init_observability`] with a different fallback filter.
pub fn init_observability_with_filter(json: bool, default_filter: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    PetstashMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| PetstashError::config(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        set_global_default(subscriber)
    };

    result.map_err(|e| {
        PetstashError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("petstash observability initialized");
    Ok(())
}
