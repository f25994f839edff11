//! Logging, metrics, and span plumbing for GEPA runs
//!
//! The engine never reaches for a global logger or tracker: every sink is passed in
//! explicitly. This module provides the sink traits plus the `tracing`-backed
//! implementations used by default.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Jsonl,
    #[default]
    Pretty,
}

pub fn setup_logging(format: LogFormat) -> Result<(), Error> {
    match format {
        LogFormat::Jsonl => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .json()
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to initialize tracing: {e}"),
                })
            })
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to initialize tracing: {e}"),
                })
            })
        }
    }
}

/// Human-readable progress messages for a run
pub trait RunLogger: Send + Sync {
    fn log(&self, message: &str);
}

/// Forwards run messages to `tracing` at INFO level
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl RunLogger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::info!(target: "gepa_engine::run", "{message}");
    }
}

/// Sink for numeric run metrics
pub trait ExperimentTracker: Send {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: i64);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracker;

impl ExperimentTracker for NoopTracker {
    fn log_metrics(&mut self, _metrics: &BTreeMap<String, f64>, _step: i64) {}
}

/// Emits every metric batch as a structured `tracing` event
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTracker;

impl ExperimentTracker for TracingTracker {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: i64) {
        tracing::info!(target: "gepa_engine::metrics", step, metrics = ?metrics, "metrics");
    }
}

type MetricRecords = Arc<Mutex<Vec<(i64, BTreeMap<String, f64>)>>>;

/// Keeps every logged batch in memory, in logging order.
/// Clones share the same record list, so a clone can be handed to the engine
/// while the original is kept for inspection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryTracker {
    records: MetricRecords,
}

impl InMemoryTracker {
    pub fn records(&self) -> Vec<(i64, BTreeMap<String, f64>)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl ExperimentTracker for InMemoryTracker {
    fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>, step: i64) {
        if let Ok(mut records) = self.records.lock() {
            records.push((step, metrics.clone()));
        }
    }
}

/// Span wrapper around the phases of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Telemetry {
    #[default]
    Disabled,
    Tracing,
}

impl Telemetry {
    /// Runs `fut` inside an INFO span named after `name` when telemetry is enabled.
    /// When disabled, `fut` is awaited as-is.
    pub async fn with_span<F, T>(self, name: &str, attrs: &[(&str, String)], fut: F) -> T
    where
        F: Future<Output = T>,
    {
        match self {
            Telemetry::Disabled => fut.await,
            Telemetry::Tracing => {
                let span = tracing::info_span!("gepa", otel.name = name, attributes = ?attrs);
                fut.instrument(span).await
            }
        }
    }
}
