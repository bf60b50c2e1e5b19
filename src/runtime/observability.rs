//! Structured logging setup and worker metrics.
//!
//! Logging goes through `tracing`. Metrics are plain atomic counters that
//! tests and diagnostics read through [`MetricsSnapshot`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level target message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// # Example
///
/// ```rust,no_run
/// # use funcworker::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// ```
///
/// # Correlation Fields
///
/// Invocation-scoped logs carry:
/// - `invocation_id` - Host-assigned invocation identifier
/// - `function_id` - Id of the loaded function
/// - `function_name` - Name of the loaded function
/// - `request_id` - Correlation id of the envelope being handled
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Log output format
    pub log_format: LogFormat,
    /// Log level filter (e.g., "info", "debug")
    pub log_level: String,
    /// Name attached to the startup log line
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "funcworker".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,funcworker={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {}", e))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {}", e))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {}", e))?;
        }
    }

    tracing::info!(service = %config.service_name, format = ?config.log_format, "logging initialized");
    Ok(())
}

/// Snapshot of worker counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub functions_loaded: u64,
    pub load_failures: u64,
    pub invocations_started: u64,
    pub invocations_succeeded: u64,
    pub invocations_failed: u64,
    pub invocations_cancelled: u64,
    pub messages_dropped: u64,
    pub dispose_failures: u64,
    pub in_flight: i64,
}

/// Atomic counters shared by the router and invocation handler.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    functions_loaded: AtomicU64,
    load_failures: AtomicU64,
    invocations_started: AtomicU64,
    invocations_succeeded: AtomicU64,
    invocations_failed: AtomicU64,
    invocations_cancelled: AtomicU64,
    messages_dropped: AtomicU64,
    dispose_failures: AtomicU64,
    in_flight: AtomicI64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_function_loaded(&self) {
        self.functions_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invocation_start(&self) {
        self.invocations_started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invocation_success(&self) {
        self.invocations_succeeded.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_invocation_failure(&self) {
        self.invocations_failed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_invocation_cancelled(&self) {
        self.invocations_cancelled.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispose_failures(&self, count: usize) {
        self.dispose_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            functions_loaded: self.functions_loaded.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            invocations_started: self.invocations_started.load(Ordering::Relaxed),
            invocations_succeeded: self.invocations_succeeded.load(Ordering::Relaxed),
            invocations_failed: self.invocations_failed.load(Ordering::Relaxed),
            invocations_cancelled: self.invocations_cancelled.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            dispose_failures: self.dispose_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
