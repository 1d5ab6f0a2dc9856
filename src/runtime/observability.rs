//! Structured logging setup.
//!
//! Runtime internals log under `durable_core::runtime`, orchestration code
//! (through the replay-safe `durable_*!` macros) under
//! `durable_core::orchestration`, and activities under `durable_core::activity`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format with all fields
    Pretty,
    /// Compact format: timestamp level target fields message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// # use durable_core::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// ```
///
/// `RUST_LOG`, when set, overrides `log_level`.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to orchestration, activity and runtime targets (e.g. "info", "debug").
    pub log_level: String,
    /// Recorded on the startup log line.
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "durable-core".to_string(),
        }
    }
}

pub(crate) fn default_filter_expression(level: &str) -> String {
    format!(
        "warn,durable_core::orchestration={level},durable_core::activity={level},durable_core::runtime={level}"
    )
}

/// Install a global `tracing` subscriber. Fails if one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}"))?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}"))?,
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}"))?,
    }

    tracing::info!(
        target: "durable_core::runtime",
        service_name = %config.service_name,
        log_format = ?config.log_format,
        "logging initialized"
    );
    Ok(())
}
