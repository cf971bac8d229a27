//! Logging setup
//!
//! Installs a `tracing_subscriber` registry with an env filter and a console
//! layer, either human-readable or JSON.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Configuration
// ============================================================================

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log filter (e.g., "info", "taskpool_supervisor=debug")
    pub log_filter: Option<String>,
    /// Console output format
    pub format: LogFormat,
    /// Include the event target in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter (default: "info")
    /// - `LOG_FORMAT`: `json` or `pretty` (default: "pretty")
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            format: std::env::var("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            with_target: true,
        }
    }

    /// Set the log filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Set the output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
///
/// # Example
///
/// ```no_run
/// use taskpool_supervisor::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::from_env()).expect("logging already initialized");
/// tracing::info!("supervisor starting");
/// ```
pub fn init_telemetry(
    config: TelemetryConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = config.filter();

    let console_layer = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(console_layer).try_init()
}
