//! Logging initialization
//!
//! Structured `tracing` output, either human readable or one JSON object per
//! line. The filter comes from `RUST_LOG` when set, otherwise from the
//! configured level.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Log level directive could not be parsed
    #[error("invalid log level {level}: {reason}")]
    InvalidLevel {
        /// Rejected directive
        level: String,
        /// Parser message
        reason: String,
    },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info", "debug,h2=warn")
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Build the level filter, preferring `RUST_LOG`
pub fn env_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(format!("{level},h2=warn,tower=warn,hyper=warn")).map_err(|e| {
        TelemetryError::InvalidLevel {
            level: level.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Install the global tracing subscriber
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(&config.level)?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_plain_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json);
    }

    #[test]
    fn level_directives_parse() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(env_filter("debug").is_ok());
        assert!(env_filter("iam_server=trace").is_ok());
    }
}
