//! Subscriber setup for binaries embedding the queue.
//!
//! The library itself only emits `tracing` events. Call [`init_logging`] once near the
//! start of `main` to get them printed.

use crate::{DispatchError, Result, config::LoggingConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Builds the filter for `config`. `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| {
        DispatchError::Config(format!("invalid log level '{}': {}", config.level, e))
    })
}

/// Installs the global subscriber.
///
/// Fails with [`DispatchError::Config`] when a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_format {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
    };

    installed.map_err(|e| {
        DispatchError::Config(format!("Failed to initialize tracing subscriber: {}", e))
    })?;

    tracing::debug!(service = %config.service_name, level = %config.level, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "dispatchwork=verbose".to_string(),
            ..Default::default()
        };
        assert!(matches!(env_filter(&config), Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        // another test binary may already own the global subscriber
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
