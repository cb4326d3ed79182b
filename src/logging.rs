//! Logging setup.
//!
//! The library itself only emits `tracing` events. Binaries, and worker
//! processes during bootstrap, turn them into output with [`init`], which
//! installs a `tracing-subscriber` stack: an `EnvFilter`, a `fmt` layer
//! writing to stderr and, optionally, a `tracing-indicatif` layer drawing the
//! run progress bar.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `nagare=debug,warn`.
    pub filter: String,
    pub ansi: bool,
    /// Draw progress bars for spans. Worker processes turn this off.
    pub progress: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            ansi: true,
            progress: true,
        }
    }
}

static INSTALLED: OnceLock<LoggingConfig> = OnceLock::new();

/// The configuration installed by [`init`] in this process, if any.
pub fn installed() -> Option<&'static LoggingConfig> {
    INSTALLED.get()
}

/// Install the global subscriber described by `config`.
///
/// Returns `Ok(false)` without touching anything when a subscriber is already
/// installed in this process, whether by an earlier call or by someone else.
#[cfg(feature = "logging")]
pub fn init(config: &LoggingConfig) -> Result<bool, ConfigError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    if INSTALLED.get().is_some() {
        return Ok(false);
    }

    let filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::LogFilter {
        filter: config.filter.clone(),
        message: e.to_string(),
    })?;

    let result = if config.progress {
        let indicatif = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(config.ansi)
                    .with_writer(indicatif.get_stderr_writer()),
            )
            .with(indicatif)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    match result {
        Ok(()) => {
            let _ = INSTALLED.set(config.clone());
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

#[cfg(not(feature = "logging"))]
pub fn init(_: &LoggingConfig) -> Result<bool, ConfigError> {
    Ok(false)
}

#[cfg(all(test, feature = "logging"))]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter() {
        let config = LoggingConfig {
            filter: String::from("nagare=verbose"),
            ..Default::default()
        };
        // An earlier test may have installed a subscriber already.
        if installed().is_none() {
            assert!(matches!(init(&config), Err(ConfigError::LogFilter { .. })));
        }
    }
}
