//! Log subscriber setup for the binary.
//!
//! Library code logs through the `log` facade; [`init_logging`] bridges those
//! records into a tracing subscriber.

use std::str::FromStr;
use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Environment variable selecting the output format (`text` or `json`).
pub const LOG_FORMAT_ENV: &str = "FLEXOTRACK_LOG_FORMAT";

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

impl LogFormat {
    /// Reads [`LOG_FORMAT_ENV`], falling back to text.
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

/// Installs the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        if let Err(e) = tracing_log::LogTracer::init() {
            eprintln!("log bridge already installed: {}", e);
        }

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json()),
            ),
            LogFormat::Text => tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_target(true)),
            ),
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_formats() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    #[serial]
    fn test_format_from_env() {
        std::env::set_var(LOG_FORMAT_ENV, "json");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
        std::env::set_var(LOG_FORMAT_ENV, "bogus");
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
        std::env::remove_var(LOG_FORMAT_ENV);
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logging(LogFormat::Text);
        init_logging(LogFormat::Json);
        log::info!("logging initialised");
    }
}
