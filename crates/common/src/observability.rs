//! Tracing initialization for the Palisade WAF
//!
//! Sets up the `tracing` subscriber according to the firewall configuration:
//! console output filtered at the configured severity, optionally rendered
//! as JSON for log shippers. The per-request event log (the bounded-channel
//! worker) lives in the engine crate; this module only wires the process
//! diagnostics.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Severity threshold for emitted log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogSeverity {
    /// The `tracing` directive string for this severity
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Initialize the tracing/logging subsystem.
///
/// `RUST_LOG` takes precedence over the configured severity so operators can
/// raise verbosity for a single component without touching the WAF config.
pub fn init_tracing(severity: LogSeverity, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(severity.as_filter()));

    let json_layer = if json {
        Some(fmt::layer().json().with_target(true))
    } else {
        None
    };

    let console_layer = if json {
        None
    } else {
        Some(fmt::layer().with_target(true))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(LogSeverity::Debug < LogSeverity::Info);
        assert!(LogSeverity::Info < LogSeverity::Warn);
        assert!(LogSeverity::Warn < LogSeverity::Error);
    }

    #[test]
    fn test_severity_parse() {
        let sev: LogSeverity = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(sev, LogSeverity::Warn);
        assert_eq!(sev.as_filter(), "warn");
    }

    #[test]
    fn test_severity_default() {
        assert_eq!(LogSeverity::default(), LogSeverity::Info);
    }
}
