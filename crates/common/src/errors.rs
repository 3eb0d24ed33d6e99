//! Error types for the Palisade WAF
//!
//! This module defines the typed failure modes of the firewall core. The
//! guiding policy: no error is ever allowed to outrank a decision signal —
//! a block decision always wins over a logging or lookup failure.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Palisade operations
#[derive(Error, Debug)]
pub enum PalisadeError {
    /// Configuration is invalid; the load (or reload) is rejected
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single rule failed validation; the rest of the load continues
    #[error("Invalid rule {rule_id}: {reason}")]
    RuleInvalid { rule_id: String, reason: String },

    /// A rule file could not be parsed at all; the whole load fails
    #[error("Failed to parse rule file {file}: {reason}")]
    RuleFile { file: PathBuf, reason: String },

    /// A referenced file does not exist; the feature is disabled
    #[error("File not found: {path}")]
    FileMissing { path: PathBuf },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// A target expression was not recognized by the value extractor
    #[error("Unknown extraction target: {target}")]
    UnknownTarget { target: String },

    /// GeoIP oracle failures; resolved via the configured fallback behavior
    #[error("GeoIP lookup failed: {message}")]
    GeoLookup { message: String },

    /// Timeout errors (reverse DNS, shutdown drain)
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
}

/// Non-fatal per-request events the engine records through the log worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEvent {
    /// A target's scope is not available in the current phase
    ExtractionUnavailable,
    /// The request body exceeded the inspection cap
    BodyTruncated,
    /// The log channel was full and an entry was dropped
    LogDropped,
    /// A phase-4 match crossed the threshold after bytes were sent
    PostSendBlock,
    /// A request crossed ruleset generations between phases
    GenerationCrossed,
}

impl fmt::Display for RequestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtractionUnavailable => write!(f, "extraction_unavailable"),
            Self::BodyTruncated => write!(f, "body_truncated"),
            Self::LogDropped => write!(f, "log_dropped"),
            Self::PostSendBlock => write!(f, "post_send_block"),
            Self::GenerationCrossed => write!(f, "generation_crossed"),
        }
    }
}

/// Result type alias for Palisade operations
pub type PalisadeResult<T> = Result<T, PalisadeError>;

impl PalisadeError {
    /// Create a configuration error without a source
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a per-rule validation error
    pub fn rule_invalid(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RuleInvalid {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error invalidates an entire load generation.
    ///
    /// Per-rule failures are warnings; everything that would leave a
    /// half-built generation behind is fatal to the load.
    pub fn is_load_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::RuleFile { .. } | Self::Io { .. }
        )
    }
}

impl From<std::io::Error> for PalisadeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            path: None,
            source: err,
        }
    }
}
