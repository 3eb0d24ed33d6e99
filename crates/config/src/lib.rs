//! Configuration module for the Palisade WAF
//!
//! This module provides the configuration model, JSON loading, and semantic
//! validation, with a focus on security-first defaults: a minimal document
//! yields a firewall that inspects with sane limits, and anything ambiguous
//! is either repaired with a documented fallback or rejected at load time.
//!
//! # Module Organization
//!
//! - [`types`]: Feature sub-structures (country filters, rate limits, TOR, ...)
//! - [`validation`]: Semantic validation beyond what serde expresses

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use palisade_common::{PalisadeError, PalisadeResult};

pub mod types;
pub mod validation;

pub use types::{
    CountryAccessFilter, CustomBlockResponse, GeoFallbackBehavior, RateLimitConfig, TorConfig,
};
pub use validation::{validate, FALLBACK_ANOMALY_THRESHOLD, FALLBACK_LOG_BUFFER};

// Re-export the severity type from common for convenience
pub use palisade_common::LogSeverity;

/// Default request body inspection cap (10 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Root firewall configuration
///
/// The recognized option set is closed: unknown keys are a load error, not
/// a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Rule files to load, in order
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,

    /// One CIDR or bare IP per line; `#` comments
    #[serde(default)]
    pub ip_blacklist_file: Option<PathBuf>,

    /// One host per line; lowercased on load
    #[serde(default)]
    pub dns_blacklist_file: Option<PathBuf>,

    /// Accumulated score at or above this blocks the request
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: i64,

    /// Country blacklist
    #[serde(default)]
    pub country_block: CountryAccessFilter,

    /// Country whitelist; strictly dominates the blacklist
    #[serde(default)]
    pub country_whitelist: CountryAccessFilter,

    /// Rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-status overrides for the blocked response
    #[serde(default)]
    pub custom_responses: HashMap<u16, CustomBlockResponse>,

    /// Severity threshold for emitted log entries
    #[serde(default)]
    pub log_severity: LogSeverity,

    /// Emit JSON log lines instead of console format
    #[serde(default)]
    pub log_json: bool,

    /// Append-only event log sink (also emitted to stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Log channel capacity
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,

    /// Replace sensitive field values with a placeholder in logged output
    #[serde(default)]
    pub redact_sensitive_data: bool,

    /// Header/cookie/form names whose values are redacted in logs
    #[serde(default = "default_sensitive_fields")]
    pub sensitive_fields: Vec<String>,

    /// HTTP path answering with the metrics snapshot
    #[serde(default)]
    pub metrics_endpoint: Option<String>,

    /// TOR exit-node blocking
    #[serde(default)]
    pub tor: TorConfig,

    /// GeoIP lookup cache lifetime in seconds
    #[serde(default = "default_geo_cache_ttl_secs")]
    pub geo_ip_cache_ttl_secs: u64,

    /// What to do when the GeoIP oracle fails
    #[serde(default)]
    pub geo_ip_lookup_fallback_behavior: GeoFallbackBehavior,

    /// Proxies whose `X-Forwarded-For` is trusted for client IP derivation
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    /// Request body inspection cap in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Status code for rule-driven blocks
    #[serde(default = "default_block_status")]
    pub block_status_code: u16,

    /// Hard deadline for reverse DNS lookups in milliseconds
    #[serde(default = "default_reverse_dns_timeout_ms")]
    pub reverse_dns_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rule_files: Vec::new(),
            ip_blacklist_file: None,
            dns_blacklist_file: None,
            anomaly_threshold: default_anomaly_threshold(),
            country_block: CountryAccessFilter::default(),
            country_whitelist: CountryAccessFilter::default(),
            rate_limit: RateLimitConfig::default(),
            custom_responses: HashMap::new(),
            log_severity: LogSeverity::default(),
            log_json: false,
            log_file: None,
            log_buffer: default_log_buffer(),
            redact_sensitive_data: false,
            sensitive_fields: default_sensitive_fields(),
            metrics_endpoint: None,
            tor: TorConfig::default(),
            geo_ip_cache_ttl_secs: default_geo_cache_ttl_secs(),
            geo_ip_lookup_fallback_behavior: GeoFallbackBehavior::default(),
            trusted_proxies: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
            block_status_code: default_block_status(),
            reverse_dns_timeout_ms: default_reverse_dns_timeout_ms(),
        }
    }
}

impl Config {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> PalisadeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| PalisadeError::Io {
            message: format!("failed to read config: {e}"),
            path: Some(path.to_path_buf()),
            source: e,
        })?;
        let mut config = Self::from_json(&raw)?;
        validation::validate(&mut config)?;
        info!(path = %path.display(), "Loaded WAF configuration");
        Ok(config)
    }

    /// Parse a configuration from a JSON string without validation.
    pub fn from_json(raw: &str) -> PalisadeResult<Self> {
        serde_json::from_str(raw).map_err(|e| PalisadeError::Config {
            message: format!("invalid configuration document: {e}"),
            source: Some(Box::new(e)),
        })
    }

    /// Whether rate limiting is configured at all.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit.requests > 0
    }

    /// The GeoIP database path serving both country filters, if any.
    ///
    /// The whitelist's path wins when both filters name one.
    pub fn geoip_db_path(&self) -> Option<&Path> {
        if self.country_whitelist.enabled {
            if let Some(path) = self.country_whitelist.geoip_db_path.as_deref() {
                return Some(path);
            }
        }
        if self.country_block.enabled {
            return self.country_block.geoip_db_path.as_deref();
        }
        None
    }
}

fn default_anomaly_threshold() -> i64 {
    5
}

fn default_log_buffer() -> usize {
    1000
}

fn default_geo_cache_ttl_secs() -> u64 {
    3600
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_block_status() -> u16 {
    403
}

fn default_reverse_dns_timeout_ms() -> u64 {
    200
}

fn default_sensitive_fields() -> Vec<String> {
    ["authorization", "cookie", "set-cookie", "password", "token", "api_key"]
        .into_iter()
        .map(str::to_string)
        .collect()
}
