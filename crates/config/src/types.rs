//! Configuration sub-structures
//!
//! Each block here corresponds to one feature of the firewall. Defaults are
//! expressed through default-value functions so a minimal JSON document
//! yields a working configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Country-based access filter (used for both blacklist and whitelist)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CountryAccessFilter {
    /// Whether this filter participates in the decision stack
    #[serde(default)]
    pub enabled: bool,

    /// ISO 3166-1 alpha-2 country codes
    #[serde(default)]
    pub country_list: Vec<String>,

    /// Path to the MaxMind country database
    #[serde(default)]
    pub geoip_db_path: Option<PathBuf>,
}

/// Behavior when the GeoIP oracle cannot resolve an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeoFallbackBehavior {
    /// Treat lookup failures as "no geographic objection"
    #[default]
    DefaultAllow,
    /// Treat lookup failures as a block
    DefaultDeny,
}

/// Rate limiter configuration
///
/// `requests == 0` disables rate limiting entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Allowed request count per window
    #[serde(default)]
    pub requests: u64,

    /// Sliding window size in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// GC cadence in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Path patterns (regex) the limiter applies to
    #[serde(default)]
    pub paths: Vec<String>,

    /// Count every path, ignoring `paths`
    #[serde(default)]
    pub match_all_paths: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 0,
            window_secs: default_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            paths: Vec::new(),
            match_all_paths: false,
        }
    }
}

/// Per-status override for the blocked response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomBlockResponse {
    /// Status code to respond with (may differ from the triggering status)
    pub status_code: u16,

    /// Extra response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: String,
}

/// TOR exit-node blocking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TorConfig {
    /// Whether to fetch the exit list and merge it into the IP blacklist
    #[serde(default)]
    pub enabled: bool,

    /// Where to fetch the exit list from
    #[serde(default = "default_tor_blocklist_url")]
    pub blocklist_url: String,

    /// How often to re-fetch, in seconds
    #[serde(default = "default_tor_refresh_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            blocklist_url: default_tor_blocklist_url(),
            refresh_interval_secs: default_tor_refresh_secs(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_tor_blocklist_url() -> String {
    "https://check.torproject.org/torbulkexitlist".to_string()
}

fn default_tor_refresh_secs() -> u64 {
    86_400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_defaults() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.requests, 0);
        assert_eq!(cfg.window_secs, 60);
        assert_eq!(cfg.cleanup_interval_secs, 300);
        assert!(!cfg.match_all_paths);
    }

    #[test]
    fn test_tor_defaults() {
        let cfg = TorConfig::default();
        assert!(!cfg.enabled);
        assert!(cfg.blocklist_url.contains("torbulkexitlist"));
        assert_eq!(cfg.refresh_interval_secs, 86_400);
    }

    #[test]
    fn test_geo_fallback_parse() {
        let allow: GeoFallbackBehavior = serde_json::from_str("\"default_allow\"").unwrap();
        let deny: GeoFallbackBehavior = serde_json::from_str("\"default_deny\"").unwrap();
        assert_eq!(allow, GeoFallbackBehavior::DefaultAllow);
        assert_eq!(deny, GeoFallbackBehavior::DefaultDeny);
    }

    #[test]
    fn test_country_filter_minimal_json() {
        let filter: CountryAccessFilter =
            serde_json::from_str(r#"{"enabled": true, "country_list": ["BR", "US"]}"#).unwrap();
        assert!(filter.enabled);
        assert_eq!(filter.country_list, vec!["BR", "US"]);
        assert!(filter.geoip_db_path.is_none());
    }
}
