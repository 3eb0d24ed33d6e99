//! Configuration validation
//!
//! Semantic checks that cannot be expressed through serde alone. Validation
//! is allowed to repair values with documented fallbacks (invalid anomaly
//! threshold, zero log buffer) but rejects combinations that would leave the
//! firewall in an ambiguous state.

use palisade_common::{PalisadeError, PalisadeResult};
use tracing::warn;

use crate::Config;

/// Threshold applied when the configured anomaly threshold is unusable
pub const FALLBACK_ANOMALY_THRESHOLD: i64 = 20;

/// Log channel capacity applied when the configured one is zero
pub const FALLBACK_LOG_BUFFER: usize = 1000;

/// Validate a configuration, repairing values where a documented fallback
/// exists and rejecting everything else.
pub fn validate(config: &mut Config) -> PalisadeResult<()> {
    if config.anomaly_threshold <= 0 {
        warn!(
            configured = config.anomaly_threshold,
            fallback = FALLBACK_ANOMALY_THRESHOLD,
            "Invalid anomaly threshold, using fallback"
        );
        config.anomaly_threshold = FALLBACK_ANOMALY_THRESHOLD;
    }

    if config.log_buffer == 0 {
        warn!(
            fallback = FALLBACK_LOG_BUFFER,
            "Log buffer capacity of zero is not usable, using fallback"
        );
        config.log_buffer = FALLBACK_LOG_BUFFER;
    }

    if config.rate_limit.requests > 0 {
        if config.rate_limit.window_secs == 0 || config.rate_limit.cleanup_interval_secs == 0 {
            return Err(PalisadeError::config(
                "invalid rate limit configuration: requests, window, and cleanup_interval must be greater than zero",
            ));
        }
    }

    for (trigger_status, response) in &config.custom_responses {
        if !(100..=599).contains(trigger_status) || !(100..=599).contains(&response.status_code) {
            return Err(PalisadeError::config(format!(
                "custom response for status {} has an out-of-range status code",
                trigger_status
            )));
        }
    }

    if !(100..=599).contains(&config.block_status_code) {
        return Err(PalisadeError::config(format!(
            "block_status_code {} is out of range",
            config.block_status_code
        )));
    }

    // A country filter without a database cannot decide anything; disable it
    // rather than fail, matching the file-missing policy.
    for (name, filter) in [
        ("country_block", &mut config.country_block),
        ("country_whitelist", &mut config.country_whitelist),
    ] {
        if filter.enabled && filter.geoip_db_path.is_none() {
            warn!(filter = name, "Country filter enabled without a GeoIP database path, disabling");
            filter.enabled = false;
        }
    }

    if config.tor.enabled && config.tor.blocklist_url.is_empty() {
        return Err(PalisadeError::config(
            "tor blocking enabled without a blocklist_url",
        ));
    }

    if config.max_body_bytes == 0 {
        warn!("max_body_bytes of zero disables body inspection entirely");
    }

    Ok(())
}
