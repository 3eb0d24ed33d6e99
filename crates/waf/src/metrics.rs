//! Firewall metrics
//!
//! Plain atomic counters plus sharded hit maps. Per-rule counters are
//! eventually consistent under concurrent increments; the snapshot is a
//! point-in-time JSON document with a fixed field list, served directly by
//! the handler at the configured metrics endpoint.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::InspectionPhase;

/// Version string reported by the snapshot
pub const WAF_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-wide firewall counters
#[derive(Debug, Default)]
pub struct WafMetrics {
    total_requests: AtomicU64,
    allowed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    geoip_blocked: AtomicU64,
    ip_blacklist_hits: AtomicU64,
    dns_blacklist_hits: AtomicU64,
    log_dropped: AtomicU64,
    rule_hits: DashMap<String, u64>,
    rule_hits_by_phase: DashMap<u8, u64>,
    geoip_stats: DashMap<String, u64>,
}

/// Point-in-time serialization of [`WafMetrics`]
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub allowed_requests: u64,
    pub rule_hits: HashMap<String, u64>,
    pub rule_hits_by_phase: HashMap<u8, u64>,
    pub geoip_blocked: u64,
    pub ip_blacklist_hits: u64,
    pub dns_blacklist_hits: u64,
    pub rate_limiter_requests: u64,
    pub rate_limiter_blocked_requests: u64,
    pub version: &'static str,
}

impl WafMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_geoip_blocked(&self) {
        self.geoip_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ip_blacklist_hit(&self) {
        self.ip_blacklist_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns_blacklist_hit(&self) {
        self.dns_blacklist_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_dropped(&self) {
        self.log_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one rule hit, keyed by rule id and by phase.
    pub fn record_rule_hit(&self, rule_id: &str, phase: InspectionPhase) {
        *self.rule_hits.entry(rule_id.to_string()).or_insert(0) += 1;
        *self.rule_hits_by_phase.entry(phase.number()).or_insert(0) += 1;
    }

    /// Count one geo lookup result by country.
    pub fn record_geoip_country(&self, country: &str) {
        *self.geoip_stats.entry(country.to_string()).or_insert(0) += 1;
    }

    pub fn log_dropped(&self) -> u64 {
        self.log_dropped.load(Ordering::Relaxed)
    }

    /// Per-rule hit counts, for shutdown reporting.
    pub fn rule_hit_stats(&self) -> HashMap<String, u64> {
        self.rule_hits
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Per-country lookup counts.
    pub fn geoip_stats(&self) -> HashMap<String, u64> {
        self.geoip_stats
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Produce the snapshot. Rate limiter totals are passed in since the
    /// limiter owns its own counters (and may not exist at all).
    pub fn snapshot(
        &self,
        rate_limiter_requests: u64,
        rate_limiter_blocked_requests: u64,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            rule_hits: self.rule_hit_stats(),
            rule_hits_by_phase: self
                .rule_hits_by_phase
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            geoip_blocked: self.geoip_blocked.load(Ordering::Relaxed),
            ip_blacklist_hits: self.ip_blacklist_hits.load(Ordering::Relaxed),
            dns_blacklist_hits: self.dns_blacklist_hits.load(Ordering::Relaxed),
            rate_limiter_requests,
            rate_limiter_blocked_requests,
            version: WAF_VERSION,
        }
    }
}
