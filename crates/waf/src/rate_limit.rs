//! Per-client rate limiting
//!
//! Sliding-window approximation: each `(client_ip, path_bucket)` key owns a
//! fixed ring of time buckets. A check advances the ring, sums the live
//! buckets, and denies once the sum reaches the configured request count.
//! This is not a token bucket — a burst that fits the window is admitted.
//!
//! The counter map is sharded (`DashMap`) so many concurrent checkers and
//! one periodic cleaner do not contend on a single lock.

use dashmap::DashMap;
use regex::Regex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use palisade_common::{PalisadeError, PalisadeResult};
use palisade_config::RateLimitConfig;

/// Ring granularity; the window is divided into this many buckets
const RING_SLOTS: usize = 16;

/// Sentinel bucket used when limits are not path-scoped
pub const ALL_PATHS_BUCKET: &str = "*";

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited,
}

/// Key under which request counts accumulate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub client_ip: IpAddr,
    pub path_bucket: String,
}

/// Ring of per-window buckets for one key
#[derive(Debug)]
struct RateCounter {
    /// (bucket index, count); an index outside the live range is stale
    slots: [(u64, u64); RING_SLOTS],
    /// Last time this counter was touched, for GC
    last_seen: Instant,
}

impl RateCounter {
    fn new(now: Instant) -> Self {
        Self {
            slots: [(0, 0); RING_SLOTS],
            last_seen: now,
        }
    }

    /// Sum the live buckets and, when under the limit, count this request.
    fn observe(&mut self, current_idx: u64, limit: u64, now: Instant) -> RateDecision {
        self.last_seen = now;

        let oldest_live = current_idx.saturating_sub(RING_SLOTS as u64 - 1);
        let live_sum: u64 = self
            .slots
            .iter()
            .filter(|(idx, _)| *idx >= oldest_live && *idx <= current_idx)
            .map(|(_, count)| count)
            .sum();

        if live_sum >= limit {
            return RateDecision::Limited;
        }

        let pos = (current_idx % RING_SLOTS as u64) as usize;
        if self.slots[pos].0 != current_idx {
            self.slots[pos] = (current_idx, 0);
        }
        self.slots[pos].1 += 1;
        RateDecision::Allowed
    }
}

/// Sliding-window rate limiter over `(client_ip, path_bucket)` keys
pub struct RateLimiter {
    requests: u64,
    window: Duration,
    slot_width: Duration,
    cleanup_interval: Duration,
    counters: DashMap<RateKey, RateCounter>,
    path_patterns: Vec<Regex>,
    match_all_paths: bool,
    epoch: Instant,
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
}

impl RateLimiter {
    /// Build a limiter from configuration. Path patterns are regexes and
    /// must compile; `requests` must be positive (the engine skips
    /// construction entirely when rate limiting is disabled).
    pub fn new(config: &RateLimitConfig) -> PalisadeResult<Self> {
        if config.requests == 0 {
            return Err(PalisadeError::config(
                "rate limiter constructed with requests == 0",
            ));
        }

        let mut path_patterns = Vec::with_capacity(config.paths.len());
        for pattern in &config.paths {
            let compiled = Regex::new(pattern).map_err(|e| {
                PalisadeError::config(format!("invalid rate limit path pattern {pattern:?}: {e}"))
            })?;
            path_patterns.push(compiled);
        }

        let window = Duration::from_secs(config.window_secs);
        let slot_width = (window / RING_SLOTS as u32).max(Duration::from_millis(1));

        Ok(Self {
            requests: config.requests,
            window,
            slot_width,
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            counters: DashMap::new(),
            path_patterns,
            match_all_paths: config.match_all_paths,
            epoch: Instant::now(),
            total_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
        })
    }

    /// The path bucket this request counts under, or `None` when the
    /// limiter does not apply to the path.
    pub fn scope_path(&self, path: &str) -> Option<String> {
        if self.match_all_paths {
            return Some(ALL_PATHS_BUCKET.to_string());
        }
        if self.path_patterns.is_empty() {
            return Some(ALL_PATHS_BUCKET.to_string());
        }
        if self.path_patterns.iter().any(|p| p.is_match(path)) {
            return Some(path.to_string());
        }
        None
    }

    /// Check a request against its key, counting it when admitted.
    pub fn check(&self, client_ip: IpAddr, path_bucket: String) -> RateDecision {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let current_idx = (now.duration_since(self.epoch).as_nanos()
            / self.slot_width.as_nanos().max(1)) as u64;

        let key = RateKey {
            client_ip,
            path_bucket,
        };
        let mut counter = self
            .counters
            .entry(key)
            .or_insert_with(|| RateCounter::new(now));

        let decision = counter.observe(current_idx, self.requests, now);
        if decision == RateDecision::Limited {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
            trace!(ip = %counter.key().client_ip, "Request rate limited");
        }
        decision
    }

    /// Drop counters idle for at least twice the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.window * 2;
        let before = self.counters.len();
        self.counters
            .retain(|_, counter| now.duration_since(counter.last_seen) < horizon);
        let removed = before - self.counters.len();
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Rate limiter cleanup");
        }
    }

    /// Spawn the periodic cleaner. The task runs until aborted (the engine
    /// aborts it on shutdown).
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let interval = self.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        })
    }

    /// Total checks observed.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Checks that were denied.
    pub fn blocked_requests(&self) -> u64 {
        self.blocked_requests.load(Ordering::Relaxed)
    }

    /// Number of live counters (test and introspection hook).
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Force a counter to look idle; test hook for GC behavior.
    #[cfg(test)]
    fn age_counter(&self, key: &RateKey, by: Duration) {
        if let Some(mut counter) = self.counters.get_mut(key) {
            counter.last_seen = counter
                .last_seen
                .checked_sub(by)
                .unwrap_or(counter.last_seen);
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("requests", &self.requests)
            .field("window", &self.window)
            .field("counters", &self.counters.len())
            .finish()
    }
}
