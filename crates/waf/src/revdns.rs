//! Bounded reverse DNS lookups
//!
//! The DNS blacklist needs the hostnames behind a client address. Reverse
//! lookups are strictly best-effort: a hard timeout bounds every query, and
//! failure of any kind means "no hostnames" rather than an error — slow DNS
//! must never decide a request. Results are cached per IP for the same TTL
//! as GeoIP lookups.

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use palisade_common::{PalisadeError, PalisadeResult};

use crate::blacklist::DnsSet;

/// Backend PTR lookup
#[async_trait]
pub trait ReverseLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> PalisadeResult<Vec<String>>;
}

/// Hickory-based resolver backend using the system-default configuration
pub struct HickoryReverseLookup {
    resolver: TokioResolver,
}

impl HickoryReverseLookup {
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { resolver }
    }
}

#[async_trait]
impl ReverseLookup for HickoryReverseLookup {
    async fn lookup(&self, ip: IpAddr) -> PalisadeResult<Vec<String>> {
        let response = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|e| PalisadeError::GeoLookup {
                message: format!("reverse lookup failed: {e}"),
            })?;

        Ok(response
            .iter()
            .map(|ptr| DnsSet::canonicalize(&ptr.to_string()))
            .collect())
    }
}

struct CachedHosts {
    hosts: Vec<String>,
    cached_at: Instant,
}

/// Timeout- and cache-wrapped reverse resolver
pub struct ReverseDnsChecker {
    inner: Arc<dyn ReverseLookup>,
    timeout: Duration,
    cache: DashMap<IpAddr, CachedHosts>,
    cache_ttl: Duration,
}

impl ReverseDnsChecker {
    /// Build over the hickory backend.
    pub fn new(timeout: Duration, cache_ttl: Duration) -> Self {
        Self::with_backend(Arc::new(HickoryReverseLookup::new()), timeout, cache_ttl)
    }

    /// Build over any backend (tests use fixed tables).
    pub fn with_backend(
        inner: Arc<dyn ReverseLookup>,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            inner,
            timeout,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// The canonicalized hostnames behind an address. Empty on timeout or
    /// resolver error.
    pub async fn hostnames(&self, ip: IpAddr) -> Vec<String> {
        let now = Instant::now();
        if let Some(entry) = self.cache.get(&ip) {
            if now.duration_since(entry.cached_at) < self.cache_ttl {
                trace!(ip = %ip, "Reverse DNS cache hit");
                return entry.hosts.clone();
            }
        }

        let hosts = match tokio::time::timeout(self.timeout, self.inner.lookup(ip)).await {
            Ok(Ok(hosts)) => hosts,
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "Reverse DNS lookup failed, treating as no match");
                Vec::new()
            }
            Err(_) => {
                debug!(ip = %ip, timeout_ms = self.timeout.as_millis() as u64,
                       "Reverse DNS lookup timed out, treating as no match");
                Vec::new()
            }
        };

        self.cache.insert(
            ip,
            CachedHosts {
                hosts: hosts.clone(),
                cached_at: now,
            },
        );
        hosts
    }

    /// Drop expired cache entries.
    pub fn clear_expired(&self) {
        let now = Instant::now();
        self.cache
            .retain(|_, v| now.duration_since(v.cached_at) < self.cache_ttl);
    }
}

/// Test backends
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Fixed IP → hostnames table
    pub(crate) struct TableReverseLookup {
        entries: HashMap<IpAddr, Vec<String>>,
    }

    impl TableReverseLookup {
        pub(crate) fn new(entries: &[(&str, &[&str])]) -> Self {
            Self {
                entries: entries
                    .iter()
                    .map(|(ip, hosts)| {
                        (
                            ip.parse().unwrap(),
                            hosts.iter().map(|h| h.to_string()).collect(),
                        )
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ReverseLookup for TableReverseLookup {
        async fn lookup(&self, ip: IpAddr) -> PalisadeResult<Vec<String>> {
            Ok(self.entries.get(&ip).cloned().unwrap_or_default())
        }
    }

    /// Backend that never answers within any deadline
    pub(crate) struct HangingReverseLookup;

    #[async_trait]
    impl ReverseLookup for HangingReverseLookup {
        async fn lookup(&self, _ip: IpAddr) -> PalisadeResult<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{HangingReverseLookup, TableReverseLookup};
    use super::*;

    #[tokio::test]
    async fn test_lookup_canonicalized_via_backend() {
        let backend = Arc::new(TableReverseLookup::new(&[(
            "203.0.113.9",
            &["relay.tor.example."],
        )]));
        let checker = ReverseDnsChecker::with_backend(
            backend,
            Duration::from_millis(200),
            Duration::from_secs(60),
        );

        let hosts = checker.hostnames("203.0.113.9".parse().unwrap()).await;
        assert_eq!(hosts, vec!["relay.tor.example".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_is_no_match() {
        let checker = ReverseDnsChecker::with_backend(
            Arc::new(HangingReverseLookup),
            Duration::from_millis(20),
            Duration::from_secs(60),
        );

        let start = Instant::now();
        let hosts = checker.hostnames("203.0.113.9".parse().unwrap()).await;
        assert!(hosts.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_negative_results_cached() {
        let checker = ReverseDnsChecker::with_backend(
            Arc::new(HangingReverseLookup),
            Duration::from_millis(20),
            Duration::from_secs(60),
        );

        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        checker.hostnames(ip).await;
        // Cached: the second call returns immediately without hitting the
        // hanging backend again.
        let start = Instant::now();
        let hosts = checker.hostnames(ip).await;
        assert!(hosts.is_empty());
        assert!(start.elapsed() < Duration::from_millis(15));
    }
}
