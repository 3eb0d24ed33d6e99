//! GeoIP oracle
//!
//! Wraps a MaxMind country database behind the [`GeoDatabase`] trait with a
//! per-IP cache. The oracle only answers "which country is this address in";
//! policy (whitelist dominance, fallback behavior) lives in the decision
//! stack.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use palisade_common::{PalisadeError, PalisadeResult};
use palisade_config::CountryAccessFilter;

/// Backend lookup from IP to ISO country code
pub trait GeoDatabase: Send + Sync {
    /// Look up the country code for an address. `Ok(None)` means the
    /// address is simply not in the database.
    fn lookup(&self, ip: IpAddr) -> PalisadeResult<Option<String>>;
}

/// MaxMind GeoLite2/GeoIP2 database backend
pub struct MaxMindDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindDatabase {
    /// Open a MaxMind database file.
    pub fn open(path: impl AsRef<Path>) -> PalisadeResult<Self> {
        let path = path.as_ref();
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| PalisadeError::GeoLookup {
            message: format!("failed to open MaxMind database {}: {e}", path.display()),
        })?;

        debug!(path = %path.display(), "Opened MaxMind GeoIP database");
        Ok(Self { reader })
    }
}

impl GeoDatabase for MaxMindDatabase {
    fn lookup(&self, ip: IpAddr) -> PalisadeResult<Option<String>> {
        let result = self
            .reader
            .lookup::<maxminddb::geoip2::Country>(ip)
            .map_err(|e| PalisadeError::GeoLookup {
                message: e.to_string(),
            });
        match result {
            Ok(Some(record)) => {
                let country_code = record
                    .country
                    .and_then(|c| c.iso_code)
                    .map(|s| s.to_string());
                trace!(ip = %ip, country = ?country_code, "MaxMind lookup");
                Ok(country_code)
            }
            Ok(None) => {
                trace!(ip = %ip, "IP not found in MaxMind database");
                Ok(None)
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "MaxMind decode error");
                Err(PalisadeError::GeoLookup {
                    message: e.to_string(),
                })
            }
        }
    }
}

struct CachedCountry {
    country_code: Option<String>,
    cached_at: Instant,
}

/// IP → country oracle with a TTL cache
pub struct GeoOracle {
    database: RwLock<Arc<dyn GeoDatabase>>,
    cache: DashMap<IpAddr, CachedCountry>,
    cache_ttl: Duration,
}

impl GeoOracle {
    /// Open the oracle over a MaxMind database file.
    pub fn open(path: impl AsRef<Path>, cache_ttl: Duration) -> PalisadeResult<Self> {
        let database = MaxMindDatabase::open(path)?;
        Ok(Self::with_database(Arc::new(database), cache_ttl))
    }

    /// Build the oracle over any backend (tests use in-memory tables).
    pub fn with_database(database: Arc<dyn GeoDatabase>, cache_ttl: Duration) -> Self {
        Self {
            database: RwLock::new(database),
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// Resolve the country for an address, consulting the cache first.
    pub fn country(&self, ip: IpAddr) -> PalisadeResult<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.cache.get(&ip) {
            if now.duration_since(entry.cached_at) < self.cache_ttl {
                trace!(ip = %ip, country = ?entry.country_code, "Geo cache hit");
                return Ok(entry.country_code.clone());
            }
        }

        let database = self.database.read().clone();
        let country_code = database.lookup(ip)?;
        self.cache.insert(
            ip,
            CachedCountry {
                country_code: country_code.clone(),
                cached_at: now,
            },
        );
        Ok(country_code)
    }

    /// Swap the backing database and clear the cache.
    pub fn replace_database(&self, database: Arc<dyn GeoDatabase>) {
        *self.database.write() = database;
        self.cache.clear();
    }

    /// Drop expired cache entries.
    pub fn clear_expired(&self) {
        let now = Instant::now();
        self.cache
            .retain(|_, v| now.duration_since(v.cached_at) < self.cache_ttl);
    }

    /// (total, still valid) cache entries.
    pub fn cache_stats(&self) -> (usize, usize) {
        let now = Instant::now();
        let total = self.cache.len();
        let valid = self
            .cache
            .iter()
            .filter(|e| now.duration_since(e.cached_at) < self.cache_ttl)
            .count();
        (total, valid)
    }
}

/// One country list of the decision stack (blacklist or whitelist)
#[derive(Debug, Clone, Default)]
pub struct CountryFilter {
    enabled: bool,
    countries: HashSet<String>,
}

impl CountryFilter {
    pub fn from_config(config: &CountryAccessFilter) -> Self {
        Self {
            enabled: config.enabled,
            countries: config
                .country_list
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }

    pub fn contains(&self, country_code: &str) -> bool {
        self.countries.contains(&country_code.to_ascii_uppercase())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FailingDatabase, TableDatabase};
    use super::*;

    #[test]
    fn test_lookup_and_cache() {
        let db = Arc::new(TableDatabase::new(&[("203.0.113.1", "BR")]));
        let oracle = GeoOracle::with_database(db.clone(), Duration::from_secs(60));

        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        assert_eq!(oracle.country(ip).unwrap(), Some("BR".to_string()));
        assert_eq!(oracle.country(ip).unwrap(), Some("BR".to_string()));
        // Second call answered from cache.
        assert_eq!(db.lookup_count(), 1);
    }

    #[test]
    fn test_unknown_ip_is_none_not_error() {
        let db = Arc::new(TableDatabase::new(&[]));
        let oracle = GeoOracle::with_database(db, Duration::from_secs(60));
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        assert_eq!(oracle.country(ip).unwrap(), None);
    }

    #[test]
    fn test_cache_expiry() {
        let db = Arc::new(TableDatabase::new(&[("203.0.113.1", "US")]));
        let oracle = GeoOracle::with_database(db.clone(), Duration::from_millis(10));

        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        oracle.country(ip).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        oracle.country(ip).unwrap();
        assert_eq!(db.lookup_count(), 2);

        oracle.clear_expired();
        let (total, valid) = oracle.cache_stats();
        assert_eq!(total, 1);
        assert_eq!(valid, 1);
    }

    #[test]
    fn test_oracle_failure_propagates() {
        let oracle = GeoOracle::with_database(Arc::new(FailingDatabase), Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        assert!(oracle.country(ip).is_err());
    }

    #[test]
    fn test_replace_database_clears_cache() {
        let db = Arc::new(TableDatabase::new(&[("203.0.113.1", "US")]));
        let oracle = GeoOracle::with_database(db, Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        oracle.country(ip).unwrap();

        let new_db = Arc::new(TableDatabase::new(&[("203.0.113.1", "DE")]));
        oracle.replace_database(new_db);
        assert_eq!(oracle.country(ip).unwrap(), Some("DE".to_string()));
    }

    #[test]
    fn test_country_filter_case_insensitive() {
        let filter = CountryFilter::from_config(&CountryAccessFilter {
            enabled: true,
            country_list: vec!["br".to_string(), "US".to_string()],
            geoip_db_path: None,
        });
        assert!(filter.is_enabled());
        assert!(filter.contains("BR"));
        assert!(filter.contains("us"));
        assert!(!filter.contains("DE"));
    }
}
