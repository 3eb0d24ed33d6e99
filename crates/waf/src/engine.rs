//! The firewall engine
//!
//! [`Waf`] owns every shared piece of the firewall: the active rule
//! generation, the reputation sets, the geo oracle, the rate limiter, the
//! metrics, and the log pipeline. Reputation sets and rule generations are
//! behind [`ArcSwap`] so a reload swaps a fully built replacement while
//! requests in flight finish against the generation they loaded.
//!
//! Per request the engine exposes two operations: the fixed-priority
//! decision stack evaluated at the start of phase 1, and per-phase rule
//! evaluation with anomaly-score accumulation.

use arc_swap::ArcSwap;
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use palisade_common::{LogSeverity, PalisadeResult, RequestEvent};
use palisade_config::{Config, GeoFallbackBehavior};

use crate::blacklist::{self, DnsSet, IpSet};
use crate::extract::ValueExtractor;
use crate::geoip::{CountryFilter, GeoOracle};
use crate::logging::{LogEntry, LogHandle, LogWorker};
use crate::metrics::{MetricsSnapshot, WafMetrics};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::request::{ClientIpPolicy, RequestContext};
use crate::response::RATE_LIMIT_STATUS;
use crate::revdns::ReverseDnsChecker;
use crate::rules::{load_rules, RuleCache, RuleSet};
use crate::state::{BlockReason, InspectionPhase, WafState};

/// Threshold and reputation blocks always answer 403; only rule-action
/// blocks honor the configured status code.
const FORBIDDEN: u16 = 403;

/// The shared firewall engine
pub struct Waf {
    pub(crate) config: Config,
    rule_cache: RuleCache,
    rules: ArcSwap<RuleSet>,
    generation: AtomicU64,
    ip_blacklist: ArcSwap<IpSet>,
    dns_blacklist: ArcSwap<DnsSet>,
    /// Exit nodes merged on top of the file-based blacklist
    tor_exits: parking_lot::RwLock<Vec<IpNet>>,
    geo: Option<GeoOracle>,
    country_block: CountryFilter,
    country_whitelist: CountryFilter,
    rate_limiter: Option<Arc<RateLimiter>>,
    revdns: ReverseDnsChecker,
    extractor: ValueExtractor,
    client_ip_policy: ClientIpPolicy,
    metrics: Arc<WafMetrics>,
    log: LogHandle,
}

/// Background tasks owned by a provisioned firewall
pub struct WafWorkers {
    waf: Arc<Waf>,
    log_worker: LogWorker,
    tasks: Vec<JoinHandle<()>>,
}

impl WafWorkers {
    /// Abort the background tasks, report rule hit statistics, and drain
    /// the log pipeline within the deadline.
    pub async fn shutdown(self, deadline: Duration) {
        for task in self.tasks {
            task.abort();
        }
        self.waf.log_rule_hit_stats();
        self.log_worker.shutdown(deadline).await;
    }
}

/// A fully provisioned firewall: the engine plus its background tasks
pub struct ProvisionedWaf {
    pub waf: Arc<Waf>,
    pub workers: WafWorkers,
}

impl Waf {
    /// Provision the firewall: load every artifact, start the log worker,
    /// the rate limiter GC, the file watchers, and the TOR refresher.
    ///
    /// Must be called within a tokio runtime.
    pub fn provision(config: Config) -> PalisadeResult<ProvisionedWaf> {
        let (waf, log_worker) = Self::build(config)?;

        let mut tasks = Vec::new();
        if let Some(limiter) = &waf.rate_limiter {
            tasks.push(limiter.spawn_cleanup());
        }
        tasks.extend(crate::reload::spawn_watchers(Arc::clone(&waf)));
        if waf.config.tor.enabled {
            tasks.push(crate::tor::spawn_refresh(Arc::clone(&waf)));
        }

        info!(version = crate::metrics::WAF_VERSION, "WAF provisioned");
        Ok(ProvisionedWaf {
            waf: Arc::clone(&waf),
            workers: WafWorkers {
                waf,
                log_worker,
                tasks,
            },
        })
    }

    /// Build the engine without spawning watchers or refreshers. Used by
    /// [`Waf::provision`] and directly by tests.
    pub(crate) fn build(config: Config) -> PalisadeResult<(Arc<Self>, LogWorker)> {
        let metrics = Arc::new(WafMetrics::new());
        let (log, log_worker) = LogWorker::spawn(
            config.log_buffer,
            config.log_severity,
            config.log_json,
            config.log_file.clone(),
            Arc::clone(&metrics),
        );

        let rule_cache = RuleCache::new();
        let rules = if config.rule_files.is_empty() {
            warn!("No rule files specified, WAF will run without rules");
            RuleSet::default()
        } else {
            load_rules(&config.rule_files, &rule_cache, 1)?
        };

        let ip_blacklist = match &config.ip_blacklist_file {
            Some(path) => blacklist::load_ip_blacklist(path)?,
            None => IpSet::new(),
        };
        let dns_blacklist = match &config.dns_blacklist_file {
            Some(path) => blacklist::load_dns_blacklist(path)?,
            None => DnsSet::new(),
        };

        let cache_ttl = Duration::from_secs(config.geo_ip_cache_ttl_secs);
        let geo = match config.geoip_db_path() {
            Some(path) if path.exists() => Some(GeoOracle::open(path, cache_ttl)?),
            Some(path) => {
                warn!(path = %path.display(),
                      "GeoIP database not found, country filtering disabled");
                None
            }
            None => None,
        };

        let rate_limiter = if config.rate_limiting_enabled() {
            Some(Arc::new(RateLimiter::new(&config.rate_limit)?))
        } else {
            info!("Rate limiting is disabled");
            None
        };

        let revdns = ReverseDnsChecker::new(
            Duration::from_millis(config.reverse_dns_timeout_ms),
            cache_ttl,
        );

        let waf = Arc::new(Self {
            rule_cache,
            rules: ArcSwap::from_pointee(rules),
            generation: AtomicU64::new(1),
            ip_blacklist: ArcSwap::from_pointee(ip_blacklist),
            dns_blacklist: ArcSwap::from_pointee(dns_blacklist),
            tor_exits: parking_lot::RwLock::new(Vec::new()),
            geo,
            country_block: CountryFilter::from_config(&config.country_block),
            country_whitelist: CountryFilter::from_config(&config.country_whitelist),
            rate_limiter,
            revdns,
            extractor: ValueExtractor::new(config.redact_sensitive_data, &config.sensitive_fields),
            client_ip_policy: ClientIpPolicy::new(&config.trusted_proxies),
            metrics: Arc::clone(&metrics),
            log,
            config,
        });
        Ok((waf, log_worker))
    }

    /// Derive the client address for a request.
    pub fn client_ip(&self, peer: SocketAddr, headers: &http::HeaderMap) -> IpAddr {
        self.client_ip_policy.client_ip(peer, headers)
    }

    /// The active rule generation.
    pub fn current_rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    pub fn metrics(&self) -> &Arc<WafMetrics> {
        &self.metrics
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    /// Point-in-time metrics snapshot including rate limiter totals.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let (rate_total, rate_blocked) = self
            .rate_limiter
            .as_ref()
            .map(|l| (l.total_requests(), l.blocked_requests()))
            .unwrap_or((0, 0));
        self.metrics.snapshot(rate_total, rate_blocked)
    }

    // ========================================================================
    // Decision stack
    // ========================================================================

    /// Evaluate the fixed-priority decision stack at the start of phase 1.
    ///
    /// Order: IP blacklist, DNS blacklist, rate limit, country whitelist,
    /// country blacklist. The first check that blocks short-circuits the
    /// rest; rules never run for a request blocked here.
    pub async fn run_decision_stack(&self, ctx: &RequestContext, state: &mut WafState) {
        let ip = ctx.client_ip;

        if self.ip_blacklist.load().contains(ip) {
            self.metrics.record_ip_blacklist_hit();
            self.block(state, ctx, FORBIDDEN, BlockReason::IpBlacklist);
            return;
        }

        let dns_blacklist = self.dns_blacklist.load();
        if !dns_blacklist.is_empty() {
            let hostnames = self.revdns.hostnames(ip).await;
            if let Some(hit) = hostnames.iter().find(|h| dns_blacklist.contains(h)) {
                self.metrics.record_dns_blacklist_hit();
                self.log.emit(
                    LogEntry::new(LogSeverity::Debug, "dns_blacklist_match")
                        .field("client_ip", ip.to_string())
                        .field("hostname", hit.clone()),
                );
                self.block(state, ctx, FORBIDDEN, BlockReason::DnsBlacklist);
                return;
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            if let Some(bucket) = limiter.scope_path(&ctx.path) {
                if limiter.check(ip, bucket) == RateDecision::Limited {
                    self.block(state, ctx, RATE_LIMIT_STATUS, BlockReason::RateLimit);
                    return;
                }
            }
        }

        self.check_country(ctx, state);
    }

    /// Country whitelist then blacklist. The whitelist strictly dominates:
    /// a whitelisted country is never consulted against the blacklist.
    fn check_country(&self, ctx: &RequestContext, state: &mut WafState) {
        let whitelist_active = self.country_whitelist.is_enabled() && !self.country_whitelist.is_empty();
        let blacklist_active = self.country_block.is_enabled();
        if !whitelist_active && !blacklist_active {
            return;
        }

        let Some(geo) = &self.geo else {
            return;
        };

        let country = match geo.country(ctx.client_ip) {
            Ok(country) => country,
            Err(e) => {
                warn!(client_ip = %ctx.client_ip, error = %e, "GeoIP lookup failed");
                match self.config.geo_ip_lookup_fallback_behavior {
                    GeoFallbackBehavior::DefaultAllow => return,
                    GeoFallbackBehavior::DefaultDeny => {
                        self.metrics.record_geoip_blocked();
                        let reason = if whitelist_active {
                            BlockReason::CountryNotWhitelisted
                        } else {
                            BlockReason::CountryBlacklisted
                        };
                        self.block(state, ctx, FORBIDDEN, reason);
                        return;
                    }
                }
            }
        };

        if let Some(code) = &country {
            self.metrics.record_geoip_country(code);
        }

        if whitelist_active {
            let allowed = country
                .as_deref()
                .map(|code| self.country_whitelist.contains(code))
                .unwrap_or(false);
            if !allowed {
                self.metrics.record_geoip_blocked();
                self.block(state, ctx, FORBIDDEN, BlockReason::CountryNotWhitelisted);
            }
            // Whitelisted (or blocked): the blacklist never fires.
            return;
        }

        if blacklist_active {
            if let Some(code) = country.as_deref() {
                if self.country_block.contains(code) {
                    self.metrics.record_geoip_blocked();
                    self.block(state, ctx, FORBIDDEN, BlockReason::CountryBlacklisted);
                }
            }
        }
    }

    // ========================================================================
    // Phase evaluation
    // ========================================================================

    /// Evaluate one phase's rules against the request.
    ///
    /// Rules run in `(priority, id)` order. A rule matches when any of its
    /// targets yields a value its pattern finds. Matching adds the rule's
    /// score; a terminal action or a crossed threshold latches the block and
    /// halts the phase.
    pub fn evaluate_phase(
        &self,
        phase: InspectionPhase,
        ctx: &RequestContext,
        state: &mut WafState,
    ) {
        if state.is_blocked() {
            return;
        }

        let rules = self.rules.load_full();
        match state.rule_generation {
            None => state.rule_generation = Some(rules.generation),
            Some(seen) if seen != rules.generation => {
                self.log.emit(
                    LogEntry::new(LogSeverity::Debug, RequestEvent::GenerationCrossed.to_string())
                        .field("previous", seen)
                        .field("current", rules.generation),
                );
                state.rule_generation = Some(rules.generation);
            }
            _ => {}
        }

        for rule in rules.phase(phase) {
            let mut matched: Option<(String, String)> = None;
            for target in &rule.targets {
                let extraction = self.extractor.extract(target, ctx, phase);
                if !extraction.available {
                    self.log.emit(
                        LogEntry::new(
                            LogSeverity::Debug,
                            RequestEvent::ExtractionUnavailable.to_string(),
                        )
                        .field("rule_id", rule.id.clone())
                        .field("target", target.to_string()),
                    );
                    continue;
                }
                if rule.matches(&extraction.value) {
                    let logged = self.extractor.loggable(target, &extraction.value);
                    matched = Some((target.to_string(), logged));
                    break;
                }
            }

            let Some((target, logged_value)) = matched else {
                continue;
            };

            self.metrics.record_rule_hit(&rule.id, phase);
            state.add_score(rule.score);
            state.record_match(&rule.id, phase, rule.score);
            self.log.emit(
                LogEntry::new(LogSeverity::Info, "rule_match")
                    .field("rule_id", rule.id.clone())
                    .field("phase", rule.phase.number())
                    .field("target", target)
                    .field("value", logged_value)
                    .field("score", rule.score)
                    .field("severity", rule.severity.clone())
                    .field("description", rule.description.clone())
                    .field("total_score", state.total_score()),
            );

            match rule.action {
                crate::rules::RuleAction::Block => {
                    self.block(
                        state,
                        ctx,
                        self.config.block_status_code,
                        BlockReason::Rule(rule.id.clone()),
                    );
                    return;
                }
                crate::rules::RuleAction::Challenge => {
                    self.block(
                        state,
                        ctx,
                        self.config.block_status_code,
                        BlockReason::Challenge(rule.id.clone()),
                    );
                    return;
                }
                crate::rules::RuleAction::Log => {
                    if i64::from(state.total_score()) >= self.config.anomaly_threshold {
                        self.block(state, ctx, FORBIDDEN, BlockReason::AnomalyThreshold);
                        return;
                    }
                }
            }
        }
    }

    /// Latch the block on the state and record it.
    fn block(&self, state: &mut WafState, ctx: &RequestContext, status: u16, reason: BlockReason) {
        let first = !state.is_blocked();
        state.block(status, reason);
        if !first {
            return;
        }
        let reason = state
            .block_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default();
        self.log.emit(
            LogEntry::new(LogSeverity::Warn, "request_blocked")
                .field("reason", reason)
                .field("status", state.status_code)
                .field("client_ip", ctx.client_ip.to_string())
                .field("method", ctx.method.clone())
                .field("path", ctx.path.clone())
                .field("total_score", state.total_score()),
        );
    }

    // ========================================================================
    // Reload operations
    // ========================================================================

    /// Rebuild the rule set from the configured files and swap it in.
    /// On failure the previous generation stays active.
    pub fn reload_rules(&self) -> PalisadeResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let new_rules = load_rules(&self.config.rule_files, &self.rule_cache, generation)?;
        self.rules.store(Arc::new(new_rules));
        info!(generation, "WAF rules reloaded");
        Ok(())
    }

    /// Rebuild the IP blacklist (file entries plus merged TOR exits).
    pub fn reload_ip_blacklist(&self) -> PalisadeResult<()> {
        let Some(path) = &self.config.ip_blacklist_file else {
            return Ok(());
        };
        let mut set = blacklist::load_ip_blacklist(path)?;
        for net in self.tor_exits.read().iter() {
            set.insert(*net);
        }
        self.ip_blacklist.store(Arc::new(set));
        info!(file = %path.display(), "IP blacklist reloaded");
        Ok(())
    }

    /// Rebuild the DNS blacklist from its file.
    pub fn reload_dns_blacklist(&self) -> PalisadeResult<()> {
        let Some(path) = &self.config.dns_blacklist_file else {
            return Ok(());
        };
        let set = blacklist::load_dns_blacklist(path)?;
        self.dns_blacklist.store(Arc::new(set));
        info!(file = %path.display(), "DNS blacklist reloaded");
        Ok(())
    }

    /// Merge a fresh TOR exit list into the active IP blacklist.
    pub fn merge_tor_exits(&self, exits: Vec<IpNet>) {
        let count = exits.len();
        *self.tor_exits.write() = exits;

        let current = self.ip_blacklist.load_full();
        let mut merged = (*current).clone();
        for net in self.tor_exits.read().iter() {
            merged.insert(*net);
        }
        self.ip_blacklist.store(Arc::new(merged));
        info!(exits = count, "Merged TOR exit list into IP blacklist");
    }

    /// Log per-rule hit statistics; called on shutdown.
    pub fn log_rule_hit_stats(&self) {
        let stats = self.metrics.rule_hit_stats();
        info!(rules = stats.len(), "Rule hit statistics");
        for (rule_id, hits) in stats {
            info!(rule_id = %rule_id, hits, "Rule hit");
        }
    }

    /// Test seam: swap backends that normally require external resources.
    #[cfg(test)]
    pub(crate) fn for_tests(
        config: Config,
        geo: Option<GeoOracle>,
        revdns: ReverseDnsChecker,
    ) -> PalisadeResult<(Arc<Self>, LogWorker)> {
        let (waf, worker) = Self::build(config)?;
        let mut inner = Arc::into_inner(waf).expect("fresh engine is uniquely owned");
        inner.geo = geo;
        inner.revdns = revdns;
        Ok((Arc::new(inner), worker))
    }
}
