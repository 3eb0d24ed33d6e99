//! Palisade WAF engine
//!
//! A Web Application Firewall core that sits in front of an HTTP handler
//! chain. Each request is inspected in up to four phases — request headers,
//! request body, response headers, response body — against scored regex
//! rules, with a fixed-priority decision stack (IP blacklist, DNS blacklist,
//! rate limit, country whitelist, country blacklist) evaluated before any
//! rule runs. Rules contribute to a per-request anomaly score; crossing the
//! configured threshold blocks the request.
//!
//! # Example
//!
//! ```ignore
//! use palisade_config::Config;
//! use palisade_waf::{Waf, WafHandler};
//!
//! let config = Config::from_file("waf.json")?;
//! let provisioned = Waf::provision(config)?;
//! let handler = WafHandler::new(provisioned.waf);
//!
//! // Per request, with any hyper-style downstream handler:
//! // let response = handler.handle(req, peer_addr, downstream).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod blacklist;
pub mod engine;
pub mod extract;
pub mod geoip;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod reload;
pub mod request;
pub mod response;
pub mod revdns;
pub mod rules;
pub mod state;
pub mod tor;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Engine and handler integration
pub use engine::{ProvisionedWaf, Waf, WafWorkers};
pub use handler::WafHandler;

// Per-request state
pub use state::{BlockReason, InspectionPhase, MatchedRule, RequestLifecycle, WafState};

// Rule model
pub use rules::{Rule, RuleAction, RuleCache, RuleSet};

// Extraction
pub use extract::{RuleTarget, ValueExtractor};

// Reputation sets
pub use blacklist::{DnsSet, IpSet};

// GeoIP
pub use geoip::{CountryFilter, GeoDatabase, GeoOracle, MaxMindDatabase};

// Rate limiting
pub use rate_limit::{RateDecision, RateKey, RateLimiter};

// Request context
pub use request::{ClientIpPolicy, RequestContext};

// Metrics
pub use metrics::{MetricsSnapshot, WafMetrics, WAF_VERSION};

// Logging
pub use logging::{LogEntry, LogHandle, LogWorker};
