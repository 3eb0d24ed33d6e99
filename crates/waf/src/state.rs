//! Per-request inspection state
//!
//! Every request owns one [`WafState`]. The struct is a set of latches: the
//! score only grows, `blocked` never clears, and the response is written at
//! most once. The request lifecycle itself is modeled by [`RequestLifecycle`]
//! so illegal transitions are unrepresentable in the handler.

use std::fmt;

/// A point in the request lifecycle at which rules may evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InspectionPhase {
    /// Phase 1: pre-routing request headers, IP, rate, geo
    RequestHeaders = 1,
    /// Phase 2: request body and arguments
    RequestBody = 2,
    /// Phase 3: response headers
    ResponseHeaders = 3,
    /// Phase 4: response body
    ResponseBody = 4,
}

impl InspectionPhase {
    /// All phases in evaluation order
    pub const ALL: [InspectionPhase; 4] = [
        Self::RequestHeaders,
        Self::RequestBody,
        Self::ResponseHeaders,
        Self::ResponseBody,
    ];

    /// The numeric phase used in rule files
    pub fn number(&self) -> u8 {
        *self as u8
    }

    /// Parse the numeric phase from a rule file
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::RequestHeaders),
            2 => Some(Self::RequestBody),
            3 => Some(Self::ResponseHeaders),
            4 => Some(Self::ResponseBody),
            _ => None,
        }
    }
}

impl fmt::Display for InspectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase{}", self.number())
    }
}

/// Lifecycle states of a request passing through the firewall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLifecycle {
    Init,
    Phase1,
    Phase2,
    Handler,
    Phase3,
    Phase4,
    Done,
    /// Terminal; reachable from any pre-emission state
    Blocked,
}

impl RequestLifecycle {
    /// Whether `next` is a legal successor of the current state.
    pub fn can_advance_to(&self, next: RequestLifecycle) -> bool {
        use RequestLifecycle::*;
        match (self, next) {
            (Init, Phase1) => true,
            (Phase1, Phase2) => true,
            (Phase2, Handler) => true,
            (Handler, Phase3) => true,
            (Phase3, Phase4) => true,
            (Phase4, Done) => true,
            // A latch may fire any time before the response is emitted.
            (Init | Phase1 | Phase2 | Handler | Phase3, Blocked) => true,
            _ => false,
        }
    }
}

/// One rule match, recorded for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    pub rule_id: String,
    pub phase: InspectionPhase,
    pub score: u32,
}

/// Why a request was blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    IpBlacklist,
    DnsBlacklist,
    RateLimit,
    CountryNotWhitelisted,
    CountryBlacklisted,
    /// A rule with a terminal action matched
    Rule(String),
    /// The accumulated anomaly score crossed the threshold
    AnomalyThreshold,
    /// A rule with the challenge action matched
    Challenge(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpBlacklist => write!(f, "ip_blacklist"),
            Self::DnsBlacklist => write!(f, "dns_blacklist"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::CountryNotWhitelisted => write!(f, "country_not_whitelisted"),
            Self::CountryBlacklisted => write!(f, "country_blacklisted"),
            Self::Rule(id) => write!(f, "rule:{id}"),
            Self::AnomalyThreshold => write!(f, "anomaly_threshold"),
            Self::Challenge(id) => write!(f, "challenge:{id}"),
        }
    }
}

/// Mutable per-request WAF state
#[derive(Debug, Default)]
pub struct WafState {
    /// Accumulated anomaly score; monotonic across phases
    total_score: u32,
    /// Block latch; never clears within a request
    blocked: bool,
    /// Status code to respond with; 0 means not set
    pub status_code: u16,
    /// Response-write latch
    response_written: bool,
    /// Ordered matches for logging
    pub matched_rules: Vec<MatchedRule>,
    /// Why the request was blocked, if it was
    pub block_reason: Option<BlockReason>,
    /// Ruleset generation observed by the first evaluated phase
    pub(crate) rule_generation: Option<u64>,
}

impl WafState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current accumulated score
    pub fn total_score(&self) -> u32 {
        self.total_score
    }

    /// Add a rule's score. The score never decreases.
    pub fn add_score(&mut self, score: u32) {
        self.total_score = self.total_score.saturating_add(score);
    }

    /// Whether the block latch has fired
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Latch the block. Later calls keep the first reason and status.
    pub fn block(&mut self, status_code: u16, reason: BlockReason) {
        if self.blocked {
            return;
        }
        self.blocked = true;
        self.status_code = status_code;
        self.block_reason = Some(reason);
    }

    /// Whether the response has already been written
    pub fn response_written(&self) -> bool {
        self.response_written
    }

    /// Mark the response as written. Returns `false` when it already was,
    /// in which case the caller must not write again.
    pub fn mark_response_written(&mut self) -> bool {
        if self.response_written {
            return false;
        }
        self.response_written = true;
        true
    }

    /// Record a rule match for logging.
    pub fn record_match(&mut self, rule_id: &str, phase: InspectionPhase, score: u32) {
        self.matched_rules.push(MatchedRule {
            rule_id: rule_id.to_string(),
            phase,
            score,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_numbers_roundtrip() {
        for phase in InspectionPhase::ALL {
            assert_eq!(InspectionPhase::from_number(phase.number()), Some(phase));
        }
        assert_eq!(InspectionPhase::from_number(0), None);
        assert_eq!(InspectionPhase::from_number(5), None);
    }

    #[test]
    fn test_lifecycle_happy_path() {
        use RequestLifecycle::*;
        let path = [Init, Phase1, Phase2, Handler, Phase3, Phase4, Done];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_lifecycle_block_reachability() {
        use RequestLifecycle::*;
        for state in [Init, Phase1, Phase2, Handler, Phase3] {
            assert!(state.can_advance_to(Blocked), "{state:?} must reach Blocked");
        }
        // Phase 4 cannot retract sent bytes.
        assert!(!Phase4.can_advance_to(Blocked));
        assert!(!Done.can_advance_to(Blocked));
        assert!(!Blocked.can_advance_to(Phase1));
    }

    #[test]
    fn test_score_monotonic() {
        let mut state = WafState::new();
        state.add_score(4);
        assert_eq!(state.total_score(), 4);
        state.add_score(0);
        assert_eq!(state.total_score(), 4);
        state.add_score(u32::MAX);
        assert_eq!(state.total_score(), u32::MAX);
    }

    #[test]
    fn test_block_latches_first_reason() {
        let mut state = WafState::new();
        state.block(403, BlockReason::IpBlacklist);
        assert!(state.is_blocked());
        assert_eq!(state.status_code, 403);

        state.block(429, BlockReason::RateLimit);
        assert_eq!(state.status_code, 403);
        assert_eq!(state.block_reason, Some(BlockReason::IpBlacklist));
    }

    #[test]
    fn test_response_written_exactly_once() {
        let mut state = WafState::new();
        assert!(state.mark_response_written());
        assert!(!state.mark_response_written());
        assert!(state.response_written());
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(BlockReason::IpBlacklist.to_string(), "ip_blacklist");
        assert_eq!(BlockReason::RateLimit.to_string(), "rate_limit");
        assert_eq!(
            BlockReason::CountryNotWhitelisted.to_string(),
            "country_not_whitelisted"
        );
        assert_eq!(BlockReason::Rule("r1".into()).to_string(), "rule:r1");
    }
}
