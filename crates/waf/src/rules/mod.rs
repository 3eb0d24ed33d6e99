//! Rule model and rule sets
//!
//! A [`Rule`] is a scored regex plus metadata, evaluated against one or more
//! request targets. A [`RuleSet`] is one immutable load generation: rules
//! bucketed by phase, each bucket sorted by `(priority, id)`. Generations are
//! swapped atomically on reload; requests in flight finish against the
//! generation they started with.

pub mod cache;
pub mod loader;

pub use cache::RuleCache;
pub use loader::load_rules;

use regex::Regex;
use std::sync::Arc;

use crate::extract::RuleTarget;
use crate::state::InspectionPhase;

/// What a matching rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Contribute score and record the match
    Log,
    /// Latch a block immediately
    Block,
    /// Latch a block and mark the request for challenge
    Challenge,
}

impl RuleAction {
    /// Parse the `mode` field of a rule file.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "log" => Some(Self::Log),
            "block" => Some(Self::Block),
            "challenge" => Some(Self::Challenge),
            _ => None,
        }
    }

    /// Whether a match latches the block regardless of score.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Block | Self::Challenge)
    }
}

/// One compiled rule; immutable after load
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique within a load generation
    pub id: String,
    pub phase: InspectionPhase,
    /// The regex source, kept for reload identity checks
    pub pattern: String,
    /// Shared compile; identical patterns share one entry
    pub compiled: Arc<Regex>,
    /// Targets checked in order; any match fires the rule
    pub targets: Vec<RuleTarget>,
    /// Score contributed on match
    pub score: u32,
    pub action: RuleAction,
    /// Logging only
    pub severity: String,
    /// Lower evaluates earlier; ties break by id
    pub priority: i32,
    /// Logging only
    pub description: String,
}

impl Rule {
    /// Whether any of the given values matches this rule's pattern.
    ///
    /// Semantics are "contains": unanchored, first match wins.
    pub fn matches(&self, value: &str) -> bool {
        self.compiled.is_match(value)
    }
}

/// One immutable load generation of rules
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Rules bucketed by phase, sorted `(priority, id)`
    phases: [Vec<Arc<Rule>>; 4],
    /// Monotonic generation counter for cross-generation logging
    pub generation: u64,
    /// Total rules across phases
    count: usize,
}

impl RuleSet {
    /// Build a generation from loaded rules.
    pub fn new(rules: Vec<Rule>, generation: u64) -> Self {
        let mut phases: [Vec<Arc<Rule>>; 4] = Default::default();
        let count = rules.len();
        for rule in rules {
            let idx = (rule.phase.number() - 1) as usize;
            phases[idx].push(Arc::new(rule));
        }
        for bucket in &mut phases {
            bucket.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        }
        Self {
            phases,
            generation,
            count,
        }
    }

    /// The ordered rules for one phase.
    pub fn phase(&self, phase: InspectionPhase) -> &[Arc<Rule>] {
        &self.phases[(phase.number() - 1) as usize]
    }

    /// Total number of rules across all phases.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The ids of every rule, in phase and evaluation order. Used to verify
    /// reload identity.
    pub fn rule_ids(&self) -> Vec<&str> {
        self.phases
            .iter()
            .flat_map(|bucket| bucket.iter().map(|r| r.id.as_str()))
            .collect()
    }
}
