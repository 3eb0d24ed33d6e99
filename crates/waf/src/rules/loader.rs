//! Rule file loading
//!
//! Rule files are JSON arrays of rule objects. A file that fails to parse
//! entirely fails the whole load, naming the file; individual invalid rules
//! are warnings and the generation still loads without them. Patterns
//! compile through the shared [`RuleCache`] so identical sources share one
//! compile across rules and generations.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use palisade_common::{PalisadeError, PalisadeResult};

use crate::extract::RuleTarget;
use crate::rules::{Rule, RuleAction, RuleCache, RuleSet};
use crate::state::InspectionPhase;

/// Wire format of one rule object
#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    id: String,
    phase: u8,
    pattern: String,
    targets: Vec<String>,
    #[serde(default)]
    severity: String,
    score: u32,
    /// Maps to the rule action
    mode: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: i32,
}

/// Load rule files into a fresh [`RuleSet`] generation.
pub fn load_rules(
    paths: &[PathBuf],
    cache: &RuleCache,
    generation: u64,
) -> PalisadeResult<RuleSet> {
    let mut rules = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut skipped = 0usize;

    for path in paths {
        let raw_rules = parse_file(path)?;
        for raw in raw_rules {
            match build_rule(raw, cache, &mut seen_ids) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping invalid rule");
                    skipped += 1;
                }
            }
        }
    }

    info!(
        loaded = rules.len(),
        skipped,
        generation,
        "Loaded WAF rules"
    );
    Ok(RuleSet::new(rules, generation))
}

fn parse_file(path: &Path) -> PalisadeResult<Vec<RawRule>> {
    let raw = std::fs::read_to_string(path).map_err(|e| PalisadeError::Io {
        message: format!("failed to read rule file: {e}"),
        path: Some(path.to_path_buf()),
        source: e,
    })?;

    serde_json::from_str(&raw).map_err(|e| PalisadeError::RuleFile {
        file: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn build_rule(
    raw: RawRule,
    cache: &RuleCache,
    seen_ids: &mut HashSet<String>,
) -> PalisadeResult<Rule> {
    if raw.id.is_empty() {
        return Err(PalisadeError::rule_invalid("<missing>", "empty rule id"));
    }
    if !seen_ids.insert(raw.id.clone()) {
        return Err(PalisadeError::rule_invalid(
            raw.id.as_str(),
            "duplicate rule id within generation",
        ));
    }

    let phase = InspectionPhase::from_number(raw.phase).ok_or_else(|| {
        PalisadeError::rule_invalid(raw.id.as_str(), format!("phase {} out of range 1..4", raw.phase))
    })?;

    let action = RuleAction::parse(&raw.mode)
        .ok_or_else(|| PalisadeError::rule_invalid(raw.id.as_str(), format!("unknown mode {:?}", raw.mode)))?;

    if raw.targets.is_empty() {
        return Err(PalisadeError::rule_invalid(raw.id.as_str(), "no targets"));
    }

    let mut targets = Vec::with_capacity(raw.targets.len());
    for expr in &raw.targets {
        let target: RuleTarget = expr
            .parse()
            .map_err(|e: PalisadeError| PalisadeError::rule_invalid(raw.id.as_str(), e.to_string()))?;
        targets.push(target);
    }

    let compiled = cache
        .compile(&raw.pattern)
        .map_err(|e| PalisadeError::rule_invalid(raw.id.as_str(), e))?;

    Ok(Rule {
        id: raw.id,
        phase,
        pattern: raw.pattern,
        compiled,
        targets,
        score: raw.score,
        action,
        severity: raw.severity,
        priority: raw.priority,
        description: raw.description,
    })
}
