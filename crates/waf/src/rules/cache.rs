//! Shared compiled-pattern cache
//!
//! Rules frequently repeat patterns across files and reload generations.
//! The cache maps pattern source to one shared compile: many readers, rare
//! writers (load and reload only). Compilation goes through `RegexBuilder`
//! with size limits so a pathological pattern cannot exhaust memory.

use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Compiled-regex size ceilings
const MAX_COMPILED_SIZE: usize = 1024 * 1024;
const MAX_PATTERN_LENGTH: usize = 2048;

/// Thread-safe pattern-source → compiled-regex cache
#[derive(Debug, Default)]
pub struct RuleCache {
    patterns: RwLock<HashMap<String, Arc<Regex>>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a compiled pattern, returning whether it was a cache hit.
    pub fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        self.patterns.read().get(pattern).cloned()
    }

    /// Compile a pattern through the cache. Identical sources always yield
    /// the same `Arc`.
    pub fn compile(&self, pattern: &str) -> Result<Arc<Regex>, String> {
        if let Some(compiled) = self.get(pattern) {
            return Ok(compiled);
        }

        if pattern.len() > MAX_PATTERN_LENGTH {
            return Err(format!(
                "pattern exceeds maximum length of {MAX_PATTERN_LENGTH} bytes"
            ));
        }

        let compiled = Arc::new(
            regex::RegexBuilder::new(pattern)
                .size_limit(MAX_COMPILED_SIZE)
                .dfa_size_limit(MAX_COMPILED_SIZE)
                .build()
                .map_err(|e| format!("failed to compile regex: {e}"))?,
        );

        // A racing writer may have inserted meanwhile; keep the first entry
        // so every caller ends up with the same Arc.
        let mut patterns = self.patterns.write();
        let entry = patterns
            .entry(pattern.to_string())
            .or_insert_with(|| compiled);
        Ok(entry.clone())
    }

    /// Number of distinct cached patterns.
    pub fn len(&self) -> usize {
        self.patterns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.read().is_empty()
    }
}
