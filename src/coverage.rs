//! Rule coverage tracking
//!
//! Accumulates per-rule hit counts over many engine runs so configured rules
//! that never label a row can be spotted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Tracks how many rows each rule has labeled
#[derive(Clone, Default)]
pub struct CoverageTracker {
    hits: Arc<Mutex<HashMap<String, u64>>>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one evaluation of a rule and the rows it labeled
    pub fn record(&self, rule_id: &str, hits: usize) {
        let mut map = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        *map.entry(rule_id.to_string()).or_insert(0) += hits as u64;
    }

    pub fn hits(&self, rule_id: &str) -> u64 {
        let map = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(rule_id).copied().unwrap_or(0)
    }

    /// Coverage of `rule_ids`. A rule counts as covered once it has labeled
    /// at least one row.
    pub fn report(&self, rule_ids: &[String]) -> CoverageReport {
        let map = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let uncovered: Vec<String> = rule_ids
            .iter()
            .filter(|id| map.get(*id).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();
        let covered = rule_ids.len() - uncovered.len();

        CoverageReport {
            total: rule_ids.len(),
            covered,
            uncovered,
            coverage_percentage: if rule_ids.is_empty() {
                0.0
            } else {
                covered as f64 / rule_ids.len() as f64 * 100.0
            },
            hit_counts: map.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub total: usize,
    pub covered: usize,
    pub uncovered: Vec<String>,
    pub coverage_percentage: f64,
    pub hit_counts: HashMap<String, u64>,
}

impl CoverageReport {
    /// Human-readable report, one line per uncovered rule.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Rule coverage: {}/{} ({:.1}%)\n",
            self.covered, self.total, self.coverage_percentage
        );
        for rule_id in &self.uncovered {
            out.push_str(&format!("  never matched: {rule_id}\n"));
        }
        out
    }
}
