//! The condition engine.
//!
//! Applies a priority-ordered rule set to a batch. Each row is labeled by the
//! first rule, in priority order, whose combined mask covers it while it is
//! still unset. Rows that no rule claims stay unset, which is a normal
//! outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::check::CheckInput;
use crate::columns;
use crate::config::ConfigTree;
use crate::coverage::CoverageTracker;
use crate::frame;
use crate::mask::{self, Mask};
use crate::metrics::{EngineMetrics, METRICS};
use crate::rule::{Combine, FallbackLabel, RecordKind, Rule, RuleConfig};

/// Rows labeled per rule, in application order.
pub type RuleStats = IndexMap<String, usize>;

/// Per-run inputs shared by every check.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub processing_date: Option<i64>,
    pub entity_type: Option<String>,
    /// Masks keyed by check type name. A registered mask replaces the
    /// check's own computation.
    pub prebuilt_masks: HashMap<String, Mask>,
}

impl RuleContext {
    pub fn new(processing_date: Option<i64>, entity_type: Option<&str>) -> Self {
        Self {
            processing_date,
            entity_type: entity_type.map(str::to_string),
            prebuilt_masks: HashMap::new(),
        }
    }

    pub fn with_mask(mut self, name: impl Into<String>, mask: Mask) -> Self {
        self.prebuilt_masks.insert(name.into(), mask);
        self
    }
}

pub struct ConditionEngine {
    section: String,
    config: Arc<ConfigTree>,
    rules: Vec<Rule>,
    metrics: Arc<EngineMetrics>,
    coverage: Option<CoverageTracker>,
}

impl ConditionEngine {
    /// Loads and compiles the rules of `section`.
    pub fn new(config: Arc<ConfigTree>, section: &str) -> Self {
        let rules = config.rule_section(section);
        Self::from_rules(config, section, &rules)
    }

    pub fn from_rules(config: Arc<ConfigTree>, section: &str, rules: &[RuleConfig]) -> Self {
        let mut compiled: Vec<Rule> = rules.iter().map(|r| Rule::compile(r, &config)).collect();
        compiled.sort_by_key(|r| r.priority);
        info!(section, rules = compiled.len(), "Loaded rule section");

        Self {
            section: section.to_string(),
            config,
            rules: compiled,
            metrics: Arc::clone(&METRICS),
            coverage: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_coverage(mut self, coverage: CoverageTracker) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    /// Compiled rules in application order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.id().to_string()).collect()
    }

    /// Applies the rule set to the rows of `batch` whose `status_column` is
    /// unset. The status column is created when absent. With
    /// `update_no_status`, `ctx.prebuilt_masks["no_status"]` tracks the unset
    /// rows after every hit.
    pub fn apply_rules(
        &self,
        batch: &RecordBatch,
        status_column: &str,
        ctx: &mut RuleContext,
        kind: RecordKind,
        update_no_status: bool,
    ) -> Result<(RecordBatch, RuleStats)> {
        self.run(self.rules.iter(), batch, status_column, ctx, kind, update_no_status)
    }

    /// Applies terminal labels, in order, to the rows still unset after
    /// [`apply_rules`](Self::apply_rules).
    pub fn apply_fallbacks(
        &self,
        batch: &RecordBatch,
        status_column: &str,
        ctx: &mut RuleContext,
        kind: RecordKind,
        fallbacks: &[FallbackLabel],
    ) -> Result<(RecordBatch, RuleStats)> {
        let rules: Vec<Rule> = fallbacks.iter().map(FallbackLabel::to_rule).collect();
        self.run(rules.iter(), batch, status_column, ctx, kind, true)
    }

    fn run<'r>(
        &self,
        rules: impl Iterator<Item = &'r Rule>,
        batch: &RecordBatch,
        status_column: &str,
        ctx: &mut RuleContext,
        kind: RecordKind,
        update_no_status: bool,
    ) -> Result<(RecordBatch, RuleStats)> {
        let started = Instant::now();
        let mut batch = frame::ensure_text_column(batch, status_column)?;
        let mut status = frame::text_or_nulls(&batch, status_column);
        let mut unset = frame::unset_mask(&status);
        let mut stats = RuleStats::new();

        for rule in rules {
            if !rule.applies_to(kind) {
                debug!(rule = %rule.id(), kind = %kind, "Rule does not apply to record kind");
                continue;
            }
            let Some(status_value) = rule.status.as_deref() else {
                warn!(rule = %rule.id(), "Skipping rule with unresolved status value");
                continue;
            };
            if rule.checks.is_empty() {
                warn!(rule = %rule.id(), "Skipping rule with no checks");
                continue;
            }

            let Some(matched) = self.rule_mask(rule, &batch, status_column, ctx) else {
                debug!(rule = %rule.id(), "No check of the rule could be evaluated");
                continue;
            };
            let hits = mask::and(&matched, &unset);
            let count = mask::count(&hits);

            *stats.entry(rule.id().to_string()).or_insert(0) += count;
            self.metrics.record_rule_hits(rule.id(), count);
            if let Some(coverage) = &self.coverage {
                coverage.record(rule.id(), count);
            }
            if count > 0 {
                status = frame::fill_text(&status, &hits, status_value);
                let notes = frame::fill_text(
                    &frame::text_or_nulls(&batch, columns::MATCHED_NOTE),
                    &hits,
                    &rule.note,
                );
                batch = frame::put_column(&batch, status_column, Arc::new(status.clone()))?;
                batch = frame::put_column(&batch, columns::MATCHED_NOTE, Arc::new(notes))?;
                unset = mask::and_not(&unset, &hits);
                debug!(rule = %rule.id(), matched = count, status = status_value, "Rule matched");
            }

            if update_no_status {
                ctx.prebuilt_masks
                    .insert("no_status".to_string(), unset.clone());
            }
        }

        let remaining = mask::count(&unset);
        self.metrics
            .record_engine_run(started.elapsed().as_secs_f64(), remaining);
        info!(
            section = %self.section,
            kind = %kind,
            labeled = stats.values().sum::<usize>(),
            remaining,
            "Applied rules"
        );
        Ok((batch, stats))
    }

    fn rule_mask(
        &self,
        rule: &Rule,
        batch: &RecordBatch,
        status_column: &str,
        ctx: &RuleContext,
    ) -> Option<Mask> {
        let input = CheckInput {
            batch,
            status_column,
            processing_date: ctx.processing_date,
            entity_type: ctx.entity_type.as_deref(),
            config: &self.config,
            prebuilt: &ctx.prebuilt_masks,
        };
        let masks: Vec<Mask> = rule
            .checks
            .iter()
            .filter_map(|check| check.evaluate(&input))
            .collect();
        match rule.combine {
            Combine::And => mask::all_of(&masks),
            Combine::Or => mask::any_of(&masks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{BuiltinCheck, Check};
    use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use serde_json::json;

    fn engine(rules: serde_json::Value) -> ConditionEngine {
        let tree = Arc::new(ConfigTree::from_value(json!({
            "spx": { "done": "已完成" },
            "test_rules": { "conditions": rules }
        })));
        ConditionEngine::new(tree, "test_rules").with_metrics(Arc::new(EngineMetrics::new()))
    }

    fn batch(columns: Vec<(&str, ArrayRef)>) -> RecordBatch {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
            .collect();
        RecordBatch::try_new(
            Arc::new(Schema::new(fields)),
            columns.into_iter().map(|(_, a)| a).collect(),
        )
        .unwrap()
    }

    fn statuses(batch: &RecordBatch) -> Vec<Option<String>> {
        let s = frame::text(batch, columns::PO_STATUS).unwrap();
        (0..s.len())
            .map(|i| frame::value_at(&s, i).map(str::to_string))
            .collect()
    }

    fn scenario_batch() -> RecordBatch {
        batch(vec![
            (columns::PO_STATUS, Arc::new(StringArray::new_null(3)) as ArrayRef),
            (columns::ENTRY_QUANTITY, Arc::new(Float64Array::from(vec![10.0, 10.0, 10.0]))),
            (columns::RECEIVED_QUANTITY, Arc::new(Float64Array::from(vec![10.0, 7.0, 10.0]))),
            (columns::ENTRY_BILLED_AMOUNT, Arc::new(Float64Array::from(vec![0.0, 0.0, 25.0]))),
        ])
    }

    #[test]
    fn test_completed_scenario_labels_only_matching_row() {
        let e = engine(json!([{
            "priority": 1,
            "status_value": "已完成",
            "note": "qty matched, not billed",
            "combine": "and",
            "checks": [{ "type": "qty_matched" }, { "type": "not_billed" }]
        }]));
        let mut ctx = RuleContext::new(Some(202503), Some("SPX"));
        let (out, stats) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
            .unwrap();

        assert_eq!(statuses(&out), vec![Some("已完成".to_string()), None, None]);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["priority_1_已完成"], 1);

        let no_status = &ctx.prebuilt_masks["no_status"];
        assert_eq!(
            (0..3).map(|i| no_status.value(i)).collect::<Vec<_>>(),
            vec![false, true, true]
        );
        let notes = frame::text(&out, columns::MATCHED_NOTE).unwrap();
        assert_eq!(frame::value_at(&notes, 0), Some("qty matched, not billed"));
        assert!(notes.is_null(1));
    }

    #[test]
    fn test_lower_priority_number_wins() {
        let e = engine(json!([
            { "priority": 5, "status_value": "R2", "checks": [{ "type": "qty_matched" }] },
            { "priority": 1, "status_value": "R1", "checks": [{ "type": "qty_matched" }] }
        ]));
        let mut ctx = RuleContext::default();
        let (out, stats) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
            .unwrap();
        assert_eq!(
            statuses(&out),
            vec![Some("R1".to_string()), None, Some("R1".to_string())]
        );
        assert_eq!(stats.keys().collect::<Vec<_>>(), vec!["priority_1_R1", "priority_5_R2"]);
        assert_eq!(stats["priority_5_R2"], 0);
    }

    #[test]
    fn test_or_combine_and_apply_to() {
        let e = engine(json!([
            {
                "priority": 1, "status_value": "either", "combine": "or",
                "checks": [{ "type": "not_billed" }, { "type": "qty_matched" }]
            },
            {
                "priority": 0, "status_value": "pr only", "apply_to": ["PR"],
                "checks": [{ "type": "qty_matched" }]
            }
        ]));
        let mut ctx = RuleContext::default();
        let (out, stats) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
            .unwrap();
        assert_eq!(statuses(&out).iter().filter(|s| s.as_deref() == Some("either")).count(), 3);
        assert!(!stats.contains_key("priority_0_pr only"));
    }

    #[test]
    fn test_status_reference_resolution() {
        let e = engine(json!([
            { "priority": 1, "status_value_key": "spx.done", "checks": [{ "type": "qty_matched" }] },
            { "priority": 2, "status_value_key": "spx.nope", "checks": [{ "type": "qty_not_matched" }] }
        ]));
        let mut ctx = RuleContext::default();
        let (out, stats) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
            .unwrap();
        assert_eq!(stats["priority_1_已完成"], 2);
        assert_eq!(stats.len(), 1);
        assert_eq!(statuses(&out)[1], None);
    }

    #[test]
    fn test_inapplicable_rule_records_nothing() {
        let e = engine(json!([
            { "priority": 1, "status_value": "x", "checks": [{ "type": "in_closed_list" }] },
            { "priority": 2, "status_value": "y", "checks": [{ "type": "erm_le_date" }] }
        ]));
        let mut ctx = RuleContext::default();
        let input = scenario_batch();
        let (out, stats) = e
            .apply_rules(&input, columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
            .unwrap();
        assert!(stats.is_empty());
        assert_eq!(out, input);
    }

    #[test]
    fn test_wrong_length_prebuilt_mask_does_not_abort_run() {
        let e = engine(json!([
            { "priority": 1, "status_value": "已關單", "checks": [{ "type": "in_closed_list" }] },
            { "priority": 2, "status_value": "A", "checks": [{ "type": "qty_matched" }] }
        ]));
        let mut ctx = RuleContext::new(Some(202503), Some("SPX"))
            .with_mask("in_closed_list", Mask::from(vec![true, false]));
        let (out, stats) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
            .unwrap();

        assert_eq!(
            statuses(&out),
            vec![Some("A".to_string()), None, Some("A".to_string())]
        );
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["priority_2_A"], 2);
    }

    #[test]
    fn test_stale_no_status_is_refreshed_after_rule_without_hits() {
        let e = engine(json!([
            { "priority": 1, "status_value": "A", "checks": [{ "type": "erm_le_date" }] },
            { "priority": 2, "status_value": "B", "checks": [{ "type": "no_status" }] }
        ]));
        // Leftover from an earlier run: claims no row is unset.
        let mut ctx = RuleContext::new(Some(202503), Some("SPX"))
            .with_mask("no_status", Mask::from(vec![false, false, false]))
            .with_mask("erm_le_date", Mask::from(vec![false, false, false]));
        let (out, stats) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
            .unwrap();

        assert_eq!(stats["priority_1_A"], 0);
        assert_eq!(stats["priority_2_B"], 3);
        assert_eq!(statuses(&out), vec![Some("B".to_string()); 3]);
    }

    #[test]
    fn test_rerun_on_labeled_batch_is_identity() {
        let e = engine(json!([
            { "priority": 1, "status_value": "A", "checks": [{ "type": "qty_matched" }] },
            { "priority": 2, "status_value": "B", "checks": [{ "type": "no_status" }] }
        ]));
        let mut ctx = RuleContext::default();
        let (labeled, _) = e
            .apply_rules(&scenario_batch(), columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
            .unwrap();
        let (again, stats) = e
            .apply_rules(&labeled, columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
            .unwrap();
        assert_eq!(again, labeled);
        assert!(stats.values().all(|&c| c == 0));
    }

    #[test]
    fn test_fallbacks_only_touch_unset_rows() {
        let e = engine(json!([
            { "priority": 1, "status_value": "A", "checks": [{ "type": "qty_matched" }] }
        ]));
        let input = batch(vec![
            (columns::PO_STATUS, Arc::new(StringArray::new_null(3)) as ArrayRef),
            (columns::ENTRY_QUANTITY, Arc::new(Float64Array::from(vec![1.0, 1.0, 1.0]))),
            (columns::RECEIVED_QUANTITY, Arc::new(Float64Array::from(vec![1.0, 2.0, 2.0]))),
            (
                columns::DESCRIPTION_PERIOD,
                Arc::new(StringArray::from(vec!["100001,100002", "100001,100002", "202501,202502"])),
            ),
        ]);
        let mut ctx = RuleContext::default();
        let (out, _) = e
            .apply_rules(&input, columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
            .unwrap();
        let fallbacks = [
            FallbackLabel::new("格式錯誤，退單", "format error", Some(Check::Builtin(BuiltinCheck::FormatError))),
            FallbackLabel::new("其他", "other", None),
        ];
        let (out, stats) = e
            .apply_fallbacks(&out, columns::PO_STATUS, &mut ctx, RecordKind::Po, &fallbacks)
            .unwrap();

        assert_eq!(
            statuses(&out),
            vec![
                Some("A".to_string()),
                Some("格式錯誤，退單".to_string()),
                Some("其他".to_string())
            ]
        );
        assert_eq!(stats["fallback_格式錯誤，退單"], 1);
        assert_eq!(stats["fallback_其他"], 1);
    }

    #[test]
    fn test_missing_status_column_is_created() {
        let e = engine(json!([
            { "priority": 1, "status_value": "A", "checks": [{ "type": "qty_matched" }] }
        ]));
        let input = batch(vec![
            (columns::ENTRY_QUANTITY, Arc::new(Float64Array::from(vec![1.0])) as ArrayRef),
            (columns::RECEIVED_QUANTITY, Arc::new(Float64Array::from(vec![1.0]))),
        ]);
        let mut ctx = RuleContext::default();
        let (out, _) = e
            .apply_rules(&input, columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
            .unwrap();
        assert_eq!(statuses(&out), vec![Some("A".to_string())]);
    }
}
