use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use accrual_rules::columns;
use accrual_rules::frame;
use accrual_rules::{
    ConditionEngine, ConfigTree, CoverageTracker, EngineMetrics, Mask, RecordKind, RuleContext,
};
use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use config::FileFormat;

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

fn statuses(batch: &RecordBatch, column: &str) -> Vec<Option<String>> {
    let values = frame::text(batch, column).unwrap();
    (0..values.len())
        .map(|row| frame::value_at(&values, row).map(str::to_string))
        .collect()
}

fn example_config() -> Arc<ConfigTree> {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "config", "accrual_rules.example.toml"]
        .iter()
        .collect();
    Arc::new(ConfigTree::from_file(path).unwrap())
}

const COMPLETED_RULES: &str = r#"
[spx]
done = "已完成"

[[accrual.conditions]]
priority = 1
status_value_key = "spx.done"
note = "received in full, nothing billed"
checks = [{ type = "qty_matched" }, { type = "not_billed" }]
"#;

#[test]
fn test_completed_scenario_from_toml() {
    let tree = Arc::new(ConfigTree::from_str_with_format(COMPLETED_RULES, FileFormat::Toml).unwrap());
    let engine = ConditionEngine::new(tree, "accrual").with_metrics(Arc::new(EngineMetrics::new()));

    let data = batch(vec![
        (columns::PO_ID, Arc::new(StringArray::from(vec!["A", "B", "C"])) as ArrayRef),
        (columns::ENTRY_QUANTITY, Arc::new(Float64Array::from(vec![10.0, 10.0, 10.0]))),
        (columns::RECEIVED_QUANTITY, Arc::new(Float64Array::from(vec![10.0, 8.0, 10.0]))),
        (columns::ENTRY_BILLED_AMOUNT, Arc::new(Float64Array::from(vec![0.0, 0.0, 50.0]))),
    ]);

    let mut ctx = RuleContext::new(Some(202503), Some("SPX"));
    let (out, stats) = engine
        .apply_rules(&data, columns::PO_STATUS, &mut ctx, RecordKind::Po, true)
        .unwrap();

    assert_eq!(
        statuses(&out, columns::PO_STATUS),
        vec![Some("已完成".to_string()), None, None]
    );
    assert_eq!(stats.len(), 1);
    assert_eq!(stats.get("priority_1_已完成"), Some(&1));

    let no_status = &ctx.prebuilt_masks["no_status"];
    assert_eq!(
        (0..3).map(|i| no_status.value(i)).collect::<Vec<_>>(),
        vec![false, true, true]
    );
    assert_eq!(
        statuses(&out, columns::MATCHED_NOTE),
        vec![Some("received in full, nothing billed".to_string()), None, None]
    );
}

#[test]
fn test_example_configuration_validates() {
    let config = example_config();

    assert!(config.validate_rule_section("erm_status_rules").is_empty());

    let stage1 = config.validate_rule_section("status_stage1_rules");
    assert_eq!(stage1.len(), 2);
    assert!(stage1.iter().all(|issue| issue.message.contains("prebuilt mask")));
    assert_eq!(
        stage1.iter().map(|i| i.rule_index).collect::<Vec<_>>(),
        vec![Some(0), Some(1)]
    );

    let missing = config.validate_rule_section("no_such_rules");
    assert_eq!(missing.len(), 1);
    assert!(missing[0].rule_index.is_none());
}

#[test]
fn test_example_rules_sorted_and_resolved() {
    let engine = ConditionEngine::new(example_config(), "erm_status_rules");
    let priorities: Vec<i64> = engine.rules().iter().map(|r| r.priority).collect();
    let mut sorted = priorities.clone();
    sorted.sort();
    assert_eq!(priorities, sorted);
    assert_eq!(engine.rules()[0].status.as_deref(), Some("已完成"));
    assert_eq!(engine.rule_ids()[0], "priority_1_已完成");
}

#[test]
fn test_rules_load_from_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        r#"
spx:
  kiosk_suppliers: ["Kiosk Co"]
  locker_suppliers: ["Locker Co"]
asset_rules:
  conditions:
    - priority: 5
      status_value: "資產類"
      note: "asset supplier"
      checks:
        - {{ type: in_list, field: "PO Supplier", list_key: spx.asset_suppliers }}
"#
    )
    .unwrap();

    let config = Arc::new(ConfigTree::from_file(file.path()).unwrap());
    let engine = ConditionEngine::new(config, "asset_rules").with_metrics(Arc::new(EngineMetrics::new()));
    let data = batch(vec![(
        "PO Supplier",
        Arc::new(StringArray::from(vec![Some("Locker Co"), Some("Other"), Some("Kiosk Co"), None])) as ArrayRef,
    )]);

    let mut ctx = RuleContext::new(None, None);
    let (out, stats) = engine
        .apply_rules(&data, columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
        .unwrap();
    assert_eq!(
        statuses(&out, columns::PO_STATUS),
        vec![Some("資產類".to_string()), None, Some("資產類".to_string()), None]
    );
    assert_eq!(stats.get("priority_5_資產類"), Some(&2));
}

#[test]
fn test_unknown_check_type_matches_through_prebuilt_mask() {
    let tree = Arc::new(
        ConfigTree::from_str_with_format(
            r#"
[[closing.conditions]]
priority = 1
status_value = "待關單"
checks = [{ type = "in_to_be_closed_list" }]
"#,
            FileFormat::Toml,
        )
        .unwrap(),
    );
    let engine = ConditionEngine::new(tree, "closing").with_metrics(Arc::new(EngineMetrics::new()));
    let data = batch(vec![(
        columns::PO_ID,
        Arc::new(StringArray::from(vec!["P1", "P2"])) as ArrayRef,
    )]);

    let mut without = RuleContext::new(None, None);
    let (out, stats) = engine
        .apply_rules(&data, columns::PO_STATUS, &mut without, RecordKind::Po, false)
        .unwrap();
    assert!(stats.is_empty());
    assert_eq!(statuses(&out, columns::PO_STATUS), vec![None, None]);

    let mut with = RuleContext::new(None, None)
        .with_mask("in_to_be_closed_list", Mask::from(vec![false, true]));
    let (out, stats) = engine
        .apply_rules(&data, columns::PO_STATUS, &mut with, RecordKind::Po, false)
        .unwrap();
    assert_eq!(stats.get("priority_1_待關單"), Some(&1));
    assert_eq!(
        statuses(&out, columns::PO_STATUS),
        vec![None, Some("待關單".to_string())]
    );
}

#[test]
fn test_equals_with_float_cast() {
    let tree = Arc::new(
        ConfigTree::from_str_with_format(
            r#"
[[rent.conditions]]
priority = 1
status_value = "租金"
checks = [
    { type = "contains", field = "Item Description", pattern = "(?i)rent" },
    { type = "equals", field = "Entry Billed Amount", value = 0, cast = "float" },
]
"#,
            FileFormat::Toml,
        )
        .unwrap(),
    );
    let engine = ConditionEngine::new(tree, "rent").with_metrics(Arc::new(EngineMetrics::new()));
    let data = batch(vec![
        (
            columns::ITEM_DESCRIPTION,
            Arc::new(StringArray::from(vec!["Office RENT 2025/03", "Office rent", "Cleaning"])) as ArrayRef,
        ),
        (
            columns::ENTRY_BILLED_AMOUNT,
            Arc::new(StringArray::from(vec!["0.0", "12", "0"])),
        ),
    ]);

    let mut ctx = RuleContext::new(None, None);
    let (out, _) = engine
        .apply_rules(&data, columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
        .unwrap();
    assert_eq!(
        statuses(&out, columns::PO_STATUS),
        vec![Some("租金".to_string()), None, None]
    );
}

#[test]
fn test_coverage_and_metrics_accumulate_across_runs() {
    let tree = Arc::new(ConfigTree::from_str_with_format(COMPLETED_RULES, FileFormat::Toml).unwrap());
    let metrics = Arc::new(EngineMetrics::new());
    let coverage = CoverageTracker::new();
    let engine = ConditionEngine::new(tree, "accrual")
        .with_metrics(Arc::clone(&metrics))
        .with_coverage(coverage.clone());

    let unmatched = batch(vec![
        (columns::ENTRY_QUANTITY, Arc::new(Float64Array::from(vec![1.0])) as ArrayRef),
        (columns::RECEIVED_QUANTITY, Arc::new(Float64Array::from(vec![2.0]))),
        (columns::ENTRY_BILLED_AMOUNT, Arc::new(Float64Array::from(vec![0.0]))),
    ]);
    let mut ctx = RuleContext::new(None, None);
    engine
        .apply_rules(&unmatched, columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
        .unwrap();
    let report = coverage.report(&engine.rule_ids());
    assert_eq!(report.covered, 0);
    assert_eq!(report.uncovered, vec!["priority_1_已完成".to_string()]);

    let matched = batch(vec![
        (columns::ENTRY_QUANTITY, Arc::new(Float64Array::from(vec![2.0, 3.0])) as ArrayRef),
        (columns::RECEIVED_QUANTITY, Arc::new(Float64Array::from(vec![2.0, 3.0]))),
        (columns::ENTRY_BILLED_AMOUNT, Arc::new(Float64Array::from(vec![0.0, 0.0]))),
    ]);
    engine
        .apply_rules(&matched, columns::PO_STATUS, &mut ctx, RecordKind::Po, false)
        .unwrap();
    let report = coverage.report(&engine.rule_ids());
    assert_eq!(report.covered, 1);
    assert!(report.uncovered.is_empty());
    assert_eq!(coverage.hits("priority_1_已完成"), 2);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.engine_runs, 2);
    assert_eq!(snapshot.rows_labeled, 2);
    assert_eq!(snapshot.rows_unlabeled, 0);
    assert!(metrics
        .to_prometheus()
        .contains("accrual_engine_runs_total 2"));
}
