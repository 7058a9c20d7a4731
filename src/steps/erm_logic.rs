use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use regex::Regex;
use tracing::{error, info, warn};

use crate::check::{self, BuiltinCheck, Check, CheckInput};
use crate::columns;
use crate::config::ConfigTree;
use crate::engine::{ConditionEngine, RuleContext, RuleStats};
use crate::frame;
use crate::mask::{self, Mask};
use crate::pipeline::{run_step, ProcessingContext, Step, StepResult};
use crate::rule::{FallbackLabel, RecordKind};
use crate::steps::{has_columns, stats_json, status_distribution};

pub const ERM_SECTION: &str = "erm_status_rules";

const REFERENCE_ACCOUNT: &str = "reference_account";
const REFERENCE_LIABILITY: &str = "reference_liability";

const FORMAT_ERROR_STATUS: &str = "格式錯誤，退單";
const OTHER_STATUS: &str = "其他";
const ACCRUAL_STATUS: &str = "已完成";
const PREPAID_LIABILITY: &str = "111112";
const REGION: &str = "TW";
const NO_DEPARTMENT: &str = "000";

/// Masks evaluated once per run and shared by every rule.
const PRECOMPUTED: &[BuiltinCheck] = &[
    BuiltinCheck::NoStatus,
    BuiltinCheck::ErmLeDate,
    BuiltinCheck::ErmGtDate,
    BuiltinCheck::ErmInRange,
    BuiltinCheck::OutOfRange,
    BuiltinCheck::FormatError,
    BuiltinCheck::QtyMatched,
    BuiltinCheck::NotBilled,
    BuiltinCheck::HasBilling,
    BuiltinCheck::FullyBilled,
    BuiltinCheck::HasUnpaid,
    BuiltinCheck::RemarkCompleted,
    BuiltinCheck::PrNotIncomplete,
    BuiltinCheck::NotError,
    BuiltinCheck::IsFa,
];

lazy_static::lazy_static! {
    static ref FIRST_WORD: Regex = Regex::new(r"^(\w+)").expect("static pattern");
}

/// ERM status rules followed by accrual-flag and accounting-field
/// derivation, for PO or PR batches.
pub struct ErmLogicStep {
    name: String,
    config: Arc<ConfigTree>,
    engine: ConditionEngine,
}

impl ErmLogicStep {
    pub fn new(config: Arc<ConfigTree>) -> Self {
        let engine = ConditionEngine::new(Arc::clone(&config), ERM_SECTION);
        Self::with_engine(config, engine)
    }

    pub fn with_engine(config: Arc<ConfigTree>, engine: ConditionEngine) -> Self {
        Self {
            name: "ErmLogic".to_string(),
            config,
            engine,
        }
    }

    fn required_columns(kind: RecordKind) -> Vec<&'static str> {
        let mut required = vec![
            columns::GL_ACCOUNT,
            columns::ERM,
            columns::DESCRIPTION_PERIOD,
            columns::ENTRY_QUANTITY,
            columns::RECEIVED_QUANTITY,
            columns::BILLED_QUANTITY,
            columns::ENTRY_AMOUNT,
            columns::ENTRY_BILLED_AMOUNT,
            columns::ITEM_DESCRIPTION,
            columns::REMARK_PROCUREMENT,
            columns::REMARK_FN,
            columns::CURRENCY,
            columns::PRODUCT_CODE,
        ];
        if kind == RecordKind::Po {
            required.push(columns::UNIT_PRICE);
        }
        required
    }

    fn fallbacks(kind: RecordKind) -> Vec<FallbackLabel> {
        let mut labels = vec![FallbackLabel::new(
            FORMAT_ERROR_STATUS,
            "description period could not be parsed",
            Some(Check::Builtin(BuiltinCheck::FormatError)),
        )];
        if kind == RecordKind::Pr {
            labels.push(FallbackLabel::new(OTHER_STATUS, "no rule matched", None));
        }
        labels
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<StepResult> {
        let kind = ctx.processing_type();
        let status_column = kind.status_column();
        let processing_date = ctx
            .int_variable("processing_date")
            .context("processing_date variable is missing or not an integer")?;
        let entity = ctx.metadata().entity_type.clone();
        info!(step = %self.name, %kind, processing_date, "Applying ERM logic");

        let rows = ctx.data().num_rows();
        let mut batch = frame::put_column(
            ctx.data(),
            columns::FILE_DATE,
            Arc::new(Int64Array::from(vec![processing_date; rows])),
        )?;
        batch = frame::ensure_text_column(&batch, status_column)?;

        let (labeled, stats) = self.apply_status_rules(&batch, kind, processing_date, &entity)?;
        batch = labeled;

        let accrual = accrual_mask(&batch, kind);
        let accrual_count = mask::count(&accrual);
        let flags: StringArray = (0..rows)
            .map(|row| Some(if accrual.value(row) { "Y" } else { "N" }))
            .collect();
        batch = frame::put_column(&batch, columns::ACCRUAL_FLAG, Arc::new(flags))?;

        let reference_account = ctx
            .auxiliary_data(REFERENCE_ACCOUNT)
            .context("reference_account dataset is missing")?;
        batch = self
            .set_accounting_fields(&batch, &accrual, kind, &entity, reference_account)
            .context("Failed to derive accounting fields")?;

        if kind == RecordKind::Po {
            let reference_liability = ctx
                .auxiliary_data(REFERENCE_LIABILITY)
                .context("reference_liability dataset is missing")?;
            batch = set_liability(&batch, &accrual, reference_liability)?;
            batch = check_product_code(&batch)?;
        }

        ctx.update_data(batch.clone());
        info!(step = %self.name, accrual = accrual_count, total = rows, "ERM logic completed");

        Ok(StepResult::success(
            &self.name,
            format!("ERM logic applied, {accrual_count} rows need accrual"),
        )
        .with_metadata("total_count", rows)
        .with_metadata("accrual_count", accrual_count)
        .with_metadata(
            "status_distribution",
            status_distribution(&batch, status_column),
        )
        .with_metadata("rule_hits", stats_json(&stats))
        .with_data(batch))
    }

    fn apply_status_rules(
        &self,
        batch: &RecordBatch,
        kind: RecordKind,
        processing_date: i64,
        entity: &str,
    ) -> Result<(RecordBatch, RuleStats)> {
        let status_column = kind.status_column();
        let mut rule_ctx = RuleContext::new(Some(processing_date), Some(entity));
        let precomputed = {
            let input = CheckInput {
                batch,
                status_column,
                processing_date: rule_ctx.processing_date,
                entity_type: Some(entity),
                config: &self.config,
                prebuilt: &rule_ctx.prebuilt_masks,
            };
            check::precompute(&input, PRECOMPUTED)
        };
        rule_ctx.prebuilt_masks.extend(precomputed);

        let (batch, mut stats) =
            self.engine
                .apply_rules(batch, status_column, &mut rule_ctx, kind, true)?;
        let (batch, fallback_stats) = self.engine.apply_fallbacks(
            &batch,
            status_column,
            &mut rule_ctx,
            kind,
            &Self::fallbacks(kind),
        )?;

        if let Some(errors) = fallback_stats.get(&format!("fallback_{FORMAT_ERROR_STATUS}")) {
            if *errors > 0 {
                warn!(step = %self.name, rows = errors, "Rows with unparsable description period");
            }
        }
        stats.extend(fallback_stats);
        Ok((batch, stats))
    }

    fn set_accounting_fields(
        &self,
        batch: &RecordBatch,
        accrual: &Mask,
        kind: RecordKind,
        entity: &str,
        reference_account: &RecordBatch,
    ) -> Result<RecordBatch> {
        let account = frame::text_or_nulls(batch, columns::GL_ACCOUNT);
        let account_names = lookup(reference_account, columns::REF_ACCOUNT, columns::REF_ACCOUNT_DESC);
        if account_names.is_empty() {
            warn!(step = %self.name, "Reference account data is empty");
        }
        let dept_accounts: HashSet<String> = self
            .config
            .resolve_list(&format!("{}.dept_accounts", entity.to_ascii_lowercase()))
            .unwrap_or_default()
            .into_iter()
            .collect();
        let department = frame::text_or_nulls(batch, columns::DEPARTMENT);

        let mut batch = batch.clone();
        let set_text = |batch: &RecordBatch,
                            column: &str,
                            f: &dyn Fn(usize) -> Option<String>|
         -> Result<RecordBatch> {
            let base = frame::text_or_nulls(batch, column);
            let blended = frame::blend_text(&base, accrual, f);
            frame::put_column(batch, column, Arc::new(blended) as ArrayRef)
        };

        batch = set_text(&batch, columns::ACCOUNT_CODE, &|row| {
            frame::value_at(&account, row).map(str::to_string)
        })?;
        batch = set_text(&batch, columns::ACCOUNT_NAME, &|row| {
            frame::value_at(&account, row).and_then(|a| account_names.get(a).cloned())
        })?;
        let product = frame::text_or_nulls(&batch, columns::PRODUCT_CODE);
        batch = set_text(&batch, columns::PRODUCT_CODE_OUT, &|row| {
            frame::value_at(&product, row).map(str::to_string)
        })?;
        batch = set_text(&batch, columns::REGION, &|_| Some(REGION.to_string()))?;
        batch = set_text(&batch, columns::DEPARTMENT_OUT, &|row| {
            let in_dept = frame::value_at(&account, row).is_some_and(|a| dept_accounts.contains(a));
            if in_dept {
                frame::value_at(&department, row).map(|d| d.chars().take(3).collect())
            } else {
                Some(NO_DEPARTMENT.to_string())
            }
        })?;
        let currency = frame::text_or_nulls(&batch, columns::CURRENCY);
        batch = set_text(&batch, columns::CURRENCY_OUT, &|row| {
            frame::value_at(&currency, row).map(str::to_string)
        })?;

        let amount = accrual_amount(&batch, kind)?;
        let base = frame::numbers(&batch, columns::ACCRUAL_AMOUNT)
            .unwrap_or_else(|| Float64Array::new_null(batch.num_rows()));
        let blended = frame::blend_numbers(&base, accrual, |row| frame::number_at(&amount, row));
        frame::put_column(&batch, columns::ACCRUAL_AMOUNT, Arc::new(blended))
    }

    fn log_missing(&self, what: &str) {
        error!(step = %self.name, "Missing {}", what);
    }
}

/// PO: status contains the accrual status. PR: status equals it.
fn accrual_mask(batch: &RecordBatch, kind: RecordKind) -> Mask {
    let status = frame::text_or_nulls(batch, kind.status_column());
    match kind {
        RecordKind::Po => frame::text_mask(&status, false, |s| s.contains(ACCRUAL_STATUS)),
        RecordKind::Pr => frame::text_mask(&status, false, |s| s == ACCRUAL_STATUS),
    }
}

/// PO: unit price times the unbilled quantity. PR: the entry amount.
fn accrual_amount(batch: &RecordBatch, kind: RecordKind) -> Result<Float64Array> {
    let number = |column: &str| {
        frame::numbers(batch, column).with_context(|| format!("Column '{column}' is not numeric"))
    };
    match kind {
        RecordKind::Po => {
            let price = number(columns::UNIT_PRICE)?;
            let entry = number(columns::ENTRY_QUANTITY)?;
            let billed = number(columns::BILLED_QUANTITY)?;
            Ok((0..batch.num_rows())
                .map(|row| {
                    Some(
                        frame::number_at(&price, row)?
                            * (frame::number_at(&entry, row)? - frame::number_at(&billed, row)?),
                    )
                })
                .collect())
        }
        RecordKind::Pr => number(columns::ENTRY_AMOUNT),
    }
}

fn lookup(reference: &RecordBatch, key: &str, value: &str) -> HashMap<String, String> {
    let (Some(keys), Some(values)) = (frame::text(reference, key), frame::text(reference, value))
    else {
        return HashMap::new();
    };
    (0..keys.len())
        .filter_map(|row| {
            Some((
                frame::value_at(&keys, row)?.to_string(),
                frame::value_at(&values, row)?.to_string(),
            ))
        })
        .collect()
}

/// Prepaid accrual rows book to the prepayment liability; the rest take the
/// liability account mapped from their account code.
fn set_liability(
    batch: &RecordBatch,
    accrual: &Mask,
    reference_liability: &RecordBatch,
) -> Result<RecordBatch> {
    let liabilities = lookup(reference_liability, columns::REF_ACCOUNT, columns::REF_LIABILITY);
    let account = frame::text_or_nulls(batch, columns::ACCOUNT_CODE);
    let prepay = frame::numbers(batch, columns::ENTRY_PREPAY_AMOUNT)
        .unwrap_or_else(|| Float64Array::new_null(batch.num_rows()));
    let prepaid = mask::and(
        accrual,
        &mask::from_fn(batch.num_rows(), |row| {
            frame::number_at(&prepay, row).is_some_and(|v| v != 0.0)
        }),
    );

    let flags = frame::fill_text(
        &frame::text_or_nulls(batch, columns::PREPAID_FLAG),
        &prepaid,
        "Y",
    );
    let liability = frame::blend_text(
        &frame::text_or_nulls(batch, columns::LIABILITY),
        accrual,
        |row| {
            if prepaid.value(row) {
                Some(PREPAID_LIABILITY.to_string())
            } else {
                frame::value_at(&account, row).and_then(|a| liabilities.get(a).cloned())
            }
        },
    );

    let batch = frame::put_column(batch, columns::PREPAID_FLAG, Arc::new(flags))?;
    frame::put_column(&batch, columns::LIABILITY, Arc::new(liability))
}

/// Compares the first word of `Project` with the derived product code.
fn check_product_code(batch: &RecordBatch) -> Result<RecordBatch> {
    let Some(project) = frame::text(batch, columns::PROJECT) else {
        warn!("Project column missing, skipping product code check");
        return Ok(batch.clone());
    };
    let product = frame::text_or_nulls(batch, columns::PRODUCT_CODE_OUT);
    let checks: StringArray = (0..batch.num_rows())
        .map(|row| {
            let code = frame::value_at(&product, row)?;
            let first_word = frame::value_at(&project, row)
                .and_then(|p| FIRST_WORD.captures(p))
                .and_then(|c| c.get(1))
                .map_or("", |m| m.as_str());
            Some(if first_word == code { "good" } else { "bad" })
        })
        .collect();
    let bad = (0..checks.len())
        .filter(|&row| frame::value_at(&checks, row) == Some("bad"))
        .count();
    if bad > 0 {
        warn!(rows = bad, "Product code does not match project");
    }
    frame::put_column(batch, columns::PRODUCT_CODE_CHECK, Arc::new(checks))
}

#[async_trait]
impl Step for ErmLogicStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Apply ERM status rules and derive accrual fields"
    }

    fn validate_input(&self, ctx: &ProcessingContext) -> bool {
        let data = ctx.data();
        if data.num_rows() == 0 {
            self.log_missing("input rows");
            return false;
        }
        let kind = ctx.processing_type();
        if !has_columns(&self.name, data, &Self::required_columns(kind)) {
            return false;
        }
        if ctx.auxiliary_data(REFERENCE_ACCOUNT).is_none() {
            self.log_missing("reference_account dataset");
            return false;
        }
        if kind == RecordKind::Po && ctx.auxiliary_data(REFERENCE_LIABILITY).is_none() {
            self.log_missing("reference_liability dataset");
            return false;
        }
        if ctx.int_variable("processing_date").is_none() {
            self.log_missing("processing_date variable");
            return false;
        }
        true
    }

    async fn execute(&self, ctx: &mut ProcessingContext) -> StepResult {
        run_step(&self.name, || self.run(ctx)).await
    }

    async fn rollback(&self, _ctx: &mut ProcessingContext, error: &str) {
        warn!(step = %self.name, error, "Rolling back ERM logic");
    }
}
