use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use arrow::array::{Array, StringArray};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use crate::columns;
use crate::config::ConfigTree;
use crate::engine::{ConditionEngine, RuleContext};
use crate::frame;
use crate::mask::{self, Mask};
use crate::pipeline::{run_step, ProcessingContext, Step, StepResult};
use crate::rule::RecordKind;
use crate::steps::{has_columns, stats_json, status_distribution};

pub const STAGE1_SECTION: &str = "status_stage1_rules";

const CLOSING_LIST: &str = "closing_list";
const TO_BE_CLOSED: &str = "in_to_be_closed_list";
const CLOSED: &str = "in_closed_list";

lazy_static::lazy_static! {
    static ref SLASHED_MONTH: Regex = Regex::new(r"(\d{4})/(\d{2})").expect("static pattern");
    static ref FA_REMARK: Regex = Regex::new(r"\d{6}入FA").expect("static pattern");
}

/// First-stage status labeling: closing-list membership, fixed-asset
/// remarks from last month, then the `status_stage1_rules` section.
pub struct StatusStage1Step {
    name: String,
    engine: ConditionEngine,
}

impl StatusStage1Step {
    pub fn new(config: Arc<ConfigTree>) -> Self {
        Self::with_engine(ConditionEngine::new(config, STAGE1_SECTION))
    }

    pub fn with_engine(engine: ConditionEngine) -> Self {
        Self {
            name: "StatusStage1".to_string(),
            engine,
        }
    }

    async fn run(&self, ctx: &mut ProcessingContext) -> Result<StepResult> {
        let closing = match ctx.auxiliary_data(CLOSING_LIST) {
            Some(closing) if closing.num_rows() > 0 => closing.clone(),
            _ => {
                warn!(step = %self.name, "No closing list data, skipping");
                return Ok(StepResult::skipped(&self.name, "No closing list data")
                    .with_data(ctx.data().clone()));
            }
        };

        let kind = ctx.processing_type();
        let status_column = kind.status_column();
        let mut batch = frame::ensure_text_column(ctx.data(), status_column)?;
        batch = normalize_remark_dates(&batch)?;

        let (to_be_closed, closed) = closing_masks(&batch, &closing, kind)?;
        let mut rule_ctx = RuleContext::new(
            Some(ctx.metadata().processing_date),
            Some(ctx.metadata().entity_type.as_str()),
        )
        .with_mask(TO_BE_CLOSED, to_be_closed)
        .with_mask(CLOSED, closed);

        let (labeled, fa_count) = label_fa_remarks(&batch, status_column)?;
        batch = labeled;

        let (batch, stats) =
            self.engine
                .apply_rules(&batch, status_column, &mut rule_ctx, kind, true)?;
        info!(step = %self.name, fa_remarks = fa_count, rules = stats.len(), "Status stage 1 evaluated");

        ctx.update_data(batch.clone());
        Ok(StepResult::success(&self.name, "Status stage 1 evaluated")
            .with_metadata(
                "status_counts",
                status_distribution(&batch, status_column),
            )
            .with_metadata("fa_remarks", fa_count)
            .with_metadata("rule_hits", stats_json(&stats))
            .with_data(batch))
    }
}

/// Rewrites `YYYY/MM` as `YYYYMM` in last month's remark columns.
fn normalize_remark_dates(batch: &RecordBatch) -> Result<RecordBatch> {
    let mut batch = batch.clone();
    for column in [columns::REMARK_FN, columns::REMARK_FN_PR] {
        let Some(remarks) = frame::text(&batch, column) else {
            continue;
        };
        let normalized: StringArray = (0..remarks.len())
            .map(|row| {
                frame::value_at(&remarks, row)
                    .map(|v| SLASHED_MONTH.replace_all(v, "$1$2").into_owned())
            })
            .collect();
        batch = frame::put_column(&batch, column, Arc::new(normalized))?;
    }
    Ok(batch)
}

/// Rows whose id appears in the closing list, split into "to be closed"
/// (finance has not closed them yet) and "closed".
fn closing_masks(
    batch: &RecordBatch,
    closing: &RecordBatch,
    kind: RecordKind,
) -> Result<(Mask, Mask)> {
    let key_column = match kind {
        RecordKind::Po => columns::CLOSING_PO,
        RecordKind::Pr => columns::CLOSING_NEW_PR,
    };
    let missing = frame::missing_columns(
        closing,
        &[columns::CLOSING_NEW_PR, columns::CLOSING_DONE_BY_FN, key_column],
    );
    if !missing.is_empty() {
        bail!("Closing list is missing columns: {}", missing.join(", "));
    }

    let new_pr = frame::text_or_nulls(closing, columns::CLOSING_NEW_PR);
    let done = frame::text_or_nulls(closing, columns::CLOSING_DONE_BY_FN);
    let keys = frame::text_or_nulls(closing, key_column);

    let mut to_be_closed = HashSet::new();
    let mut closed = HashSet::new();
    for row in 0..closing.num_rows() {
        if frame::value_at(&new_pr, row).map_or(true, str::is_empty) {
            continue;
        }
        let Some(key) = frame::value_at(&keys, row) else {
            continue;
        };
        if done.is_null(row) {
            to_be_closed.insert(key.to_string());
        } else {
            closed.insert(key.to_string());
        }
    }

    let ids = frame::text_or_nulls(batch, kind.id_column());
    Ok((
        frame::text_mask(&ids, false, |id| to_be_closed.contains(id)),
        frame::text_mask(&ids, false, |id| closed.contains(id)),
    ))
}

/// Labels unset rows whose remark from last month records a fixed-asset
/// posting (`202503入FA`) with that text. Partial completions are left to the
/// rules.
fn label_fa_remarks(batch: &RecordBatch, status_column: &str) -> Result<(RecordBatch, usize)> {
    let mut status = frame::text_or_nulls(batch, status_column);
    let mut total = 0;

    for column in [columns::REMARK_FN, columns::REMARK_FN_PR] {
        let Some(remarks) = frame::text(batch, column) else {
            continue;
        };
        let extracted: Vec<Option<&str>> = (0..remarks.len())
            .map(|row| {
                frame::value_at(&remarks, row)
                    .filter(|v| !v.contains("部分完成"))
                    .and_then(|v| FA_REMARK.find(v))
                    .map(|m| m.as_str())
            })
            .collect();
        let unset = frame::unset_mask(&status);
        let hits = mask::and(&unset, &mask::from_fn(extracted.len(), |row| extracted[row].is_some()));
        if mask::count(&hits) == 0 {
            continue;
        }
        total += mask::count(&hits);
        status = frame::blend_text(&status, &hits, |row| extracted[row].map(str::to_string));
    }

    if total == 0 {
        return Ok((batch.clone(), 0));
    }
    Ok((
        frame::put_column(batch, status_column, Arc::new(status))?,
        total,
    ))
}

#[async_trait]
impl Step for StatusStage1Step {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Evaluate status stage 1"
    }

    fn validate_input(&self, ctx: &ProcessingContext) -> bool {
        ctx.data().num_rows() > 0 && has_columns(&self.name, ctx.data(), &[ctx.id_column()])
    }

    async fn execute(&self, ctx: &mut ProcessingContext) -> StepResult {
        run_step(&self.name, || self.run(ctx)).await
    }
}
