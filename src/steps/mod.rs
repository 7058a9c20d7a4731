//! Concrete pipeline steps.

mod erm_logic;
mod loading;
mod status_stage1;

pub use erm_logic::{ErmLogicStep, ERM_SECTION};
pub use loading::{AuxiliaryLoadStep, AuxiliarySource, StaticSource};
pub use status_stage1::{StatusStage1Step, STAGE1_SECTION};

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::error;

use crate::engine::RuleStats;
use crate::frame;

/// Count of each non-blank value of `column`.
pub(crate) fn status_distribution(batch: &RecordBatch, column: &str) -> Map<String, Value> {
    let mut counts: IndexMap<String, u64> = IndexMap::new();
    if let Some(values) = frame::text(batch, column) {
        for row in 0..values.len() {
            let value = frame::value_at(&values, row);
            if let Some(v) = value.filter(|_| !frame::is_blank(value)) {
                *counts.entry(v.to_string()).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .map(|(status, count)| (status, Value::from(count)))
        .collect()
}

pub(crate) fn stats_json(stats: &RuleStats) -> Value {
    Value::Object(
        stats
            .iter()
            .map(|(id, count)| (id.clone(), Value::from(*count)))
            .collect(),
    )
}

/// `true` when every required column is present; logs the missing ones
/// otherwise.
pub(crate) fn has_columns(step: &str, batch: &RecordBatch, required: &[&str]) -> bool {
    let missing = frame::missing_columns(batch, required);
    if !missing.is_empty() {
        error!(step, ?missing, "Missing required columns");
    }
    missing.is_empty()
}
