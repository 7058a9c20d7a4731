//! Check evaluation.
//!
//! A [`Check`] turns one declarative check into a row mask, or `None` when it
//! cannot be evaluated against the batch at hand (missing column, unresolved
//! reference, missing processing date). `None` never matches and never
//! aborts a run.
//!
//! Every check first looks for a prebuilt mask registered under its type
//! name. Steps use this to supply masks computed from auxiliary data, and to
//! override a built-in family with a precomputed variant.

use std::collections::{HashMap, HashSet};

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::columns;
use crate::config::{value_to_text, ConfigTree};
use crate::frame;
use crate::mask::{self, Mask};
use crate::rule::{Cast, CheckConfig};

/// Everything a check may read while it evaluates.
#[derive(Clone, Copy)]
pub struct CheckInput<'a> {
    pub batch: &'a RecordBatch,
    pub status_column: &'a str,
    pub processing_date: Option<i64>,
    pub entity_type: Option<&'a str>,
    pub config: &'a ConfigTree,
    pub prebuilt: &'a HashMap<String, Mask>,
}

impl<'a> CheckInput<'a> {
    fn rows(&self) -> usize {
        self.batch.num_rows()
    }

    fn prebuilt(&self, name: &str) -> Option<Mask> {
        let found = self.prebuilt.get(name)?;
        if found.len() != self.rows() {
            warn!(
                check = %name,
                mask_rows = found.len(),
                batch_rows = self.rows(),
                "Ignoring prebuilt mask of the wrong length"
            );
            return None;
        }
        Some(mask::non_null(found))
    }
}

#[derive(Debug, Clone)]
pub enum Expected {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone)]
pub enum Check {
    Contains {
        field: Option<String>,
        regex: Option<Regex>,
        negate: bool,
    },
    Equals {
        field: Option<String>,
        expected: Option<Expected>,
        negate: bool,
    },
    InList {
        field: Option<String>,
        values: Option<HashSet<String>>,
        negate: bool,
    },
    IsNull {
        field: Option<String>,
        negate: bool,
    },
    Builtin(BuiltinCheck),
    /// Matches only through a mask registered under this name.
    Prebuilt(String),
    /// Matches every row.
    Always,
}

const FIELD_CHECKS: &[&str] = &[
    "contains",
    "not_contains",
    "equals",
    "not_equals",
    "in_list",
    "not_in_list",
    "is_null",
    "is_not_null",
];

/// Whether `kind` names a check this crate evaluates itself.
pub fn is_known_type(kind: &str) -> bool {
    FIELD_CHECKS.contains(&kind) || BuiltinCheck::from_name(kind).is_some()
}

/// Whether checks of this type compare a configured `field`.
pub fn needs_field(kind: &str) -> bool {
    FIELD_CHECKS.contains(&kind)
}

impl Check {
    pub fn compile(config: &CheckConfig, tree: &ConfigTree) -> Self {
        let field = config.field.clone();
        match config.kind.as_str() {
            "contains" | "not_contains" => Self::Contains {
                field,
                regex: compile_pattern(config, tree),
                negate: config.kind == "not_contains",
            },
            "equals" | "not_equals" => Self::Equals {
                field,
                expected: resolve_expected(config, tree),
                negate: config.kind == "not_equals",
            },
            "in_list" | "not_in_list" => Self::InList {
                field,
                values: resolve_values(config, tree),
                negate: config.kind == "not_in_list",
            },
            "is_null" | "is_not_null" => Self::IsNull {
                field,
                negate: config.kind == "is_not_null",
            },
            other => match BuiltinCheck::from_name(other) {
                Some(builtin) => Self::Builtin(builtin),
                None => Self::Prebuilt(other.to_string()),
            },
        }
    }

    /// The type name, which is also the prebuilt-mask key.
    pub fn name(&self) -> &str {
        match self {
            Self::Contains { negate: false, .. } => "contains",
            Self::Contains { negate: true, .. } => "not_contains",
            Self::Equals { negate: false, .. } => "equals",
            Self::Equals { negate: true, .. } => "not_equals",
            Self::InList { negate: false, .. } => "in_list",
            Self::InList { negate: true, .. } => "not_in_list",
            Self::IsNull { negate: false, .. } => "is_null",
            Self::IsNull { negate: true, .. } => "is_not_null",
            Self::Builtin(b) => b.name(),
            Self::Prebuilt(name) => name,
            Self::Always => "always",
        }
    }

    pub fn evaluate(&self, input: &CheckInput<'_>) -> Option<Mask> {
        if let Some(prebuilt) = input.prebuilt(self.name()) {
            return Some(prebuilt);
        }

        match self {
            Self::Contains { field, regex, negate } => {
                let values = field_text(input, field.as_deref(), self.name())?;
                let regex = regex.as_ref()?;
                let matched = frame::text_mask(&values, false, |v| regex.is_match(v));
                Some(negated(matched, *negate))
            }
            Self::Equals { field, expected, negate } => {
                let field = field.as_deref()?;
                let matched = equals_mask(input, field, expected.as_ref()?)?;
                Some(negated(matched, *negate))
            }
            Self::InList { field, values, negate } => {
                let column = field_text(input, field.as_deref(), self.name())?;
                let values = values.as_ref()?;
                let matched = frame::text_mask(&column, false, |v| values.contains(v));
                Some(negated(matched, *negate))
            }
            Self::IsNull { field, negate } => {
                let column = field_text(input, field.as_deref(), self.name())?;
                let blank = mask::from_fn(column.len(), |row| {
                    frame::is_blank(frame::value_at(&column, row))
                });
                Some(negated(blank, *negate))
            }
            Self::Builtin(builtin) => builtin.evaluate(input),
            Self::Prebuilt(name) => {
                warn!(check = %name, "Unknown check type with no prebuilt mask");
                None
            }
            Self::Always => Some(mask::constant(input.rows(), true)),
        }
    }
}

fn negated(mask: Mask, negate: bool) -> Mask {
    if negate {
        mask::not(&mask)
    } else {
        mask
    }
}

fn field_text(
    input: &CheckInput<'_>,
    field: Option<&str>,
    check: &str,
) -> Option<arrow::array::StringArray> {
    let Some(field) = field else {
        warn!(check, "Check has no field");
        return None;
    };
    let column = frame::text(input.batch, field);
    if column.is_none() {
        warn!(check, field, "Check field is missing from the batch");
    }
    column
}

fn compile_pattern(config: &CheckConfig, tree: &ConfigTree) -> Option<Regex> {
    let pattern = match (&config.pattern, &config.pattern_key) {
        (Some(p), _) => p.clone(),
        (None, Some(key)) => tree.resolve_text(key)?,
        (None, None) => {
            warn!(check = %config.kind, "Check has no pattern");
            return None;
        }
    };
    match Regex::new(&pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(check = %config.kind, pattern = %pattern, error = %e, "Invalid check pattern");
            None
        }
    }
}

fn resolve_expected(config: &CheckConfig, tree: &ConfigTree) -> Option<Expected> {
    let value = match (&config.value, &config.value_key) {
        (Some(v), _) => v.clone(),
        (None, Some(key)) => tree.resolve(key)?,
        (None, None) => return None,
    };
    let text = value_to_text(&value)?;
    match config.cast {
        Some(Cast::Int) => {
            let parsed = match &value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
                _ => text.trim().parse().ok(),
            };
            parsed.map(Expected::Int)
        }
        Some(Cast::Float) => text.trim().parse().ok().map(Expected::Float),
        Some(Cast::Str) | None => Some(Expected::Text(text)),
    }
}

fn resolve_values(config: &CheckConfig, tree: &ConfigTree) -> Option<HashSet<String>> {
    let values = match (&config.values, &config.list_key) {
        (Some(values), _) => values.iter().filter_map(value_to_text).collect(),
        (None, Some(key)) => tree.resolve_list(key)?,
        (None, None) => return None,
    };
    Some(values.into_iter().collect())
}

fn equals_mask(input: &CheckInput<'_>, field: &str, expected: &Expected) -> Option<Mask> {
    let rows = input.rows();
    match expected {
        Expected::Int(want) => {
            let column = frame::integers(input.batch, field)?;
            Some(mask::from_fn(rows, |row| {
                frame::integer_at(&column, row) == Some(*want)
            }))
        }
        Expected::Float(want) => {
            let column = frame::numbers(input.batch, field)?;
            Some(mask::from_fn(rows, |row| {
                frame::number_at(&column, row) == Some(*want)
            }))
        }
        Expected::Text(want) => {
            let column = frame::text(input.batch, field)?;
            Some(frame::text_mask(&column, false, |v| v == want.as_str()))
        }
    }
}

/// Check families computed from fixed columns of the purchase schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCheck {
    NoStatus,
    ErmLeDate,
    ErmGtDate,
    ErmInRange,
    OutOfRange,
    DescErmLeDate,
    DescErmGtDate,
    DescErmNotError,
    FormatError,
    QtyMatched,
    QtyNotMatched,
    NotBilled,
    HasBilling,
    FullyBilled,
    HasUnpaid,
    RemarkCompleted,
    PrNotIncomplete,
    NotError,
    IsFa,
    NotFa,
}

type Evaluator = fn(&CheckInput<'_>) -> Option<Mask>;

const BUILTINS: &[(BuiltinCheck, &str, Evaluator)] = &[
    (BuiltinCheck::NoStatus, "no_status", no_status),
    (BuiltinCheck::ErmLeDate, "erm_le_date", erm_le_date),
    (BuiltinCheck::ErmGtDate, "erm_gt_date", erm_gt_date),
    (BuiltinCheck::ErmInRange, "erm_in_range", erm_in_range),
    (BuiltinCheck::OutOfRange, "out_of_range", out_of_range),
    (BuiltinCheck::DescErmLeDate, "desc_erm_le_date", desc_erm_le_date),
    (BuiltinCheck::DescErmGtDate, "desc_erm_gt_date", desc_erm_gt_date),
    (BuiltinCheck::DescErmNotError, "desc_erm_not_error", desc_erm_not_error),
    (BuiltinCheck::FormatError, "format_error", format_error),
    (BuiltinCheck::QtyMatched, "qty_matched", qty_matched),
    (BuiltinCheck::QtyNotMatched, "qty_not_matched", qty_not_matched),
    (BuiltinCheck::NotBilled, "not_billed", not_billed),
    (BuiltinCheck::HasBilling, "has_billing", has_billing),
    (BuiltinCheck::FullyBilled, "fully_billed", fully_billed),
    (BuiltinCheck::HasUnpaid, "has_unpaid", has_unpaid),
    (BuiltinCheck::RemarkCompleted, "remark_completed", remark_completed),
    (BuiltinCheck::PrNotIncomplete, "pr_not_incomplete", pr_not_incomplete),
    (BuiltinCheck::NotError, "not_error", not_error),
    (BuiltinCheck::IsFa, "is_fa", is_fa),
    (BuiltinCheck::NotFa, "not_fa", not_fa),
];

impl BuiltinCheck {
    pub fn from_name(name: &str) -> Option<Self> {
        BUILTINS
            .iter()
            .find(|(_, n, _)| *n == name)
            .map(|(check, _, _)| *check)
    }

    pub fn name(self) -> &'static str {
        self.entry().1
    }

    fn entry(self) -> &'static (BuiltinCheck, &'static str, Evaluator) {
        // Every variant has a row in BUILTINS.
        BUILTINS
            .iter()
            .find(|(check, _, _)| *check == self)
            .unwrap_or(&BUILTINS[0])
    }

    pub fn all() -> impl Iterator<Item = BuiltinCheck> {
        BUILTINS.iter().map(|(check, _, _)| *check)
    }

    /// Prebuilt mask if one is registered, otherwise the family's own logic.
    pub fn evaluate(self, input: &CheckInput<'_>) -> Option<Mask> {
        let (_, name, evaluator) = self.entry();
        input.prebuilt(name).or_else(|| evaluator(input))
    }
}

/// Evaluates `checks` once and returns the masks keyed by check name, ready to
/// be registered as prebuilt masks. Inapplicable checks are left out.
pub fn precompute(input: &CheckInput<'_>, checks: &[BuiltinCheck]) -> HashMap<String, Mask> {
    checks
        .iter()
        .filter_map(|check| Some((check.name().to_string(), check.evaluate(input)?)))
        .collect()
}

fn no_status(input: &CheckInput<'_>) -> Option<Mask> {
    Some(frame::unset_mask(&frame::text_or_nulls(
        input.batch,
        input.status_column,
    )))
}

fn erm_compare(input: &CheckInput<'_>, cmp: fn(i64, i64) -> bool) -> Option<Mask> {
    let date = input.processing_date?;
    let erm = frame::integers(input.batch, columns::ERM)?;
    Some(mask::from_fn(input.rows(), |row| {
        frame::integer_at(&erm, row).is_some_and(|v| cmp(v, date))
    }))
}

fn erm_le_date(input: &CheckInput<'_>) -> Option<Mask> {
    erm_compare(input, |erm, date| erm <= date)
}

fn erm_gt_date(input: &CheckInput<'_>) -> Option<Mask> {
    erm_compare(input, |erm, date| erm > date)
}

fn period_start(period: &str) -> Option<i64> {
    period.get(..6)?.parse().ok()
}

fn period_end(period: &str) -> Option<i64> {
    period.get(7..)?.trim().parse().ok()
}

/// Per-row `(erm, start, end)` for rows where all three parse.
fn erm_and_period(input: &CheckInput<'_>) -> Option<Vec<Option<(i64, i64, i64)>>> {
    let erm = frame::integers(input.batch, columns::ERM)?;
    let period = frame::text(input.batch, columns::DESCRIPTION_PERIOD)?;
    Some(
        (0..input.rows())
            .map(|row| {
                let erm = frame::integer_at(&erm, row)?;
                let ym = frame::value_at(&period, row)?;
                Some((erm, period_start(ym)?, period_end(ym)?))
            })
            .collect(),
    )
}

fn erm_in_range(input: &CheckInput<'_>) -> Option<Mask> {
    let rows = erm_and_period(input)?;
    Some(mask::from_fn(rows.len(), |row| {
        rows[row].is_some_and(|(erm, start, end)| start <= erm && erm <= end)
    }))
}

fn out_of_range(input: &CheckInput<'_>) -> Option<Mask> {
    let rows = erm_and_period(input)?;
    let period = frame::text(input.batch, columns::DESCRIPTION_PERIOD)?;
    Some(mask::from_fn(rows.len(), |row| {
        let sentinel = frame::value_at(&period, row) == Some(columns::FORMAT_ERROR_SENTINEL);
        !sentinel && rows[row].is_some_and(|(erm, start, end)| erm < start || erm > end)
    }))
}

fn period_mask(input: &CheckInput<'_>, f: impl Fn(&str) -> bool) -> Option<Mask> {
    let period = frame::text(input.batch, columns::DESCRIPTION_PERIOD)?;
    Some(frame::text_mask(&period, false, f))
}

fn desc_erm_le_date(input: &CheckInput<'_>) -> Option<Mask> {
    let date = input.processing_date?;
    period_mask(input, |ym| period_end(ym).is_some_and(|end| end <= date))
}

fn desc_erm_gt_date(input: &CheckInput<'_>) -> Option<Mask> {
    let date = input.processing_date?;
    period_mask(input, |ym| period_start(ym).is_some_and(|start| start > date))
}

fn desc_erm_not_error(input: &CheckInput<'_>) -> Option<Mask> {
    period_mask(input, |ym| {
        period_start(ym).is_some_and(|start| start != 100001)
    })
}

fn format_error(input: &CheckInput<'_>) -> Option<Mask> {
    period_mask(input, |ym| ym == columns::FORMAT_ERROR_SENTINEL)
}

fn qty_matched(input: &CheckInput<'_>) -> Option<Mask> {
    let entry_text = frame::text(input.batch, columns::ENTRY_QUANTITY)?;
    let received_text = frame::text(input.batch, columns::RECEIVED_QUANTITY)?;
    let entry = frame::numbers(input.batch, columns::ENTRY_QUANTITY)?;
    let received = frame::numbers(input.batch, columns::RECEIVED_QUANTITY)?;
    Some(mask::from_fn(input.rows(), |row| {
        match (frame::number_at(&entry, row), frame::number_at(&received, row)) {
            (Some(a), Some(b)) => a == b,
            _ => match (
                frame::value_at(&entry_text, row),
                frame::value_at(&received_text, row),
            ) {
                (Some(a), Some(b)) => a.trim() == b.trim(),
                _ => false,
            },
        }
    }))
}

fn qty_not_matched(input: &CheckInput<'_>) -> Option<Mask> {
    BuiltinCheck::QtyMatched
        .evaluate(input)
        .map(|m| mask::not(&m))
}

fn not_billed(input: &CheckInput<'_>) -> Option<Mask> {
    let billed = frame::numbers(input.batch, columns::ENTRY_BILLED_AMOUNT)?;
    Some(mask::from_fn(input.rows(), |row| {
        frame::number_at(&billed, row) == Some(0.0)
    }))
}

fn has_billing(input: &CheckInput<'_>) -> Option<Mask> {
    let billed = frame::numbers(input.batch, columns::BILLED_QUANTITY)?;
    Some(mask::from_fn(input.rows(), |row| {
        frame::number_at(&billed, row) != Some(0.0)
    }))
}

fn unbilled_amount(input: &CheckInput<'_>) -> Option<Vec<Option<f64>>> {
    let amount = frame::numbers(input.batch, columns::ENTRY_AMOUNT)?;
    let billed = frame::numbers(input.batch, columns::ENTRY_BILLED_AMOUNT)?;
    Some(
        (0..input.rows())
            .map(|row| Some(frame::number_at(&amount, row)? - frame::number_at(&billed, row)?))
            .collect(),
    )
}

fn fully_billed(input: &CheckInput<'_>) -> Option<Mask> {
    let diff = unbilled_amount(input)?;
    Some(mask::from_fn(diff.len(), |row| diff[row] == Some(0.0)))
}

fn has_unpaid(input: &CheckInput<'_>) -> Option<Mask> {
    let diff = unbilled_amount(input)?;
    Some(mask::from_fn(diff.len(), |row| {
        diff[row].is_some_and(|d| d != 0.0)
    }))
}

lazy_static::lazy_static! {
    static ref PROCUREMENT_COMPLETED: Regex = Regex::new("(?i)已完成|rent").expect("static pattern");
    static ref FN_COMPLETED: Regex = Regex::new("(?i)已完成|已入帳").expect("static pattern");
    static ref INCOMPLETE: Regex = Regex::new("(?i)未完成").expect("static pattern");
}

fn remark_completed(input: &CheckInput<'_>) -> Option<Mask> {
    let procurement = frame::text_or_nulls(input.batch, columns::REMARK_PROCUREMENT);
    let fn_remark = frame::text_or_nulls(input.batch, columns::REMARK_FN);
    Some(mask::or(
        &frame::text_mask(&procurement, false, |v| PROCUREMENT_COMPLETED.is_match(v)),
        &frame::text_mask(&fn_remark, false, |v| FN_COMPLETED.is_match(v)),
    ))
}

fn pr_not_incomplete(input: &CheckInput<'_>) -> Option<Mask> {
    match frame::text(input.batch, columns::REMARK_FN_PR) {
        Some(remark) => Some(frame::text_mask(&remark, true, |v| !INCOMPLETE.is_match(v))),
        None => Some(mask::constant(input.rows(), true)),
    }
}

fn not_error(input: &CheckInput<'_>) -> Option<Mask> {
    match frame::text(input.batch, columns::REMARK_PROCUREMENT) {
        Some(remark) => Some(frame::text_mask(&remark, true, |v| v != "error")),
        None => Some(mask::constant(input.rows(), true)),
    }
}

fn is_fa(input: &CheckInput<'_>) -> Option<Mask> {
    let entity = input.entity_type.unwrap_or("spx").to_ascii_lowercase();
    let accounts: HashSet<String> = input
        .config
        .resolve_list(&format!("fa_accounts.{entity}"))?
        .into_iter()
        .collect();
    let gl = frame::text(input.batch, columns::GL_ACCOUNT)?;
    Some(frame::text_mask(&gl, false, |v| accounts.contains(v)))
}

fn not_fa(input: &CheckInput<'_>) -> Option<Mask> {
    BuiltinCheck::IsFa.evaluate(input).map(|m| mask::not(&m))
}
