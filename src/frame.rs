//! Column access and column replacement on [`RecordBatch`].
//!
//! Batches are immutable; every "write" here builds a new batch that shares
//! the untouched columns with the old one.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tracing::warn;

use crate::mask::{self, Mask};

pub fn has_column(batch: &RecordBatch, name: &str) -> bool {
    batch.schema().column_with_name(name).is_some()
}

/// Names of `required` that are not present in the batch.
pub fn missing_columns(batch: &RecordBatch, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !has_column(batch, name))
        .map(|name| name.to_string())
        .collect()
}

fn cast_column(batch: &RecordBatch, name: &str, to: &DataType) -> Option<ArrayRef> {
    let column = batch.column_by_name(name)?;
    if column.data_type() == to {
        return Some(Arc::clone(column));
    }
    match cast(column.as_ref(), to) {
        Ok(array) => Some(array),
        Err(e) => {
            warn!(column = name, error = %e, "Column cannot be cast to {}", to);
            None
        }
    }
}

/// The column rendered as text. `None` when absent.
pub fn text(batch: &RecordBatch, name: &str) -> Option<StringArray> {
    cast_column(batch, name, &DataType::Utf8).map(|a| a.as_string::<i32>().clone())
}

/// The column as text, or an all-null column when absent.
pub fn text_or_nulls(batch: &RecordBatch, name: &str) -> StringArray {
    text(batch, name).unwrap_or_else(|| StringArray::new_null(batch.num_rows()))
}

/// The column as `f64`. Values that do not parse become null.
pub fn numbers(batch: &RecordBatch, name: &str) -> Option<Float64Array> {
    cast_column(batch, name, &DataType::Float64)
        .map(|a| a.as_primitive::<arrow::datatypes::Float64Type>().clone())
}

/// The column as `i64`. Values that do not parse become null.
pub fn integers(batch: &RecordBatch, name: &str) -> Option<Int64Array> {
    cast_column(batch, name, &DataType::Int64)
        .map(|a| a.as_primitive::<arrow::datatypes::Int64Type>().clone())
}

pub fn value_at(array: &StringArray, row: usize) -> Option<&str> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

pub fn number_at(array: &Float64Array, row: usize) -> Option<f64> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

pub fn integer_at(array: &Int64Array, row: usize) -> Option<i64> {
    if array.is_null(row) {
        None
    } else {
        Some(array.value(row))
    }
}

/// Null, empty, or the literal `nan` all count as "no value".
pub fn is_blank(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v.is_empty() || v.eq_ignore_ascii_case("nan"),
    }
}

/// Rows of a status column that carry no status yet.
pub fn unset_mask(status: &StringArray) -> Mask {
    mask::from_fn(status.len(), |row| is_blank(value_at(status, row)))
}

/// Mask from a per-value predicate; nulls evaluate to `on_null`.
pub fn text_mask(
    array: &StringArray,
    on_null: bool,
    mut f: impl FnMut(&str) -> bool,
) -> Mask {
    mask::from_fn(array.len(), |row| match value_at(array, row) {
        Some(v) => f(v),
        None => on_null,
    })
}

/// Copy of `base` with every masked row set to `value`.
pub fn fill_text(base: &StringArray, mask: &BooleanArray, value: &str) -> StringArray {
    (0..base.len())
        .map(|row| {
            if mask.value(row) {
                Some(value)
            } else {
                value_at(base, row)
            }
        })
        .collect()
}

/// Copy of `base` with every masked row replaced by `f(row)`.
pub fn blend_text(
    base: &StringArray,
    mask: &BooleanArray,
    mut f: impl FnMut(usize) -> Option<String>,
) -> StringArray {
    (0..base.len())
        .map(|row| {
            if mask.value(row) {
                f(row)
            } else {
                value_at(base, row).map(str::to_string)
            }
        })
        .collect()
}

/// Copy of `base` with every masked row replaced by `f(row)`.
pub fn blend_numbers(
    base: &Float64Array,
    mask: &BooleanArray,
    mut f: impl FnMut(usize) -> Option<f64>,
) -> Float64Array {
    (0..base.len())
        .map(|row| {
            if mask.value(row) {
                f(row)
            } else {
                number_at(base, row)
            }
        })
        .collect()
}

/// Replaces the named column, or appends it when absent.
pub fn put_column(batch: &RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let field = Arc::new(Field::new(name, array.data_type().clone(), true));
    let mut fields: Vec<_> = schema.fields().iter().cloned().collect();
    let mut columns = batch.columns().to_vec();

    match schema.index_of(name) {
        Ok(idx) => {
            fields[idx] = field;
            columns[idx] = array;
        }
        Err(_) => {
            fields.push(field);
            columns.push(array);
        }
    }

    RecordBatch::try_new(
        Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone())),
        columns,
    )
    .with_context(|| format!("Failed to rebuild batch with column '{name}'"))
}

/// Adds an all-null text column when `name` is missing.
pub fn ensure_text_column(batch: &RecordBatch, name: &str) -> Result<RecordBatch> {
    if has_column(batch, name) {
        return Ok(batch.clone());
    }
    put_column(batch, name, Arc::new(StringArray::new_null(batch.num_rows())))
}

/// Distinct non-blank values of a text column.
pub fn distinct_values(array: &StringArray) -> std::collections::HashSet<String> {
    (0..array.len())
        .filter_map(|row| value_at(array, row))
        .filter(|v| !is_blank(Some(v)))
        .map(str::to_string)
        .collect()
}
