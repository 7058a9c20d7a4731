//! Boolean mask algebra.
//!
//! A mask is a [`BooleanArray`] aligned to the rows of a batch. Masks built by
//! this crate never carry null slots; [`non_null`] folds nulls into `false` at
//! the boundary so the combinators below can work on the value bits alone.

use arrow::array::{Array, BooleanArray};
use arrow::buffer::BooleanBuffer;

pub type Mask = BooleanArray;

/// Mask of `len` rows, all set to `value`.
pub fn constant(len: usize, value: bool) -> Mask {
    let bits = if value {
        BooleanBuffer::new_set(len)
    } else {
        BooleanBuffer::new_unset(len)
    };
    BooleanArray::new(bits, None)
}

/// Builds a mask by evaluating `f` for every row index.
pub fn from_fn(len: usize, f: impl FnMut(usize) -> bool) -> Mask {
    BooleanArray::new(BooleanBuffer::collect_bool(len, f), None)
}

/// Treats null slots as `false`.
pub fn non_null(mask: &BooleanArray) -> Mask {
    match mask.nulls() {
        Some(nulls) if nulls.null_count() > 0 => {
            BooleanArray::new(mask.values() & nulls.inner(), None)
        }
        _ => BooleanArray::new(mask.values().clone(), None),
    }
}

pub fn and(a: &Mask, b: &Mask) -> Mask {
    BooleanArray::new(a.values() & b.values(), None)
}

pub fn or(a: &Mask, b: &Mask) -> Mask {
    BooleanArray::new(a.values() | b.values(), None)
}

pub fn not(mask: &Mask) -> Mask {
    BooleanArray::new(!mask.values(), None)
}

/// `a AND NOT b`
pub fn and_not(a: &Mask, b: &Mask) -> Mask {
    and(a, &not(b))
}

/// Folds masks with AND. `None` when there is nothing to fold.
pub fn all_of(masks: &[Mask]) -> Option<Mask> {
    let (first, rest) = masks.split_first()?;
    Some(rest.iter().fold(first.clone(), |acc, m| and(&acc, m)))
}

/// Folds masks with OR. `None` when there is nothing to fold.
pub fn any_of(masks: &[Mask]) -> Option<Mask> {
    let (first, rest) = masks.split_first()?;
    Some(rest.iter().fold(first.clone(), |acc, m| or(&acc, m)))
}

pub fn count(mask: &Mask) -> usize {
    mask.true_count()
}
