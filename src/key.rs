//! Index keys and their translation into bound vectors.
//!
//! A key is one [`Index`] per user-facing axis. [`translate`] turns it into
//! inclusive-exclusive bounds in user order; [`to_storage_order`] is the only
//! place where user-order bounds are reversed for the store.

use crate::error::{Result, VdsError};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// Dimensionality of a store subset request
pub const STORE_DIMS: usize = 6;

/// Index along one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    /// A single position; the axis is removed from the result
    Scalar(i64),
    /// A half-open range; omitted bounds default to the axis extent
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl Index {
    /// The whole axis
    pub const FULL: Index = Index::Range {
        start: None,
        stop: None,
        step: None,
    };

    pub fn range(start: i64, stop: i64) -> Self {
        Index::Range {
            start: Some(start),
            stop: Some(stop),
            step: None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Index::Scalar(_))
    }
}

macro_rules! impl_index_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Index {
                fn from(value: $ty) -> Self {
                    Index::Scalar(value as i64)
                }
            }

            impl From<Range<$ty>> for Index {
                fn from(range: Range<$ty>) -> Self {
                    Index::range(range.start as i64, range.end as i64)
                }
            }

            impl From<RangeFrom<$ty>> for Index {
                fn from(range: RangeFrom<$ty>) -> Self {
                    Index::Range {
                        start: Some(range.start as i64),
                        stop: None,
                        step: None,
                    }
                }
            }

            impl From<RangeTo<$ty>> for Index {
                fn from(range: RangeTo<$ty>) -> Self {
                    Index::Range {
                        start: None,
                        stop: Some(range.end as i64),
                        step: None,
                    }
                }
            }
        )*
    };
}

impl_index_from!(i32, i64, usize);

impl From<RangeFull> for Index {
    fn from(_: RangeFull) -> Self {
        Index::FULL
    }
}

/// Build a key from a list of indices, e.g. `key![.., 3, 2..5]`
#[macro_export]
macro_rules! key {
    ($($index:expr),* $(,)?) => {
        [$($crate::key::Index::from($index)),*]
    };
}

/// Bounds produced by translating a key against a shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedKey {
    /// Inclusive lower bounds, user order
    pub begin: Vec<usize>,
    /// Exclusive upper bounds, user order
    pub end: Vec<usize>,
    /// Axes indexed by a scalar, to be squeezed from results
    pub scalar: Vec<bool>,
}

impl TranslatedKey {
    /// Extent of the selection along each axis, before squeezing
    pub fn dims(&self) -> Vec<usize> {
        self.begin
            .iter()
            .zip(self.end.iter())
            .map(|(b, e)| e - b)
            .collect()
    }

    /// Extent of the selection with scalar axes removed
    pub fn squeezed_dims(&self) -> Vec<usize> {
        self.dims()
            .into_iter()
            .zip(self.scalar.iter())
            .filter(|(_, &scalar)| !scalar)
            .map(|(d, _)| d)
            .collect()
    }

    /// The selection as plain ranges, one per axis
    pub fn ranges(&self) -> Vec<Range<usize>> {
        self.begin
            .iter()
            .zip(self.end.iter())
            .map(|(&b, &e)| b..e)
            .collect()
    }

    /// The selection rewritten as a key of ranges only (nothing squeezed)
    pub fn to_range_key(&self) -> Vec<Index> {
        self.ranges()
            .into_iter()
            .map(|r| Index::range(r.start as i64, r.end as i64))
            .collect()
    }
}

/// Translate `key` against a user-order `shape`.
///
/// Missing trailing indices select the whole axis. Validation finishes before
/// anything is returned, so callers never act on a partially checked key.
pub fn translate(key: &[Index], shape: &[usize]) -> Result<TranslatedKey> {
    if key.len() > shape.len() {
        return Err(VdsError::InvalidKey(format!(
            "key has {} indices but the volume has {} axes",
            key.len(),
            shape.len()
        )));
    }

    let mut begin = Vec::with_capacity(shape.len());
    let mut end = Vec::with_capacity(shape.len());
    let mut scalar = Vec::with_capacity(shape.len());

    for (axis, &len) in shape.iter().enumerate() {
        let index = key.get(axis).copied().unwrap_or(Index::FULL);
        let (b, e, is_scalar) = match index {
            Index::Scalar(k) => (k, k.saturating_add(1), true),
            Index::Range { step, .. } if step.is_some_and(|s| s != 1) => {
                return Err(VdsError::InvalidKey(format!(
                    "step {} on axis {} is not supported",
                    step.unwrap_or_default(),
                    axis
                )));
            }
            Index::Range { start, stop, .. } => {
                (start.unwrap_or(0), stop.unwrap_or(len as i64), false)
            }
        };

        if b < 0 || b > e || e > len as i64 {
            return Err(VdsError::OutOfRange {
                axis,
                begin: b,
                end: e,
                len,
            });
        }

        begin.push(b as usize);
        end.push(e as usize);
        scalar.push(is_scalar);
    }

    Ok(TranslatedKey { begin, end, scalar })
}

/// Reverse user-order bounds into the store's axis order, padding the unused
/// store dimensions with `0..1`
pub fn to_storage_order(begin: &[usize], end: &[usize]) -> ([usize; STORE_DIMS], [usize; STORE_DIMS]) {
    debug_assert_eq!(begin.len(), end.len());
    debug_assert!(begin.len() <= STORE_DIMS);

    let mut storage_begin = [0; STORE_DIMS];
    let mut storage_end = [1; STORE_DIMS];
    for (i, (&b, &e)) in begin.iter().rev().zip(end.iter().rev()).enumerate() {
        storage_begin[i] = b;
        storage_end[i] = e;
    }
    (storage_begin, storage_end)
}

/// Reverse a storage-order vector (shape, bounds or axis descriptors) into user order
pub fn to_user_order<T: Clone>(values: &[T]) -> Vec<T> {
    values.iter().rev().cloned().collect()
}

/// Reverse user-order per-axis values into storage order
pub fn to_storage_axes<T: Clone>(values: &[T]) -> Vec<T> {
    values.iter().rev().cloned().collect()
}
