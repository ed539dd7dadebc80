//! Read-only concatenation of volumes along one axis

use crate::error::{Result, VdsError};
use crate::key::{translate, Index};
use crate::types::Element;
use crate::view::squeeze;
use ndarray::{concatenate, ArrayD, ArrayViewD, Axis};
use std::ops::Range;

/// Anything that can serve typed subset reads in user order
pub trait VolumeSubset<T: Element> {
    /// Spatial shape, user order
    fn shape(&self) -> Vec<usize>;

    /// Read the region selected by `key`, scalar indices squeezed
    fn read(&self, key: &[Index]) -> Result<ArrayD<T>>;
}

/// Split the half-open range `start..stop` over members with the given
/// extents, as `(member, local range)` pairs in member order.
///
/// An empty range still names one member: the one starting at `start`, or the
/// last member when `start` is the total extent.
pub fn decompose(extents: &[usize], start: usize, stop: usize) -> Vec<(usize, Range<usize>)> {
    let mut pieces = Vec::new();
    let mut offset = 0;

    if start == stop {
        for (member, &extent) in extents.iter().enumerate() {
            if extent > 0 && start >= offset && start < offset + extent {
                pieces.push((member, start - offset..start - offset));
                return pieces;
            }
            offset += extent;
        }
        if let Some(member) = extents.iter().rposition(|&extent| extent > 0) {
            if start == offset {
                pieces.push((member, extents[member]..extents[member]));
            }
        }
        return pieces;
    }

    for (member, &extent) in extents.iter().enumerate() {
        let (lo, hi) = (offset, offset + extent);
        offset = hi;
        if extent == 0 || hi <= start || lo >= stop {
            continue;
        }
        pieces.push((member, start.max(lo) - lo..stop.min(hi) - lo));
    }
    pieces
}

/// Several subsets joined along `slice_dim`.
///
/// Members are borrowed; they must agree on every axis but `slice_dim`.
pub struct CompositeView<'a, T: Element> {
    members: Vec<&'a dyn VolumeSubset<T>>,
    slice_dim: usize,
    shape: Vec<usize>,
}

impl<'a, T: Element> CompositeView<'a, T> {
    /// An empty composite; members are added with [`CompositeView::add_subset`]
    pub fn new(slice_dim: usize) -> Self {
        Self {
            members: Vec::new(),
            slice_dim,
            shape: Vec::new(),
        }
    }

    pub fn with_subsets(
        members: impl IntoIterator<Item = &'a dyn VolumeSubset<T>>,
        slice_dim: usize,
    ) -> Result<Self> {
        let mut composite = Self::new(slice_dim);
        for member in members {
            composite.add_subset(member)?;
        }
        Ok(composite)
    }

    /// Append a member after checking it lines up with the others
    pub fn add_subset(&mut self, member: &'a dyn VolumeSubset<T>) -> Result<()> {
        let shape = member.shape();
        if self.slice_dim >= shape.len() {
            return Err(VdsError::InvalidDimensions(format!(
                "slice dimension {} is outside a {}D subset",
                self.slice_dim,
                shape.len()
            )));
        }

        if self.members.is_empty() {
            self.shape = shape;
        } else {
            let compatible = shape.len() == self.shape.len()
                && shape
                    .iter()
                    .zip(self.shape.iter())
                    .enumerate()
                    .all(|(axis, (a, b))| axis == self.slice_dim || a == b);
            if !compatible {
                return Err(VdsError::ShapeMismatch(format!(
                    "subset of shape {:?} does not line up with {:?} along dimension {}",
                    shape, self.shape, self.slice_dim
                )));
            }
            self.shape[self.slice_dim] += shape[self.slice_dim];
        }

        self.members.push(member);
        Ok(())
    }

    pub fn slice_dim(&self) -> usize {
        self.slice_dim
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    /// Extent of every member along `slice_dim`
    pub fn extents(&self) -> Vec<usize> {
        self.members
            .iter()
            .map(|member| member.shape()[self.slice_dim])
            .collect()
    }

    pub fn read(&self, key: &[Index]) -> Result<ArrayD<T>> {
        if self.members.is_empty() {
            return Err(VdsError::InvalidOperation(
                "cannot read from an empty composite".to_string(),
            ));
        }

        let translated = translate(key, &self.shape)?;
        let dim = self.slice_dim;
        let pieces = decompose(&self.extents(), translated.begin[dim], translated.end[dim]);
        if pieces.is_empty() {
            return Err(VdsError::InvalidOperation(format!(
                "composite of shape {:?} has no samples along dimension {}",
                self.shape, dim
            )));
        }

        // members see ranges only, so every piece keeps the slice axis
        let mut parts = Vec::with_capacity(pieces.len());
        for (member, local) in pieces {
            let mut member_key = translated.to_range_key();
            member_key[dim] = Index::from(local);
            parts.push(self.members[member].read(&member_key)?);
        }

        let joined = match parts.len() {
            1 => parts.remove(0),
            _ => {
                let views: Vec<ArrayViewD<'_, T>> = parts.iter().map(|part| part.view()).collect();
                concatenate(Axis(dim), &views).map_err(|e| VdsError::ShapeMismatch(e.to_string()))?
            }
        };
        Ok(squeeze(joined, &translated.scalar))
    }
}

impl<T: Element> VolumeSubset<T> for CompositeView<'_, T> {
    fn shape(&self) -> Vec<usize> {
        CompositeView::shape(self)
    }

    fn read(&self, key: &[Index]) -> Result<ArrayD<T>> {
        CompositeView::read(self, key)
    }
}
