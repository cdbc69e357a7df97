//! Subgrid for imported or computed slices.

use crate::error::Result;
use crate::interp::InterpAxis;
use crate::slice_stack::SliceStack;
use crate::subgrid::{self, Stats, Subgrid, SubgridEnum, SubgridIndexedIter};
use itertools::izip;
use ndarray::{ArrayD, ArrayViewD};
use serde::{Deserialize, Serialize};
use std::mem;

/// Subgrid whose content is set slice by slice instead of being filled through interpolation.
/// The stored values carry no reweighting.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ImportSubgrid {
    array: SliceStack,
    node_values: Vec<Vec<f64>>,
}

impl ImportSubgrid {
    /// Constructor.
    ///
    /// # Panics
    ///
    /// Panics if the shape of `array` does not match the lengths of `node_values`.
    #[must_use]
    pub fn new(array: SliceStack, node_values: Vec<Vec<f64>>) -> Self {
        assert_eq!(
            array.shape(),
            node_values.iter().map(Vec::len).collect::<Vec<_>>()
        );

        Self { array, node_values }
    }

    /// Add a dense block to the slice with the given first-axis node index. All-zero blocks are
    /// never stored.
    ///
    /// # Panics
    ///
    /// Panics if `index` or the block shape do not match this subgrid.
    pub fn import_slice(&mut self, index: usize, block: ArrayViewD<f64>) {
        self.array.import_slice(index, block);
    }
}

impl Subgrid for ImportSubgrid {
    fn fill(&mut self, _: &[InterpAxis], _: &[f64], _: f64) -> Result<()> {
        panic!("ImportSubgrid doesn't support the fill operation");
    }

    fn node_values(&self) -> Vec<Vec<f64>> {
        self.node_values.clone()
    }

    fn shape(&self) -> Vec<usize> {
        self.array.shape().to_vec()
    }

    fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    fn merge(&mut self, other: &SubgridEnum, transpose: Option<(usize, usize)>) {
        let lhs_node_values = self.node_values();
        let mut rhs_node_values = other.node_values();
        let mut new_node_values = lhs_node_values.clone();
        if let Some((a, b)) = transpose {
            rhs_node_values.swap(a, b);
        }

        if new_node_values != rhs_node_values {
            for (new, rhs) in new_node_values.iter_mut().zip(&rhs_node_values) {
                new.extend(rhs);
                new.sort_by(f64::total_cmp);
                new.dedup_by(subgrid::node_value_eq_ref_mut);
            }

            let mut array = SliceStack::new(new_node_values.iter().map(Vec::len).collect());

            for (indices, value) in self.array.indexed_iter() {
                let target: Vec<_> = izip!(indices, &new_node_values, &lhs_node_values)
                    .map(|(index, new, lhs)| {
                        new.iter()
                            .position(|&value| subgrid::node_value_eq(value, lhs[index]))
                            // UNWRAP: must succeed, `new_node_values` is the union of
                            // `lhs_node_values` and `rhs_node_values`
                            .unwrap()
                    })
                    .collect();

                array.add(&target, value);
            }

            self.array = array;
            self.node_values.clone_from(&new_node_values);
        }

        for (mut indices, value) in other.indexed_iter() {
            if let Some((a, b)) = transpose {
                indices.swap(a, b);
            }

            let target: Vec<_> = izip!(indices, &new_node_values, &rhs_node_values)
                .map(|(index, new, rhs)| {
                    new.iter()
                        .position(|&value| subgrid::node_value_eq(value, rhs[index]))
                        // UNWRAP: must succeed, `new_node_values` is the union of
                        // `lhs_node_values` and `rhs_node_values`
                        .unwrap()
                })
                .collect();

            self.array.add(&target, value);
        }
    }

    fn scale(&mut self, factor: f64) {
        self.array.scale(factor);
    }

    fn indexed_iter(&self) -> SubgridIndexedIter {
        Box::new(self.array.indexed_iter())
    }

    fn to_dense(&self) -> ArrayD<f64> {
        let mut array = ArrayD::zeros(self.array.shape().to_vec());

        for (indices, value) in self.array.indexed_iter() {
            array[indices.as_slice()] = value;
        }

        array
    }

    fn stats(&self) -> Stats {
        let (non_zeros, allocated) = self.array.sparsity();

        Stats {
            total: self.array.shape().iter().product(),
            allocated,
            zeros: allocated - non_zeros,
            overhead: self.array.slices().count(),
            bytes_per_value: mem::size_of::<f64>(),
        }
    }

    fn optimize_nodes(&mut self) {}
}

impl From<&SubgridEnum> for ImportSubgrid {
    fn from(subgrid: &SubgridEnum) -> Self {
        // find the smallest node ranges containing all non-zero entries
        let ranges: Vec<_> = subgrid.indexed_iter().fold(
            subgrid
                .node_values()
                .iter()
                .map(|values| values.len()..0)
                .collect(),
            |mut prev: Vec<std::ops::Range<usize>>, (indices, _)| {
                for (range, index) in prev.iter_mut().zip(indices) {
                    range.start = range.start.min(index);
                    range.end = range.end.max(index + 1);
                }
                prev
            },
        );

        let new_node_values: Vec<_> = subgrid
            .node_values()
            .iter()
            .zip(&ranges)
            .map(|(values, range)| values[range.clone()].to_vec())
            .collect();

        let mut array = SliceStack::new(new_node_values.iter().map(Vec::len).collect());

        for (mut indices, value) in subgrid.indexed_iter() {
            for (index, range) in indices.iter_mut().zip(&ranges) {
                *index -= range.start;
            }

            array.add(&indices, value);
        }

        Self::new(array, new_node_values)
    }
}
