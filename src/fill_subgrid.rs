//! Module containing the Lagrange-interpolation subgrid.

use crate::error::Result;
use crate::interp::{self, InterpAxis};
use crate::slice_stack::SliceStack;
use crate::subgrid::{self, Stats, Subgrid, SubgridEnum, SubgridIndexedIter};
use itertools::izip;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::mem;

/// Subgrid which uses Lagrange-interpolation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FillSubgrid {
    array: SliceStack,
    axes: Vec<InterpAxis>,
    static_nodes: Vec<Option<f64>>,
}

impl FillSubgrid {
    /// Constructor.
    #[must_use]
    pub fn new(axes: &[InterpAxis]) -> Self {
        Self {
            array: SliceStack::new(axes.iter().map(InterpAxis::nodes).collect()),
            axes: axes.to_vec(),
            // negative sentinel, no fill coordinate seen yet
            static_nodes: vec![Some(-1.0); axes.len()],
        }
    }
}

impl Subgrid for FillSubgrid {
    fn fill(&mut self, axes: &[InterpAxis], ntuple: &[f64], weight: f64) -> Result<()> {
        debug_assert_eq!(axes.len(), ntuple.len());

        if interp::distribute(axes, ntuple, weight, &mut self.array)? {
            for (value, previous_node) in ntuple.iter().zip(&mut self.static_nodes) {
                if let Some(previous_value) = previous_node {
                    if *previous_value < 0.0 {
                        *previous_value = *value;
                    } else if !subgrid::node_value_eq(*previous_value, *value) {
                        *previous_node = None;
                    }
                }
            }
        }

        Ok(())
    }

    fn node_values(&self) -> Vec<Vec<f64>> {
        self.axes.iter().map(InterpAxis::node_values).collect()
    }

    fn shape(&self) -> Vec<usize> {
        self.array.shape().to_vec()
    }

    fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    fn merge(&mut self, other: &SubgridEnum, transpose: Option<(usize, usize)>) {
        // we cannot use `Self::indexed_iter` because it multiplies with the reweight factors
        if let SubgridEnum::FillSubgrid(other) = other {
            self.array.merge(&other.array, transpose);
        } else {
            unimplemented!();
        }
    }

    fn scale(&mut self, factor: f64) {
        self.array.scale(factor);
    }

    fn indexed_iter(&self) -> SubgridIndexedIter {
        let factors: Vec<Vec<f64>> = self
            .axes
            .iter()
            .map(|axis| {
                axis.node_values()
                    .iter()
                    .map(|&node| axis.reweight(node))
                    .collect()
            })
            .collect();

        Box::new(self.array.indexed_iter().map(move |(indices, weight)| {
            let reweight = indices
                .iter()
                .zip(&factors)
                .map(|(&index, factors)| factors[index])
                .product::<f64>();
            (indices, weight * reweight)
        }))
    }

    fn to_dense(&self) -> ArrayD<f64> {
        let mut array = ArrayD::zeros(self.array.shape().to_vec());

        for (indices, value) in self.indexed_iter() {
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

    fn optimize_nodes(&mut self) {
        if self.array.is_empty() {
            return;
        }

        // find the ranges in which the nodes are actually used
        let ranges: Vec<_> = self.array.indexed_iter().fold(
            self.array.shape().iter().map(|&len| len..0).collect(),
            |mut prev: Vec<std::ops::Range<usize>>, (indices, _)| {
                for (range, index) in prev.iter_mut().zip(indices) {
                    range.start = range.start.min(index);
                    range.end = range.end.max(index + 1);
                }
                prev
            },
        );

        let mut new_array = SliceStack::new(
            ranges
                .iter()
                .zip(&self.static_nodes)
                .map(|(range, static_node)| {
                    if static_node.is_some() {
                        1
                    } else {
                        range.len()
                    }
                })
                .collect(),
        );

        // folding the interpolation spread of a static axis onto its single node swaps the
        // reweighting factors of the spread nodes for the one of the static coordinate, which
        // the readout multiplies back
        let reweights: Vec<Option<Vec<f64>>> = self
            .axes
            .iter()
            .zip(&self.static_nodes)
            .map(|(axis, &static_node)| {
                static_node.map(|value| {
                    let norm = axis.reweight(value);
                    axis.node_values()
                        .iter()
                        .map(|&node| axis.reweight(node) / norm)
                        .collect()
                })
            })
            .collect();

        for (mut index, mut value) in self.array.indexed_iter() {
            for (idx, range, reweight) in izip!(&mut index, &ranges, &reweights) {
                if let Some(factors) = reweight {
                    value *= factors[*idx];
                    *idx = 0;
                } else {
                    *idx -= range.start;
                }
            }
            new_array.add(&index, value);
        }

        self.array = new_array;

        for (axis, static_node, range) in izip!(&mut self.axes, &mut self.static_nodes, ranges) {
            *axis = if let &mut Some(value) = static_node {
                axis.single_node(value)
            } else {
                axis.sub_range(range)
            };
        }
    }
}
