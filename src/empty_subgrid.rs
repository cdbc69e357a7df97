//! Subgrid that occupies unfilled grid cells.

use crate::error::Result;
use crate::interp::InterpAxis;
use crate::subgrid::{Stats, Subgrid, SubgridEnum, SubgridIndexedIter};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::iter;
use std::mem;

/// A subgrid type that is always empty.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EmptySubgrid;

impl Subgrid for EmptySubgrid {
    fn node_values(&self) -> Vec<Vec<f64>> {
        Vec::new()
    }

    fn shape(&self) -> Vec<usize> {
        Vec::new()
    }

    fn fill(&mut self, _: &[InterpAxis], _: &[f64], _: f64) -> Result<()> {
        // the grid swaps in a fillable subgrid before the first fill
        unreachable!("empty subgrids do not support the fill operation");
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn merge(&mut self, subgrid: &SubgridEnum, _: Option<(usize, usize)>) {
        assert!(
            subgrid.is_empty(),
            "EmptySubgrid can not merge non-empty subgrids"
        );
    }

    fn scale(&mut self, _: f64) {}

    fn indexed_iter(&self) -> SubgridIndexedIter {
        Box::new(iter::empty())
    }

    fn to_dense(&self) -> ArrayD<f64> {
        ArrayD::zeros(Vec::new())
    }

    fn stats(&self) -> Stats {
        Stats {
            total: 0,
            allocated: 0,
            zeros: 0,
            overhead: 0,
            bytes_per_value: mem::size_of::<f64>(),
        }
    }

    fn optimize_nodes(&mut self) {}
}
