//! Module containing the trait `Subgrid` and supporting structs.

use crate::empty_subgrid::EmptySubgrid;
use crate::error::Result;
use crate::fill_subgrid::FillSubgrid;
use crate::import_subgrid::ImportSubgrid;
use crate::interp::InterpAxis;
use enum_dispatch::enum_dispatch;
use float_cmp::approx_eq;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Compares two node coordinates for equality, up to floating-point round-off accumulated by
/// coordinate maps and their inverses.
#[must_use]
pub fn node_value_eq(lhs: f64, rhs: f64) -> bool {
    approx_eq!(f64, lhs, rhs, ulps = 4096)
}

/// Variant of [`node_value_eq`] usable with `Vec::dedup_by`.
#[must_use]
pub fn node_value_eq_ref_mut(lhs: &mut f64, rhs: &mut f64) -> bool {
    node_value_eq(*lhs, *rhs)
}

/// Enum which lists all possible [`Subgrid`] variants.
#[enum_dispatch(Subgrid)]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum SubgridEnum {
    // WARNING: never change the order or content of this enum, only add to the end of it
    /// Subgrid that supports filling.
    FillSubgrid,
    /// Empty subgrid.
    EmptySubgrid,
    /// Subgrid for imported or computed slices.
    ImportSubgrid,
}

impl Default for SubgridEnum {
    fn default() -> Self {
        EmptySubgrid::default().into()
    }
}

/// Size-related statistics for a subgrid.
#[derive(Debug, Eq, PartialEq)]
pub struct Stats {
    /// Number of possible total entries for a subgrid.
    pub total: usize,
    /// Number of allocated entries. Always smaller or equal than [`Self::total`].
    pub allocated: usize,
    /// Number of allocated entries that are zero. Always smaller or equal than
    /// [`Self::allocated`].
    pub zeros: usize,
    /// Size of internal data not used to store grid values.
    pub overhead: usize,
    /// This value multiplied with any other member of this struct gives an approximate size in
    /// bytes.
    pub bytes_per_value: usize,
}

/// Trait each subgrid must implement.
#[enum_dispatch]
pub trait Subgrid {
    /// Returns the coordinates of all nodes, one vector per dimension.
    fn node_values(&self) -> Vec<Vec<f64>>;

    /// Returns the number of nodes of every dimension.
    fn shape(&self) -> Vec<usize>;

    /// Fill the subgrid with `weight` at the coordinates `ntuple`, interpolated over `axes`. The
    /// coordinate ordering is the one given by `kinematics` in
    /// [`Grid::new`](crate::grid::Grid::new).
    ///
    /// # Errors
    ///
    /// Returns an error if a coordinate is outside the domain of an axis that rejects
    /// out-of-domain coordinates.
    fn fill(&mut self, axes: &[InterpAxis], ntuple: &[f64], weight: f64) -> Result<()>;

    /// Returns true if no non-zero value is stored.
    fn is_empty(&self) -> bool;

    /// Merge `other` into this subgrid, possibly transposing the two dimensions given by
    /// `transpose`.
    ///
    /// # Panics
    ///
    /// May panic when the variants of `self` and `other` are incompatible;
    /// [`Grid::merge`](crate::grid::Grid::merge) converts subgrids beforehand so that this
    /// cannot happen.
    fn merge(&mut self, other: &SubgridEnum, transpose: Option<(usize, usize)>);

    /// Scale the subgrid by `factor`.
    fn scale(&mut self, factor: f64);

    /// Return an iterator over all non-zero elements of the subgrid, in slice-major order.
    fn indexed_iter(&self) -> SubgridIndexedIter;

    /// Return the contents of this subgrid as a dense array.
    fn to_dense(&self) -> ArrayD<f64>;

    /// Return statistics for this subgrid.
    fn stats(&self) -> Stats;

    /// Shrink the node ranges to those actually used and collapse axes whose fills only ever saw
    /// a single coordinate.
    fn optimize_nodes(&mut self);
}

/// Type to iterate over the non-zero contents of a subgrid.
pub type SubgridIndexedIter<'a> = Box<dyn Iterator<Item = (Vec<usize>, f64)> + 'a>;
