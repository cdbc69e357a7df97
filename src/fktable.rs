//! Provides the [`FkTable`] type.

use crate::conv::ConvCache;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::order::Order;
use crate::subgrid::{self, Subgrid};
use ndarray::ArrayD;
use std::io::Write;

/// Structure implementing FK tables. These are special [`Grid`]s, for which the following
/// additional guarantees are given:
///
/// - all subgrids of the grid evaluate the convolution functions at a single scale `muf2`, see
///   [`FkTable::muf2`];
/// - all subgrids share the same `x` grid, see [`FkTable::x_grid`];
/// - the channels are *simple*, meaning that every channel consists of a single tuple of PIDs
///   with trivial factor `1.0`, and all tuples are distinct from each other;
/// - the grid contains only a single [`Order`], whose exponents are all zero.
#[repr(transparent)]
pub struct FkTable {
    grid: Grid,
}

impl FkTable {
    /// Returns the [`Grid`] object of this `FkTable`.
    #[must_use]
    pub const fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Returns the FK table represented as a dense array indexed by bin, channel and one momentum
    /// fraction per convolution, in this order.
    ///
    /// # Panics
    ///
    /// Panics if the `FkTable` is empty, which the conversion from [`Grid`] rules out.
    #[must_use]
    pub fn table(&self) -> ArrayD<f64> {
        let subgrids = self.grid.subgrids();
        let first_non_empty = subgrids
            .iter()
            .find(|subgrid| !subgrid.is_empty())
            // UNWRAP: the `TryFrom` conversion rejects empty FK tables
            .unwrap_or_else(|| unreachable!());

        // subgrid shape without the single scale node
        let x_dims = first_non_empty.shape()[1..].to_vec();

        let mut dim = vec![self.bins(), self.channels().len()];
        dim.extend_from_slice(&x_dims);
        let mut table = ArrayD::zeros(dim);

        for ((_, bin, channel), subgrid) in subgrids.indexed_iter() {
            for (indices, value) in subgrid.indexed_iter() {
                let mut index = vec![bin, channel];
                index.extend_from_slice(&indices[1..]);
                table[index.as_slice()] = value;
            }
        }

        table
    }

    /// Returns the number of bins of this `FkTable`.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.grid.bins().bins()
    }

    /// Extract the normalizations for each bin.
    #[must_use]
    pub fn normalizations(&self) -> Vec<f64> {
        self.grid.normalizations()
    }

    /// Returns the channels of this `FkTable`. All factors are `1.0`, so only the PID tuples are
    /// returned.
    #[must_use]
    pub fn channels(&self) -> Vec<Vec<i32>> {
        self.grid
            .channels()
            .iter()
            .map(|channel| channel.terms()[0].0.clone())
            .collect()
    }

    /// Returns the single squared scale at which the convolution functions of this `FkTable` are
    /// evaluated.
    ///
    /// # Panics
    ///
    /// Panics if the `FkTable` is empty, which the conversion from [`Grid`] rules out.
    #[must_use]
    pub fn muf2(&self) -> f64 {
        let subgrids = self.grid.subgrids();
        let subgrid = subgrids
            .iter()
            .find(|subgrid| !subgrid.is_empty())
            // UNWRAP: the `TryFrom` conversion rejects empty FK tables
            .unwrap_or_else(|| unreachable!());

        subgrid.node_values()[0][0]
    }

    /// Returns the `x` grid that all subgrids share.
    ///
    /// # Panics
    ///
    /// Panics if the `FkTable` is empty, which the conversion from [`Grid`] rules out.
    #[must_use]
    pub fn x_grid(&self) -> Vec<f64> {
        let subgrids = self.grid.subgrids();
        let mut x_grids = subgrids
            .iter()
            .filter(|subgrid| !subgrid.is_empty())
            .flat_map(|subgrid| subgrid.node_values()[1..].to_vec());

        // prefer an axis that was not collapsed to a single node
        x_grids
            .clone()
            .find(|values| values.len() > 1)
            .or_else(|| x_grids.next())
            // UNWRAP: the `TryFrom` conversion rejects empty FK tables
            .unwrap_or_else(|| unreachable!())
    }

    /// Propagate [`Grid::write`] to the contained grid.
    ///
    /// # Errors
    ///
    /// See [`Grid::write`].
    pub fn write(&self, writer: impl Write) -> Result<()> {
        self.grid.write(writer)
    }

    /// Propagate [`Grid::write_lz4`] to the contained grid.
    ///
    /// # Errors
    ///
    /// See [`Grid::write_lz4`].
    pub fn write_lz4(&self, writer: impl Write) -> Result<()> {
        self.grid.write_lz4(writer)
    }

    /// Perform all convolutions of this `FkTable` with the functions stored in `cache`. Since the
    /// renormalization scales of an FK table are burnt in, no scale variations are possible.
    ///
    /// # Errors
    ///
    /// See [`Grid::convolve`].
    pub fn convolve(
        &self,
        cache: &mut ConvCache,
        bin_indices: &[usize],
        channel_mask: &[bool],
    ) -> Result<Vec<f64>> {
        self.grid
            .convolve(cache, &[], bin_indices, channel_mask, &[(1.0, 1.0, 1.0)])
    }
}

impl TryFrom<Grid> for FkTable {
    type Error = Error;

    fn try_from(grid: Grid) -> Result<Self> {
        if grid.orders() != [Order::new(0, 0, 0, 0, 0)] {
            return Err(Error::config(
                "a FkTable must contain a single order with all exponents zero",
            ));
        }

        for channel in grid.channels() {
            let terms = channel.terms();

            if terms.len() != 1 || terms[0].1 != 1.0 {
                return Err(Error::config(
                    "a FkTable must contain only channels with a single unit-weight term",
                ));
            }
        }

        let mut muf2 = -1.0;
        let mut x_grid: Vec<f64> = Vec::new();

        for subgrid in grid.subgrids().iter().filter(|subgrid| !subgrid.is_empty()) {
            let node_values = subgrid.node_values();
            let scale_nodes = &node_values[0];

            if scale_nodes.len() > 1 {
                return Err(Error::config("multiple scales detected"));
            }

            if muf2 < 0.0 {
                muf2 = scale_nodes[0];
            } else if !subgrid::node_value_eq(muf2, scale_nodes[0]) {
                return Err(Error::config("multiple scales detected"));
            }

            for values in &node_values[1..] {
                // axes collapsed to a single node are always compatible
                if values.len() == 1 {
                    continue;
                }

                if x_grid.is_empty() {
                    x_grid.clone_from(values);
                } else if values.len() != x_grid.len()
                    || values
                        .iter()
                        .zip(&x_grid)
                        .any(|(&lhs, &rhs)| !subgrid::node_value_eq(lhs, rhs))
                {
                    return Err(Error::config("different x grids detected"));
                }
            }
        }

        if muf2 < 0.0 {
            return Err(Error::config("the grid contains only empty subgrids"));
        }

        Ok(Self { grid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::BinLimits;
    use crate::channel;
    use crate::conv::{ConvKind, Convolution};
    use crate::import_subgrid::ImportSubgrid;
    use crate::interp::{Bounds, InterpAxis, Kinematic, Map, Reweight, ScaleChoice, Scales};
    use crate::slice_stack::SliceStack;
    use float_cmp::assert_approx_eq;

    fn fk_grid() -> Grid {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(0, 0, 0, 0, 0)],
            vec![channel![[22, 22] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            vec![
                InterpAxis::new(
                    1e2,
                    1e8,
                    40,
                    3,
                    Reweight::None,
                    Map::DoubleLog,
                    Bounds::Reject,
                )
                .unwrap(),
                InterpAxis::new(
                    2e-7,
                    1.0,
                    50,
                    3,
                    Reweight::XGrid,
                    Map::LogPlusLinear,
                    Bounds::Reject,
                )
                .unwrap(),
                InterpAxis::new(
                    2e-7,
                    1.0,
                    50,
                    3,
                    Reweight::XGrid,
                    Map::LogPlusLinear,
                    Bounds::Reject,
                )
                .unwrap(),
            ],
            vec![Kinematic::Scale(0), Kinematic::X(0), Kinematic::X(1)],
            Scales {
                ren: ScaleChoice::None,
                fac: ScaleChoice::Node(0),
                frg: ScaleChoice::None,
            },
        )
        .unwrap();

        let x = vec![0.25, 0.5, 1.0];
        let mut array = SliceStack::new(vec![1, 3, 3]);
        array.add(&[0, 0, 1], 1.0);
        array.add(&[0, 2, 2], 2.0);
        grid.subgrids_mut()[[0, 0, 0]] =
            ImportSubgrid::new(array, vec![vec![8100.0], x.clone(), x]).into();

        grid
    }

    #[test]
    fn accessors() {
        let table = FkTable::try_from(fk_grid()).unwrap();

        assert_eq!(table.bins(), 1);
        assert_eq!(table.channels(), vec![vec![22, 22]]);
        assert_approx_eq!(f64, table.muf2(), 8100.0, ulps = 2);
        assert_eq!(table.x_grid(), [0.25, 0.5, 1.0]);

        let dense = table.table();
        assert_eq!(dense.shape(), [1, 1, 3, 3]);
        assert_approx_eq!(f64, dense[[0, 0, 0, 1]], 1.0, ulps = 2);
        assert_approx_eq!(f64, dense[[0, 0, 2, 2]], 2.0, ulps = 2);
    }

    #[test]
    fn convolve_uses_the_single_scale() {
        let table = FkTable::try_from(fk_grid()).unwrap();

        let mut xfx1 = |_: i32, x: f64, _: f64| x;
        let mut xfx2 = |_: i32, x: f64, _: f64| x;
        let mut alphas = |_: f64| 1.0;
        let mut cache = ConvCache::new(
            table.grid().convolutions().to_vec(),
            vec![&mut xfx1, &mut xfx2],
            &mut alphas,
        );

        let results = table.convolve(&mut cache, &[], &[]).unwrap();
        assert_approx_eq!(f64, results[0], 3.0, ulps = 8);
    }

    #[test]
    fn try_from_rejects_non_trivial_orders() {
        let mut grid = fk_grid();
        grid.orders_mut()[0] = Order::new(0, 2, 0, 0, 0);

        assert!(matches!(FkTable::try_from(grid), Err(Error::Config(_))));
    }

    #[test]
    fn try_from_rejects_complicated_channels() {
        let mut grid = fk_grid();
        grid.channels_mut()[0] = channel![[22, 22] => 1.0; [21, 21] => 1.0];

        assert!(matches!(FkTable::try_from(grid), Err(Error::Config(_))));
    }

    #[test]
    fn try_from_rejects_multiple_scales() {
        let mut grid = fk_grid();

        let x = vec![0.25, 0.5, 1.0];
        let mut array = SliceStack::new(vec![2, 3, 3]);
        array.add(&[1, 0, 0], 1.0);
        grid.subgrids_mut()[[0, 0, 0]] =
            ImportSubgrid::new(array, vec![vec![8100.0, 10000.0], x.clone(), x]).into();

        assert!(matches!(FkTable::try_from(grid), Err(Error::Config(_))));
    }
}
