//! Supporting types and functions for [`Grid::evolve`](crate::grid::Grid::evolve).

use crate::channel::Channel;
use crate::conv::ConvKind;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::import_subgrid::ImportSubgrid;
use crate::interp::Kinematic;
use crate::slice_stack::SliceStack;
use crate::subgrid::{self, Subgrid, SubgridEnum};
use itertools::{izip, Itertools};
use ndarray::linalg;
use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView1, ArrayView4, Axis, Ix1, Ix2};
use std::iter;

/// This structure captures the information needed to create an evolution operator for a specific
/// [`Grid`].
pub struct EvolveInfo {
    /// Squared factorization scales of the `Grid`.
    pub fac1: Vec<f64>,
    /// Squared fragmentation scales of the `Grid`.
    pub frg1: Vec<f64>,
    /// Particle identifiers of the `Grid`.
    pub pids1: Vec<i32>,
    /// `x`-grid coordinates of the `Grid`.
    pub x1: Vec<f64>,
    /// Renormalization scales of the `Grid`.
    pub ren1: Vec<f64>,
}

/// Information about one scale slice of an evolution operator, passed to
/// [`Grid::evolve`](crate::grid::Grid::evolve) together with the sliced operator itself. The
/// operator's dimensions must correspond to the values given in [`pids1`](Self::pids1),
/// [`x1`](Self::x1), [`pids0`](Self::pids0) and [`x0`](Self::x0), exactly in this order. Members
/// with a `1` are defined at the squared process scale [`fac1`](Self::fac1) and are found in the
/// `Grid` that is evolved, members with a `0` at the squared starting scale [`fac0`](Self::fac0)
/// and are found in the resulting [`FkTable`](crate::fktable::FkTable).
#[derive(Clone)]
pub struct OperatorSliceInfo {
    /// Squared starting scale of the `FkTable`.
    pub fac0: f64,
    /// Particle identifiers of the `FkTable`.
    pub pids0: Vec<i32>,
    /// `x`-grid coordinates of the `FkTable`.
    pub x0: Vec<f64>,
    /// Squared process scale of the slice of the `Grid` that should be evolved.
    pub fac1: f64,
    /// Particle identifiers of the `Grid`.
    pub pids1: Vec<i32>,
    /// `x`-grid coordinates of the `Grid`.
    pub x1: Vec<f64>,
    /// The type of convolution this operator evolves.
    pub kind: ConvKind,
}

/// A mapping of squared renormalization scales in `ren1` to strong couplings in `alphas`. The
/// ordering of both members defines the mapping.
pub struct AlphasTable {
    /// Renormalization scales of the `Grid`.
    pub ren1: Vec<f64>,
    /// Strong couplings corresponding to the order given in [`ren1`](Self::ren1).
    pub alphas: Vec<f64>,
}

impl AlphasTable {
    /// Create an `AlphasTable` for `grid`, varying the renormalization scale by `xir`, with the
    /// strong couplings given by `alphas`. The only argument of `alphas` is the squared
    /// renormalization scale.
    #[must_use]
    pub fn from_grid(grid: &Grid, xir: f64, alphas: &dyn Fn(f64) -> f64) -> Self {
        let mut ren1: Vec<_> = grid
            .subgrids()
            .iter()
            .filter(|subgrid| !subgrid.is_empty())
            .flat_map(|subgrid| {
                let node_values = subgrid.node_values();
                grid.scales()
                    .ren
                    .calc(&node_values, grid.kinematics())
                    .iter()
                    .map(|&ren| xir * xir * ren)
                    .collect::<Vec<_>>()
            })
            .collect();
        ren1.sort_by(f64::total_cmp);
        ren1.dedup();
        let ren1 = ren1;
        let alphas: Vec<_> = ren1.iter().map(|&mur2| alphas(mur2)).collect();

        Self { ren1, alphas }
    }
}

type Pid01IndexTuples = Vec<(usize, usize)>;
type Pid01Tuples = Vec<(i32, i32)>;

fn pid_slices(
    operator: &ArrayView4<f64>,
    info: &OperatorSliceInfo,
    pid1_nonzero: &dyn Fn(i32) -> bool,
) -> Result<(Pid01IndexTuples, Pid01Tuples)> {
    // pairs of PID indices with a non-zero operator sub-block and a flavor the grid channels use
    let pid_indices: Vec<_> = (0..operator.dim().2)
        .cartesian_product(0..operator.dim().0)
        .filter(|&(pid0_idx, pid1_idx)| {
            operator
                .slice(s![pid1_idx, .., pid0_idx, ..])
                .iter()
                .any(|&value| value != 0.0)
                && pid1_nonzero(info.pids1[pid1_idx])
        })
        .collect();

    if pid_indices.is_empty() {
        return Err(Error::config(
            "no non-zero operator found; the result would be an empty FkTable",
        ));
    }

    let pids = pid_indices
        .iter()
        .map(|&(pid0_idx, pid1_idx)| (info.pids0[pid0_idx], info.pids1[pid1_idx]))
        .collect();

    Ok((pid_indices, pids))
}

fn operator_slices(
    operator: &ArrayView4<f64>,
    info: &OperatorSliceInfo,
    pid_indices: &[(usize, usize)],
    x1: &[f64],
) -> Result<Vec<Array2<f64>>> {
    // permutation between the grid x values and the operator x1 values
    let x1_indices: Vec<_> = x1
        .iter()
        .map(|&xg| {
            info.x1
                .iter()
                .position(|&x| subgrid::node_value_eq(xg, x))
                .ok_or_else(|| Error::config(format!("no operator for x = {xg} found")))
        })
        .collect::<Result<_>>()?;

    // create the corresponding operators accessible in the form [x0, x1]
    let operators: Vec<_> = pid_indices
        .iter()
        .map(|&(pid0_idx, pid1_idx)| {
            operator
                .slice(s![pid1_idx, .., pid0_idx, ..])
                .select(Axis(0), &x1_indices)
                .reversed_axes()
                .as_standard_layout()
                .into_owned()
        })
        .collect();

    Ok(operators)
}

type X1nOpDTuple = (Vec<Vec<f64>>, Option<ArrayD<f64>>);

/// Sum the subgrids of all orders for one (bin, channel) pair into a dense array over the x
/// nodes, keeping only entries whose factorization scale matches `fac1` and applying the
/// couplings and scale logs of each order.
fn subgrid_orders_to_dense_slice(
    grid: &Grid,
    fac1: f64,
    subgrids: &ArrayView1<SubgridEnum>,
    order_mask: &[bool],
    (xir, xif, xia): (f64, f64, f64),
    alphas_table: &AlphasTable,
) -> Result<X1nOpDTuple> {
    let scale_dims = grid
        .kinematics()
        .iter()
        .filter(|kin| matches!(kin, Kinematic::Scale(_)))
        .count();

    // the union of all x values for each momentum-fraction dimension
    let mut x1n: Vec<Vec<f64>> = vec![Vec::new(); grid.convolutions().len()];
    for subgrid in subgrids
        .iter()
        .enumerate()
        .filter(|&(ord_idx, subgrid)| {
            order_mask.get(ord_idx).copied().unwrap_or(true) && !subgrid.is_empty()
        })
        .map(|(_, subgrid)| subgrid)
    {
        for (x1, values) in x1n
            .iter_mut()
            .zip(subgrid.node_values()[scale_dims..].iter())
        {
            x1.extend(values);
            x1.sort_by(f64::total_cmp);
            x1.dedup_by(subgrid::node_value_eq_ref_mut);
        }
    }

    let dim: Vec<_> = x1n.iter().map(Vec::len).collect();
    let mut array = ArrayD::<f64>::zeros(dim);
    let mut zero = true;
    let mut x1_idx = vec![0; grid.convolutions().len()];

    // for the same bin and channel, sum subgrids of different orders, using the right couplings
    for (subgrid, order) in subgrids
        .iter()
        .zip(grid.orders())
        .zip(order_mask.iter().chain(iter::repeat(&true)))
        .filter_map(|((subgrid, order), &enabled)| {
            (enabled && !subgrid.is_empty()).then_some((subgrid, order))
        })
    {
        let mut logs = 1.0;

        if order.logxir > 0 {
            if subgrid::node_value_eq(xir, 1.0) {
                continue;
            }

            logs *= (xir * xir).ln().powi(order.logxir.into());
        }

        if order.logxif > 0 {
            if subgrid::node_value_eq(xif, 1.0) {
                continue;
            }

            logs *= (xif * xif).ln().powi(order.logxif.into());
        }

        if order.logxia > 0 {
            if subgrid::node_value_eq(xia, 1.0) {
                continue;
            }

            logs *= (xia * xia).ln().powi(order.logxia.into());
        }

        let node_values = subgrid.node_values();
        let fac_values = grid.scales().fac.calc(&node_values, grid.kinematics());
        let ren_values = grid.scales().ren.calc(&node_values, grid.kinematics());

        let x1_indices: Vec<Vec<usize>> = node_values[scale_dims..]
            .iter()
            .zip(&x1n)
            .map(|(values, x1)| {
                values
                    .iter()
                    .map(|&xs| {
                        x1.iter()
                            .position(|&x| subgrid::node_value_eq(x, xs))
                            // UNWRAP: `x1n` is the union of all x values, so `xs` must be found
                            .unwrap_or_else(|| unreachable!())
                    })
                    .collect()
            })
            .collect();

        for (indices, value) in subgrid.indexed_iter() {
            let scale_indices = &indices[..scale_dims];
            let fac = fac_values[grid.scales().fac.node_index(scale_indices)];

            // skip entries that belong to a different operator slice
            if !subgrid::node_value_eq(xif * xif * fac, fac1) {
                continue;
            }

            let als = if order.alphas == 0 {
                1.0
            } else {
                let mur2 = xir * xir * ren_values[grid.scales().ren.node_index(scale_indices)];

                alphas_table
                    .ren1
                    .iter()
                    .zip(&alphas_table.alphas)
                    .find_map(|(&ren1, &alphas)| {
                        subgrid::node_value_eq(ren1, mur2)
                            .then(|| alphas.powi(order.alphas.into()))
                    })
                    .ok_or_else(|| {
                        Error::config(format!("no alphas for mur2 = {mur2} found"))
                    })?
            };

            zero = false;

            for (target, (&index, x1_indices)) in x1_idx
                .iter_mut()
                .zip(indices[scale_dims..].iter().zip(&x1_indices))
            {
                *target = x1_indices[index];
            }

            array[x1_idx.as_slice()] += als * logs * value;
        }
    }

    Ok((x1n, (!zero).then_some(array)))
}

pub(crate) fn evolve_slice(
    grid: &Grid,
    operators: &[ArrayView4<f64>],
    infos: &[OperatorSliceInfo],
    order_mask: &[bool],
    xi: (f64, f64, f64),
    alphas_table: &AlphasTable,
) -> Result<(Array3<SubgridEnum>, Vec<Channel>)> {
    debug_assert_eq!(operators.len(), infos.len());
    debug_assert_eq!(operators.len(), grid.convolutions().len());

    if grid.scales().fac.index().is_none() {
        return Err(Error::config(
            "the grid has no factorization scale that could be evolved",
        ));
    }

    let fac1 = infos[0].fac1;

    let (pid_indices, pids01): (Vec<_>, Vec<_>) = izip!(0..infos.len(), operators, infos)
        .map(|(d, operator, info)| {
            pid_slices(operator, info, &|pid1| {
                grid.channels()
                    .iter()
                    .flat_map(Channel::terms)
                    .any(|(pids, _)| pids[d] == pid1)
            })
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .unzip();

    let mut channels0: Vec<_> = pids01
        .iter()
        .map(|pids| pids.iter().map(|&(pid0, _)| pid0))
        .multi_cartesian_product()
        .collect();
    channels0.sort_unstable();
    channels0.dedup();
    let channels0 = channels0;

    let bins = grid.bins().bins();
    let mut sub_fk_tables = Vec::with_capacity(bins * channels0.len());

    let mut last_x1 = vec![Vec::new(); infos.len()];
    let mut eko_slices = vec![Vec::new(); infos.len()];
    let dim: Vec<_> = infos.iter().map(|info| info.x0.len()).collect();

    for subgrids_oc in grid.subgrids().axis_iter(Axis(1)) {
        let mut tables = vec![ArrayD::zeros(dim.clone()); channels0.len()];

        for (subgrids_o, channel1) in subgrids_oc.axis_iter(Axis(1)).zip(grid.channels()) {
            let (x1, array) = subgrid_orders_to_dense_slice(
                grid,
                fac1,
                &subgrids_o,
                order_mask,
                xi,
                alphas_table,
            )?;

            // skip zero arrays to speed up evolution and to avoid problems with NaNs
            let Some(array) = array else {
                continue;
            };

            // re-slice the operators only when the x nodes changed
            for (last_x1, x1, pid_indices, slices, operator, info) in izip!(
                &mut last_x1,
                x1,
                &pid_indices,
                &mut eko_slices,
                operators,
                infos
            ) {
                if (last_x1.len() != x1.len())
                    || last_x1
                        .iter()
                        .zip(x1.iter())
                        .any(|(&lhs, &rhs)| !subgrid::node_value_eq(lhs, rhs))
                {
                    *slices = operator_slices(operator, info, pid_indices, &x1)?;
                    *last_x1 = x1;
                }
            }

            for (pids1, factor) in channel1.terms() {
                for (fk_table, ops) in
                    channels0
                        .iter()
                        .zip(tables.iter_mut())
                        .filter_map(|(pids0, fk_table)| {
                            izip!(pids0, pids1, &pids01, &eko_slices)
                                .map(|(&pid0, &pid1, pids, slices)| {
                                    pids.iter().zip(slices).find_map(|(&(p0, p1), op)| {
                                        ((p0 == pid0) && (p1 == pid1)).then_some(op)
                                    })
                                })
                                .collect::<Option<Vec<_>>>()
                                .map(|ops| (fk_table, ops))
                        })
                {
                    general_tensor_mul(*factor, &array, &ops, fk_table);
                }
            }
        }

        let mut node_values = vec![vec![infos[0].fac0]];

        for info in infos {
            node_values.push(info.x0.clone());
        }

        sub_fk_tables.extend(tables.into_iter().map(|table| {
            let mut array =
                SliceStack::new(node_values.iter().map(Vec::len).collect());
            array.import_slice(0, table.view());

            ImportSubgrid::new(array, node_values.clone()).into()
        }));
    }

    Ok((
        Array1::from_iter(sub_fk_tables)
            .into_shape((1, bins, channels0.len()))
            // UNWRAP: the shape is exactly the number of collected tables
            .unwrap_or_else(|_| unreachable!()),
        channels0
            .into_iter()
            .map(|pids| Channel::new(vec![(pids, 1.0)]))
            .collect(),
    ))
}

fn general_tensor_mul(
    factor: f64,
    array: &ArrayD<f64>,
    ops: &[&Array2<f64>],
    fk_table: &mut ArrayD<f64>,
) {
    match array.shape().len() {
        1 => {
            let array = array
                .view()
                .into_dimensionality::<Ix1>()
                .unwrap_or_else(|_| unreachable!());
            let mut fk_table = fk_table
                .view_mut()
                .into_dimensionality::<Ix1>()
                .unwrap_or_else(|_| unreachable!());
            fk_table.scaled_add(factor, &ops[0].dot(&array));
        }
        2 => {
            let array = array
                .view()
                .into_dimensionality::<Ix2>()
                .unwrap_or_else(|_| unreachable!());
            let mut fk_table = fk_table
                .view_mut()
                .into_dimensionality::<Ix2>()
                .unwrap_or_else(|_| unreachable!());

            let mut tmp = Array2::zeros((array.shape()[0], ops[1].shape()[0]));
            // tmp = array * ops[1]^T
            linalg::general_mat_mul(1.0, &array, &ops[1].t(), 0.0, &mut tmp);
            // fk_table += factor * ops[0] * tmp
            linalg::general_mat_mul(factor, ops[0], &tmp, 1.0, &mut fk_table);
        }
        // more than two convolutions are rejected before this is ever reached
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bins::BinLimits;
    use crate::channel;
    use crate::conv::Convolution;
    use crate::interp::{Bounds, InterpAxis, Map, Reweight, ScaleChoice, Scales};
    use crate::order::Order;
    use float_cmp::assert_approx_eq;

    fn test_grid() -> Grid {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(1, 0, 0, 0, 0)],
            vec![channel![[21, 21] => 1.0]],
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
                ren: ScaleChoice::Node(0),
                fac: ScaleChoice::Node(0),
                frg: ScaleChoice::None,
            },
        )
        .unwrap();

        grid.fill(0, 0.5, 0, &[10000.0, 0.25, 0.5], 1.0).unwrap();

        grid
    }

    #[test]
    fn alphas_table_from_grid() {
        let grid = test_grid();
        let table = AlphasTable::from_grid(&grid, 1.0, &|mur2| 1.0 / mur2.ln());

        // one entry per scale node touched by the fill
        assert_eq!(table.ren1.len(), 4);
        assert!(table.ren1.windows(2).all(|pair| pair[0] < pair[1]));

        for (&ren1, &alphas) in table.ren1.iter().zip(&table.alphas) {
            assert_approx_eq!(f64, alphas, 1.0 / ren1.ln(), ulps = 2);
        }
    }

    #[test]
    fn evolve_info_collects_nodes() {
        let grid = test_grid();
        let info = grid.evolve_info(&[]);

        assert_eq!(info.fac1.len(), 4);
        assert_eq!(info.ren1, info.fac1);
        assert!(info.frg1.is_empty());
        assert_eq!(info.pids1, [21]);
        // four nodes per momentum fraction, and the two windows do not overlap
        assert_eq!(info.x1.len(), 8);
    }
}
