//! Module for everything related to convolution functions.

use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::interp::{Kinematic, Scales};
use crate::pids;
use crate::subgrid::{self, Subgrid, SubgridEnum};
use itertools::izip;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

const REN_IDX: usize = 0;
const FAC_IDX: usize = 1;
const FRG_IDX: usize = 2;
const SCALES_CNT: usize = 3;

/// The type of a convolution function.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ConvKind {
    /// Unpolarized parton distribution function.
    UnpolPdf,
    /// Polarized parton distribution function.
    PolPdf,
    /// Unpolarized fragmentation function.
    UnpolFrag,
    /// Polarized fragmentation function.
    PolFrag,
}

impl ConvKind {
    /// Returns `true` if this is a parton distribution function.
    #[must_use]
    pub const fn is_pdf(&self) -> bool {
        matches!(self, Self::UnpolPdf | Self::PolPdf)
    }
}

/// Data type that identifies different types of convolutions.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Convolution {
    kind: ConvKind,
    pid: i32,
}

impl Convolution {
    /// Constructor.
    #[must_use]
    pub const fn new(kind: ConvKind, pid: i32) -> Self {
        Self { kind, pid }
    }

    /// Return the convolution with the PID charge conjugated.
    #[must_use]
    pub const fn cc(&self) -> Self {
        Self {
            kind: self.kind,
            pid: pids::charge_conjugate_pdg_pid(self.pid),
        }
    }

    /// Return the PID of the convolution.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Return the type of this convolution.
    #[must_use]
    pub const fn kind(&self) -> ConvKind {
        self.kind
    }
}

struct Cache1d<'a> {
    xfx: &'a mut dyn FnMut(i32, f64, f64) -> f64,
    cache: FxHashMap<(i32, usize, usize), f64>,
    conv: Convolution,
}

/// A cache for evaluating convolution functions. Methods like
/// [`Grid::convolve`](crate::grid::Grid::convolve) accept instances of this `struct` instead of
/// the functions themselves.
pub struct ConvCache<'a> {
    caches: Vec<Cache1d<'a>>,
    alphas: &'a mut dyn FnMut(f64) -> f64,
    alphas_cache: Vec<f64>,
    mu2: [Vec<f64>; SCALES_CNT],
    x_grid: Vec<f64>,
}

impl<'a> ConvCache<'a> {
    /// Constructor. The `convolutions` describe which function each of the `xfx` oracles
    /// evaluates; `alphas` must return the strong coupling at a given squared renormalization
    /// scale. Each `xfx` oracle is called as `xfx(pid, x, mu2)` and must return the
    /// momentum-fraction-weighted value `x f(x, mu2)`, the division by `x` happens inside the
    /// cache.
    ///
    /// # Panics
    ///
    /// Panics if the number of `convolutions` differs from the number of `xfx` oracles.
    #[must_use]
    pub fn new(
        convolutions: Vec<Convolution>,
        xfx: Vec<&'a mut dyn FnMut(i32, f64, f64) -> f64>,
        alphas: &'a mut dyn FnMut(f64) -> f64,
    ) -> Self {
        assert_eq!(convolutions.len(), xfx.len());

        Self {
            caches: xfx
                .into_iter()
                .zip(convolutions)
                .map(|(xfx, conv)| Cache1d {
                    xfx,
                    cache: FxHashMap::default(),
                    conv,
                })
                .collect(),
            alphas,
            alphas_cache: Vec::new(),
            mu2: [Vec::new(), Vec::new(), Vec::new()],
            x_grid: Vec::new(),
        }
    }

    pub(crate) fn new_grid_conv_cache<'b>(
        &'b mut self,
        grid: &Grid,
        xi: &[(f64, f64, f64)],
    ) -> Result<GridConvCache<'a, 'b>> {
        self.clear();

        // per scale kind, the distinct variation factors
        let scales: [_; SCALES_CNT] = grid.scales().into();
        let xi: Vec<_> = (0..SCALES_CNT)
            .map(|idx| {
                let mut vars: Vec<_> = xi
                    .iter()
                    .map(|&x| <[_; SCALES_CNT]>::from(x)[idx])
                    .collect();
                vars.sort_by(f64::total_cmp);
                vars.dedup();
                vars
            })
            .collect();

        for (result, scale, xi) in izip!(&mut self.mu2, scales, xi) {
            result.clear();
            result.extend(
                grid.subgrids()
                    .iter()
                    .filter(|subgrid| !subgrid.is_empty())
                    .flat_map(|subgrid| {
                        scale
                            .calc(&subgrid.node_values(), grid.kinematics())
                            .to_vec()
                    })
                    .flat_map(|scale| xi.iter().map(move |&xi| xi * xi * scale)),
            );
            result.sort_by(f64::total_cmp);
            result.dedup();
        }

        let mut x_grid: Vec<_> = grid
            .subgrids()
            .iter()
            .filter(|subgrid| !subgrid.is_empty())
            .flat_map(|subgrid| {
                grid.kinematics()
                    .iter()
                    .zip(subgrid.node_values())
                    .filter(|(kin, _)| matches!(kin, Kinematic::X(_)))
                    .flat_map(|(_, node_values)| node_values)
            })
            .collect();
        x_grid.sort_by(f64::total_cmp);
        x_grid.dedup();

        self.alphas_cache = self.mu2[REN_IDX]
            .iter()
            .map(|&mur2| (self.alphas)(mur2))
            .collect();
        self.x_grid = x_grid;

        // map every grid convolution onto a caller-supplied oracle, possibly charge conjugated
        let perm = grid
            .convolutions()
            .iter()
            .map(|grid_conv| {
                self.caches
                    .iter()
                    .enumerate()
                    .rev()
                    .find_map(|(idx, Cache1d { conv, .. })| {
                        if grid_conv == conv {
                            Some((idx, false))
                        } else if *grid_conv == conv.cc() {
                            Some((idx, true))
                        } else {
                            None
                        }
                    })
                    .ok_or_else(|| {
                        Error::config(format!(
                            "no convolution function for {grid_conv:?} was supplied"
                        ))
                    })
            })
            .collect::<Result<_>>()?;

        Ok(GridConvCache {
            cache: self,
            perm,
            imu2: [Vec::new(), Vec::new(), Vec::new()],
            scales: *grid.scales(),
            ix: Vec::new(),
        })
    }

    /// Clears the cache.
    pub fn clear(&mut self) {
        self.alphas_cache.clear();
        for xfx_cache in &mut self.caches {
            xfx_cache.cache.clear();
        }
        for scales in &mut self.mu2 {
            scales.clear();
        }
        self.x_grid.clear();
    }
}

/// A [`ConvCache`] together with the index translations for one particular grid.
pub struct GridConvCache<'a, 'b> {
    cache: &'b mut ConvCache<'a>,
    perm: Vec<(usize, bool)>,
    imu2: [Vec<usize>; SCALES_CNT],
    scales: Scales,
    ix: Vec<Vec<usize>>,
}

impl GridConvCache<'_, '_> {
    /// Evaluate the product of the convolution functions for the flavors `pdg_ids` at the
    /// subgrid index `indices`, including `as_order` powers of the strong coupling.
    pub fn as_fx_prod(&mut self, pdg_ids: &[i32], as_order: u8, indices: &[usize]) -> f64 {
        // the first indices are the scale axes, the remainder the momentum fractions
        let x_start = indices.len() - pdg_ids.len();
        let indices_scales = &indices[0..x_start];
        let indices_x = &indices[x_start..];

        let ix = self.ix.iter().zip(indices_x).map(|(ix, &index)| ix[index]);
        let idx_pid = self.perm.iter().zip(pdg_ids).map(|(&(idx, cc), &pdg_id)| {
            (
                idx,
                if cc {
                    pids::charge_conjugate_pdg_pid(pdg_id)
                } else {
                    pdg_id
                },
            )
        });

        let fx_prod: f64 = ix
            .zip(idx_pid)
            .map(|(ix, (idx, pid))| {
                let Cache1d { xfx, cache, conv } = &mut self.cache.caches[idx];

                let (scale, scale_idx) = if conv.kind().is_pdf() {
                    (FAC_IDX, self.scales.fac.node_index(indices_scales))
                } else {
                    (FRG_IDX, self.scales.frg.node_index(indices_scales))
                };

                let imu2 = self.imu2[scale][scale_idx];
                let mu2 = self.cache.mu2[scale][imu2];

                *cache.entry((pid, ix, imu2)).or_insert_with(|| {
                    let x = self.cache.x_grid[ix];
                    xfx(pid, x, mu2) / x
                })
            })
            .product();
        let alphas_powers = if as_order == 0 {
            1.0
        } else {
            let ren_scale_idx = self.scales.ren.node_index(indices_scales);
            self.cache.alphas_cache[self.imu2[REN_IDX][ren_scale_idx]].powi(as_order.into())
        };

        fx_prod * alphas_powers
    }

    /// Set the node values of the subgrid that is convolved next.
    pub fn set_grids(&mut self, grid: &Grid, subgrid: &SubgridEnum, xi: (f64, f64, f64)) {
        let node_values = subgrid.node_values();
        let kinematics = grid.kinematics();
        let scales: [_; SCALES_CNT] = grid.scales().into();
        let xi: [_; SCALES_CNT] = xi.into();

        for (result, values, scale, xi) in izip!(&mut self.imu2, &self.cache.mu2, scales, xi) {
            result.clear();
            result.extend(scale.calc(&node_values, kinematics).iter().map(|&s| {
                values
                    .iter()
                    .position(|&value| subgrid::node_value_eq(value, xi * xi * s))
                    // UNWRAP: if this fails, `new_grid_conv_cache` hasn't been called properly
                    .unwrap_or_else(|| unreachable!())
            }));
        }

        self.ix = (0..grid.convolutions().len())
            .map(|idx| {
                kinematics
                    .iter()
                    .zip(&node_values)
                    .find_map(|(kin, node_values)| {
                        matches!(kin, &Kinematic::X(index) if index == idx).then_some(node_values)
                    })
                    // UNWRAP: guaranteed by the grid constructor
                    .unwrap_or_else(|| unreachable!())
                    .iter()
                    .map(|&xd| {
                        self.cache
                            .x_grid
                            .iter()
                            .position(|&x| subgrid::node_value_eq(xd, x))
                            .unwrap_or_else(|| unreachable!())
                    })
                    .collect()
            })
            .collect();
    }
}
