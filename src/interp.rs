//! Interpolation axes and the Lagrange fill distribution.

use crate::error::{Error, Result};
use crate::slice_stack::{self, SliceStack, MAX_DIMS};
use arrayvec::ArrayVec;
use itertools::{izip, Itertools};
use serde::{Deserialize, Serialize};
use std::mem;

const MAX_DEGREE_PLUS_ONE: usize = 8;

mod applgrid {
    pub fn reweight_x(x: f64) -> f64 {
        (x.sqrt() / (1.0 - 0.99 * x)).powi(3)
    }

    pub fn fx2(y: f64) -> f64 {
        let mut yp = y;

        for _ in 0..100 {
            let x = (-yp).exp();
            let delta = y - yp - 5.0 * (1.0 - x);
            if delta.abs() < 1e-12 {
                return x;
            }
            let deriv = -1.0 - 5.0 * x;
            yp -= delta / deriv;
        }

        unreachable!();
    }

    pub fn fy2(x: f64) -> f64 {
        (1.0 - x).mul_add(5.0, -x.ln())
    }

    pub fn ftau0(q2: f64) -> f64 {
        (q2 / 0.0625).ln().ln()
    }

    pub fn fq20(tau: f64) -> f64 {
        0.0625 * tau.exp().exp()
    }
}

pub(crate) fn f64_from_usize(x: usize) -> f64 {
    // interpolation sizes comfortably fit into the f64 mantissa
    f64::from(u32::try_from(x).unwrap_or(u32::MAX))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn usize_from_f64(x: f64) -> usize {
    x.max(0.0) as usize
}

fn lagrange_weights(i: usize, n: usize, u: f64) -> f64 {
    let mut factorials = 1;
    let mut product = 1.0;
    for z in 0..i {
        product *= u - f64_from_usize(z);
        factorials *= i - z;
    }
    for z in i + 1..=n {
        product *= f64_from_usize(z) - u;
        factorials *= z - i;
    }
    product / f64_from_usize(factorials)
}

/// Reweighting applied to fill weights so that structure functions are interpolated instead of
/// raw weights.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Reweight {
    /// The APPLgrid weight function for momentum fractions.
    XGrid,
    /// No reweighting.
    None,
}

/// Mapping between interpolated coordinates and equally spaced internal nodes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Map {
    /// `y = -ln(x) + 5 (1 - x)`, suited for momentum fractions.
    LogPlusLinear,
    /// `tau = ln(ln(q2 / 0.0625))`, suited for squared scales.
    DoubleLog,
}

/// What happens when a fill coordinate falls outside the interpolation domain.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Bounds {
    /// The fill fails with [`Error::Domain`].
    Reject,
    /// The coordinate is clamped to the nearest domain edge.
    Clamp,
}

/// A single interpolation axis.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InterpAxis {
    xmin: f64,
    xmax: f64,
    // domain limits after applying the map, ordered
    min: f64,
    max: f64,
    nodes: usize,
    degree: usize,
    reweight: Reweight,
    map: Map,
    bounds: Bounds,
}

impl InterpAxis {
    /// Constructor.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is empty or non-finite, if there are no nodes, if the
    /// interpolation degree does not leave enough nodes or if it exceeds the supported maximum.
    pub fn new(
        min: f64,
        max: f64,
        nodes: usize,
        degree: usize,
        reweight: Reweight,
        map: Map,
        bounds: Bounds,
    ) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min <= max && min > 0.0) {
            return Err(Error::config(format!(
                "invalid interpolation domain [{min}, {max}]"
            )));
        }
        if nodes == 0 {
            return Err(Error::config("interpolation must have at least one node"));
        }
        // for each interpolated point `degree + 1` nodes are updated
        if nodes <= degree {
            return Err(Error::config(format!(
                "interpolation degree {degree} needs more than {nodes} nodes"
            )));
        }
        if degree >= MAX_DEGREE_PLUS_ONE {
            return Err(Error::config(format!(
                "interpolation degree {degree} exceeds the supported maximum"
            )));
        }

        let mut result = Self {
            xmin: min,
            xmax: max,
            min: 0.0,
            max: 0.0,
            nodes,
            degree,
            reweight,
            map,
            bounds,
        };

        result.min = result.map_x_to_y(min);
        result.max = result.map_x_to_y(max);

        // some maps reverse the orientation of the domain
        if result.min > result.max {
            mem::swap(&mut result.min, &mut result.max);
        }

        Ok(result)
    }

    fn deltay(&self) -> f64 {
        if self.nodes == 1 {
            0.0
        } else {
            (self.max - self.min) / f64_from_usize(self.nodes - 1)
        }
    }

    fn gety(&self, index: usize) -> f64 {
        f64_from_usize(index).mul_add(self.deltay(), self.min)
    }

    /// Returns the reweighting factor for the coordinate `x`.
    #[must_use]
    pub fn reweight(&self, x: f64) -> f64 {
        match self.reweight {
            Reweight::XGrid => applgrid::reweight_x(x),
            Reweight::None => 1.0,
        }
    }

    // Lagrange interpolant of the reweighting factor over the `node_weights.len()` nodes
    // starting at `index`
    fn interpolated_reweight(&self, index: usize, node_weights: &[f64]) -> f64 {
        match self.reweight {
            Reweight::None => 1.0,
            Reweight::XGrid => node_weights
                .iter()
                .enumerate()
                .map(|(i, &weight)| {
                    weight * applgrid::reweight_x(self.map_y_to_x(self.gety(index + i)))
                })
                .sum(),
        }
    }

    /// Returns the first node index touched by an interpolation at `x` together with the
    /// fractional distance from that node, or `None` if `x` falls outside the domain and this
    /// axis rejects such coordinates.
    #[must_use]
    pub fn project(&self, x: f64) -> Option<(usize, f64)> {
        // momentum fractions outside [0, 1] are unphysical and would produce NaNs in the map
        let x = match self.map {
            Map::LogPlusLinear => x.clamp(0.0, 1.0),
            Map::DoubleLog => x,
        };
        let mut y = self.map_x_to_y(x);

        if y < self.min || y > self.max {
            match self.bounds {
                Bounds::Reject => return None,
                Bounds::Clamp => y = y.clamp(self.min, self.max),
            }
        }

        if self.nodes == 1 {
            Some((0, 0.0))
        } else {
            let index = usize_from_f64(
                (y - self.min) / self.deltay() - f64_from_usize(self.degree / 2),
            )
            .min(self.nodes - self.degree - 1);
            let fraction = (y - self.gety(index)) / self.deltay();

            Some((index, fraction))
        }
    }

    /// Returns the Lagrange basis weights of all `degree + 1` nodes for the fractional node
    /// distance `fraction`.
    #[must_use]
    pub fn node_weights(&self, fraction: f64) -> ArrayVec<f64, MAX_DEGREE_PLUS_ONE> {
        (0..=self.degree)
            .map(|i| lagrange_weights(i, self.degree, fraction))
            .collect()
    }

    /// Returns the interpolation degree.
    #[must_use]
    pub const fn degree(&self) -> usize {
        self.degree
    }

    /// Returns the number of nodes.
    #[must_use]
    pub const fn nodes(&self) -> usize {
        self.nodes
    }

    /// Returns the coordinates of all nodes.
    #[must_use]
    pub fn node_values(&self) -> Vec<f64> {
        if self.nodes == 1 {
            // a single node reproduces its coordinate exactly
            return vec![self.xmin];
        }

        (0..self.nodes)
            .map(|node| self.map_y_to_x(self.gety(node)))
            .collect()
    }

    /// Returns the domain of this axis.
    #[must_use]
    pub const fn domain(&self) -> (f64, f64) {
        (self.xmin, self.xmax)
    }

    /// Returns the coordinate map of this axis.
    #[must_use]
    pub const fn map(&self) -> Map {
        self.map
    }

    /// Returns the axis restricted to the nodes in `range`.
    pub(crate) fn sub_range(&self, range: std::ops::Range<usize>) -> Self {
        debug_assert!(!range.is_empty() && range.end <= self.nodes);

        let min = self.gety(range.start);
        let max = self.gety(range.end - 1);
        let (x0, x1) = (self.map_y_to_x(min), self.map_y_to_x(max));

        Self {
            xmin: x0.min(x1),
            xmax: x0.max(x1),
            min,
            max,
            nodes: range.len(),
            degree: self.degree.min(range.len() - 1),
            reweight: self.reweight,
            map: self.map,
            bounds: self.bounds,
        }
    }

    /// Returns an axis with a single node at `value`, keeping the reweighting of `self`.
    pub(crate) fn single_node(&self, value: f64) -> Self {
        let y = match self.map {
            Map::LogPlusLinear => applgrid::fy2(value),
            Map::DoubleLog => applgrid::ftau0(value),
        };

        Self {
            xmin: value,
            xmax: value,
            min: y,
            max: y,
            nodes: 1,
            degree: 0,
            reweight: self.reweight,
            map: self.map,
            bounds: self.bounds,
        }
    }

    pub(crate) fn domain_error(&self, x: f64) -> Error {
        Error::Domain {
            value: x,
            min: self.xmin,
            max: self.xmax,
        }
    }

    fn map_y_to_x(&self, y: f64) -> f64 {
        match self.map {
            Map::LogPlusLinear => applgrid::fx2(y),
            Map::DoubleLog => applgrid::fq20(y),
        }
    }

    fn map_x_to_y(&self, x: f64) -> f64 {
        match self.map {
            Map::LogPlusLinear => applgrid::fy2(x),
            Map::DoubleLog => applgrid::ftau0(x),
        }
    }
}

/// Distribute `weight` for the coordinates `ntuple` over the interpolation nodes of `axes`,
/// accumulating into `array`. The reweighting factors of the axes are divided out with their
/// interpolated values, so that the node-value multiplication at readout cancels them and the
/// sum over the reweighted entries reproduces `weight` up to round-off. Returns `Ok(false)` if
/// nothing was filled because the weight is zero.
///
/// # Errors
///
/// Returns an error if a coordinate falls outside the domain of an axis with the
/// [`Bounds::Reject`] policy.
pub fn distribute(
    axes: &[InterpAxis],
    ntuple: &[f64],
    weight: f64,
    array: &mut SliceStack,
) -> Result<bool> {
    debug_assert_eq!(axes.len(), ntuple.len());
    debug_assert_eq!(axes.len(), array.shape().len());

    if weight == 0.0 {
        return Ok(false);
    }

    let mut indices: ArrayVec<usize, MAX_DIMS> = ArrayVec::new();
    let mut fractions: ArrayVec<f64, MAX_DIMS> = ArrayVec::new();

    for (axis, &x) in axes.iter().zip(ntuple) {
        let (index, fraction) = axis.project(x).ok_or_else(|| axis.domain_error(x))?;
        indices.push(index);
        fractions.push(fraction);
    }

    let node_weights: ArrayVec<_, MAX_DIMS> = axes
        .iter()
        .zip(fractions)
        .map(|(axis, fraction)| axis.node_weights(fraction))
        .collect();

    let weight = weight
        / izip!(axes, &indices, &node_weights)
            .map(|(axis, &index, weights)| axis.interpolated_reweight(index, weights))
            .product::<f64>();

    let shape: ArrayVec<_, MAX_DIMS> = axes.iter().map(|axis| axis.degree() + 1).collect();

    for (i, node_weights) in node_weights
        .into_iter()
        .multi_cartesian_product()
        .enumerate()
    {
        let mut index = slice_stack::unravel_index(i, &shape);
        for (entry, start_index) in index.iter_mut().zip(&indices) {
            *entry += start_index;
        }
        array.add(&index, weight * node_weights.iter().product::<f64>());
    }

    Ok(true)
}

/// Assigns a meaning to every [`SliceStack`] axis of the subgrids of a grid.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Kinematic {
    /// The axis runs over the nodes of the squared scale with the given index.
    Scale(usize),
    /// The axis runs over the nodes of the momentum fraction of the convolution with the given
    /// index.
    X(usize),
}

/// Where a grid takes one of its scales from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ScaleChoice {
    /// The scale is not used.
    None,
    /// The scale is read off the kinematic scale axis with the given index.
    Node(usize),
}

impl ScaleChoice {
    /// Returns the index of the scale axis this choice reads from, if any.
    #[must_use]
    pub const fn index(&self) -> Option<usize> {
        match *self {
            Self::None => None,
            Self::Node(index) => Some(index),
        }
    }

    /// Returns the scale node values this choice selects from a subgrid's `node_values`.
    #[must_use]
    pub fn calc<'a>(
        &self,
        node_values: &'a [Vec<f64>],
        kinematics: &[Kinematic],
    ) -> &'a [f64] {
        match *self {
            Self::None => &[],
            Self::Node(index) => {
                if node_values.is_empty() {
                    &[]
                } else {
                    &node_values[kinematics
                        .iter()
                        .position(|&kin| kin == Kinematic::Scale(index))
                        // UNWRAP: guaranteed by the grid constructor
                        .unwrap_or_else(|| unreachable!())]
                }
            }
        }
    }

    /// Returns the index into [`Self::calc`]'s result for the scale part of a subgrid index.
    #[must_use]
    pub fn node_index(&self, scale_indices: &[usize]) -> usize {
        match *self {
            Self::None => unreachable!(),
            Self::Node(index) => scale_indices[index],
        }
    }
}

/// The renormalization, factorization and fragmentation scales of a grid.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Scales {
    /// Choice of the renormalization scale.
    pub ren: ScaleChoice,
    /// Choice of the factorization scale.
    pub fac: ScaleChoice,
    /// Choice of the fragmentation scale.
    pub frg: ScaleChoice,
}

impl<'a> From<&'a Scales> for [&'a ScaleChoice; 3] {
    fn from(scales: &'a Scales) -> Self {
        [&scales.ren, &scales.fac, &scales.frg]
    }
}

impl Scales {
    /// Returns `true` if all used scales can be read off the given kinematics.
    #[must_use]
    pub fn compatible_with(&self, kinematics: &[Kinematic]) -> bool {
        [self.ren, self.fac, self.frg]
            .into_iter()
            .filter_map(|choice| choice.index())
            .all(|index| kinematics.contains(&Kinematic::Scale(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn scale_axis() -> InterpAxis {
        InterpAxis::new(
            1e2,
            1e8,
            40,
            3,
            Reweight::None,
            Map::DoubleLog,
            Bounds::Reject,
        )
        .unwrap()
    }

    fn x_axis() -> InterpAxis {
        InterpAxis::new(
            2e-7,
            1.0,
            50,
            3,
            Reweight::XGrid,
            Map::LogPlusLinear,
            Bounds::Reject,
        )
        .unwrap()
    }

    #[test]
    fn node_values_match_references() {
        let q2_reference = [
            9.9999999999999986e1,
            1.2242682307575689e2,
            1.5071735829758390e2,
            1.8660624792652183e2,
            2.3239844323901826e2,
            2.9117504454783159e2,
            3.6707996194452909e2,
            4.6572167648697109e2,
            5.9473999989302229e2,
            7.6461095796663312e2,
            9.8979770734783131e2,
            1.2904078604330668e3,
            1.6945973073289490e3,
            2.2420826491130997e3,
            2.9893125907295248e3,
            4.0171412997902630e3,
            5.4423054291935287e3,
            7.4347313816879214e3,
            1.0243854670019169e4,
            1.4238990475802799e4,
            1.9971806922234402e4,
            2.8273883344269376e4,
            4.0410482328443621e4,
            5.8325253189217328e4,
            8.5033475340946548e4,
            1.2526040013230646e5,
            1.8648821332147921e5,
            2.8069149021747953e5,
            4.2724538080621109e5,
            6.5785374312992941e5,
            1.0249965523865514e6,
            1.6165812577807596e6,
            2.5816634211063879e6,
            4.1761634755570055e6,
            6.8451673415389210e6,
            1.1373037585359517e7,
            1.9160909972020049e7,
            3.2746801715531096e7,
            5.6794352823474184e7,
            9.9999999999999493e7,
        ];

        let scale_nodes = scale_axis().node_values();
        assert_eq!(scale_nodes.len(), 40);
        for (&node, ref_node) in scale_nodes.iter().zip(q2_reference) {
            assert_approx_eq!(f64, node, ref_node, ulps = 4);
        }

        let x_nodes = x_axis().node_values();
        assert_eq!(x_nodes.len(), 50);
        assert_approx_eq!(f64, x_nodes[0], 1.0, ulps = 4);
        assert_approx_eq!(f64, x_nodes[1], 9.3094408087175440e-1, ulps = 4);
        assert_approx_eq!(f64, x_nodes[24], 6.4962061946337987e-3, ulps = 4);
        assert_approx_eq!(f64, x_nodes[49], 1.9999999999999954e-7, ulps = 4);
    }

    #[test]
    fn distribute_two_points() {
        let axes = vec![scale_axis(), x_axis(), x_axis()];
        let mut array = SliceStack::new(vec![40, 50, 50]);

        for ntuple in [[100000.0, 0.25, 0.5], [1000.0, 0.5, 0.5]] {
            assert!(distribute(&axes, &ntuple, 1.0, &mut array).unwrap());
        }

        // a spot check of the interpolation reference values
        let reference = [
            (vec![9, 6, 6], -4.1293506852644830e-6),
            (vec![9, 6, 7], 3.1145146113105685e-5),
            (vec![9, 6, 8], 6.0578606836387660e-5),
            (vec![9, 6, 9], -5.1185438996145770e-6),
        ];

        let filled: Vec<_> = array.indexed_iter().collect();
        assert_eq!(filled.len(), 128);

        for ((index, value), (ref_index, ref_value)) in filled.iter().zip(reference) {
            assert_eq!(*index, ref_index);
            assert_approx_eq!(f64, *value, ref_value, epsilon = 1e-15);
        }

        let spot = filled
            .iter()
            .find(|(index, _)| index == &[24, 12, 8])
            .unwrap();
        assert_approx_eq!(f64, spot.1, 4.4735036531804290e-1, epsilon = 1e-11);
    }

    #[test]
    fn reweighting_cancels_at_readout() {
        let axes = vec![scale_axis(), x_axis(), x_axis()];
        let node_values: Vec<Vec<f64>> = axes.iter().map(InterpAxis::node_values).collect();
        let mut array = SliceStack::new(vec![40, 50, 50]);

        distribute(&axes, &[1000.0, 0.123, 0.5], 3.0, &mut array).unwrap();
        distribute(&axes, &[250000.0, 0.018, 0.77], -0.25, &mut array).unwrap();

        // multiplying the entries with the node reweighting factors undoes the division
        // performed by `distribute`, independently of where the fills landed
        let sum: f64 = array
            .indexed_iter()
            .map(|(indices, value)| {
                value
                    * indices
                        .iter()
                        .zip(&axes)
                        .zip(&node_values)
                        .map(|((&index, axis), nodes)| axis.reweight(nodes[index]))
                        .product::<f64>()
            })
            .sum();

        assert_approx_eq!(f64, sum, 2.75, epsilon = 1e-12);
    }

    #[test]
    fn distribute_zero_weight() {
        let axes = vec![scale_axis(), x_axis(), x_axis()];
        let mut array = SliceStack::new(vec![40, 50, 50]);

        assert!(!distribute(&axes, &[1000.0, 0.5, 0.5], 0.0, &mut array).unwrap());
        assert!(array.is_empty());
    }

    #[test]
    fn reject_and_clamp() {
        let axes = vec![scale_axis(), x_axis(), x_axis()];
        let mut array = SliceStack::new(vec![40, 50, 50]);

        // the scale underflows the domain
        let err = distribute(&axes, &[10.0, 0.5, 0.5], 1.0, &mut array).unwrap_err();
        assert!(matches!(err, crate::error::Error::Domain { .. }));
        assert!(array.is_empty());

        // momentum fractions slightly above one are clamped onto the x = 1 node
        assert!(distribute(&axes, &[1000.0, 1.0 + 1e-13, 0.5], 1.0, &mut array).unwrap());
        assert_eq!(array.indexed_iter().next().unwrap().0[1], 0);
        let mut array = SliceStack::new(vec![40, 50, 50]);

        // a vanishing momentum fraction still underflows the domain
        let err = distribute(&axes, &[1000.0, 0.0, 0.5], 1.0, &mut array).unwrap_err();
        assert!(matches!(err, crate::error::Error::Domain { .. }));

        let clamping = InterpAxis::new(
            1e2,
            1e8,
            40,
            3,
            Reweight::None,
            Map::DoubleLog,
            Bounds::Clamp,
        )
        .unwrap();
        let axes = vec![clamping, x_axis(), x_axis()];

        assert!(distribute(&axes, &[10.0, 0.5, 0.5], 1.0, &mut array).unwrap());
        // clamped onto the first scale node
        assert_eq!(array.indexed_iter().next().unwrap().0[0], 0);
    }

    #[test]
    fn single_node_axis() {
        let axis = InterpAxis::new(
            8100.0,
            8100.0,
            1,
            0,
            Reweight::None,
            Map::DoubleLog,
            Bounds::Reject,
        )
        .unwrap();

        assert_eq!(axis.node_values(), [8100.0]);

        let axes = vec![axis, x_axis()];
        let mut array = SliceStack::new(vec![1, 50]);

        assert!(distribute(&axes, &[8100.0, 0.5], 1.0, &mut array).unwrap());
        let total: f64 = array.indexed_iter().map(|(_, value)| value).sum();
        assert!(total.is_finite());
    }

    #[test]
    fn invalid_axes() {
        assert!(InterpAxis::new(
            0.0,
            1.0,
            50,
            3,
            Reweight::XGrid,
            Map::LogPlusLinear,
            Bounds::Reject
        )
        .is_err());
        assert!(InterpAxis::new(
            1e2,
            1e8,
            3,
            3,
            Reweight::None,
            Map::DoubleLog,
            Bounds::Reject
        )
        .is_err());
        assert!(InterpAxis::new(
            1e2,
            1e8,
            40,
            9,
            Reweight::None,
            Map::DoubleLog,
            Bounds::Reject
        )
        .is_err());
    }
}
