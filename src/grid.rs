//! Module containing the central [`Grid`] type and supporting structures.

use crate::bins::{BinLimits, BinRemapper};
use crate::channel::Channel;
use crate::conv::{ConvCache, Convolution};
use crate::empty_subgrid::EmptySubgrid;
use crate::error::{Error, Result};
use crate::evolve::{self, AlphasTable, EvolveInfo, OperatorSliceInfo};
use crate::fill_subgrid::FillSubgrid;
use crate::fktable::FkTable;
use crate::import_subgrid::ImportSubgrid;
use crate::interp::{self, InterpAxis, Kinematic, ScaleChoice, Scales};
use crate::order::Order;
use crate::pids;
use crate::subgrid::{self, Subgrid, SubgridEnum};
use bitflags::bitflags;
use float_cmp::approx_eq;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use ndarray::{s, Array2, Array3, ArrayView3, ArrayViewMut3, Axis, CowArray, Dimension, Ix4, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::{iter, mem};

const FILE_MAGIC: &[u8; 8] = b"crmbgrid";
const FILE_VERSION: u64 = 1;

const ORDER_AXIS: Axis = Axis(0);
const BIN_AXIS: Axis = Axis(1);
const CHANNEL_AXIS: Axis = Axis(2);

bitflags! {
    /// Bitflags for optimizing a [`Grid`]. See [`Grid::optimize_using`].
    #[derive(Clone, Copy)]
    #[repr(transparent)]
    pub struct GridOptFlags: u32 {
        /// Shrink interpolation nodes to the ranges actually filled and undo the interpolation
        /// over axes that only ever saw a single coordinate.
        const OPTIMIZE_NODES = 0b1;
        /// Change the subgrid type to the most compact representation.
        const COMPACT_SUBGRIDS = 0b10;
        /// Remove all orders that do not contain any non-zero subgrids.
        const STRIP_EMPTY_ORDERS = 0b100;
        /// Remove all channels that do not contain any non-zero subgrids.
        const STRIP_EMPTY_CHANNELS = 0b1000;
        /// Remove all bins that do not contain any non-zero subgrids.
        const STRIP_EMPTY_BINS = 0b1_0000;
        /// Merge the subgrids of channels whose definitions agree up to a constant factor.
        const MERGE_SAME_CHANNELS = 0b10_0000;
    }
}

// subgrids of different types merge through the node-indexed representation
fn merge_subgrids(lhs: &mut SubgridEnum, rhs: &SubgridEnum) {
    if matches!(lhs, SubgridEnum::FillSubgrid(_)) && !matches!(rhs, SubgridEnum::FillSubgrid(_)) {
        *lhs = ImportSubgrid::from(&*lhs).into();
    }

    lhs.merge(rhs, None);
}

/// Main data structure of this crate. This structure contains a [`Subgrid`] for each
/// order, bin and channel it was created with.
#[derive(Clone, Deserialize, Serialize)]
pub struct Grid {
    subgrids: Array3<SubgridEnum>,
    bins: BinLimits,
    remapper: Option<BinRemapper>,
    orders: Vec<Order>,
    channels: Vec<Channel>,
    convolutions: Vec<Convolution>,
    axes: Vec<InterpAxis>,
    kinematics: Vec<Kinematic>,
    scales: Scales,
    metadata: BTreeMap<String, String>,
}

impl Grid {
    /// Constructor.
    ///
    /// # Errors
    ///
    /// Returns an error when the number of PIDs in any channel is not equal to
    /// `convolutions.len()`, when `axes` and `kinematics` have different lengths, when
    /// `kinematics` does not list the scale axes first and the momentum-fraction axes last, both
    /// in ascending order, or when `scales` refers to a scale axis that `kinematics` does not
    /// contain.
    pub fn new(
        bins: BinLimits,
        orders: Vec<Order>,
        channels: Vec<Channel>,
        convolutions: Vec<Convolution>,
        axes: Vec<InterpAxis>,
        kinematics: Vec<Kinematic>,
        scales: Scales,
    ) -> Result<Self> {
        for (index, channel) in channels.iter().enumerate() {
            if let Some((pids, _)) = channel
                .terms()
                .iter()
                .find(|(pids, _)| pids.len() != convolutions.len())
            {
                return Err(Error::config(format!(
                    "channel #{index} has wrong number of PIDs: expected {}, found {}",
                    convolutions.len(),
                    pids.len()
                )));
            }
        }

        if axes.len() != kinematics.len() {
            return Err(Error::config(format!(
                "axes and kinematics have different lengths: {} vs. {}",
                axes.len(),
                kinematics.len()
            )));
        }

        let scale_dims = kinematics
            .iter()
            .filter(|kin| matches!(kin, Kinematic::Scale(_)))
            .count();
        let expected: Vec<_> = (0..scale_dims)
            .map(Kinematic::Scale)
            .chain((0..kinematics.len() - scale_dims).map(Kinematic::X))
            .collect();

        if kinematics != expected {
            return Err(Error::config(
                "kinematics must list the scale axes first and the momentum-fraction axes last, \
                 both in ascending order",
            ));
        }

        if kinematics.len() - scale_dims != convolutions.len() {
            return Err(Error::config(format!(
                "expected {} momentum-fraction axes, found {}",
                convolutions.len(),
                kinematics.len() - scale_dims
            )));
        }

        if !scales.compatible_with(&kinematics) {
            return Err(Error::config(
                "scales and kinematics are not compatible with each other",
            ));
        }

        Ok(Self {
            subgrids: Array3::from_shape_simple_fn(
                (orders.len(), bins.bins(), channels.len()),
                || EmptySubgrid.into(),
            ),
            bins,
            remapper: None,
            orders,
            channels,
            convolutions,
            axes,
            kinematics,
            scales,
            metadata: BTreeMap::new(),
        })
    }

    /// Fill the grid with `weight` for the given `order`, `observable` and `channel`. The
    /// parameter `ntuple` must contain the coordinates specified by the `kinematics` parameter of
    /// [`Grid::new`] in the same order. Observables outside the bin limits are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error when `order` or `channel` are out of range, or when a coordinate falls
    /// outside the domain of an axis that rejects out-of-domain coordinates.
    pub fn fill(
        &mut self,
        order: usize,
        observable: f64,
        channel: usize,
        ntuple: &[f64],
        weight: f64,
    ) -> Result<()> {
        if order >= self.orders.len() {
            return Err(Error::Range {
                object: "orders",
                index: order,
                len: self.orders.len(),
            });
        }

        if channel >= self.channels.len() {
            return Err(Error::Range {
                object: "channels",
                index: channel,
                len: self.channels.len(),
            });
        }

        if let Some(bin) = self.bins.index(observable) {
            let subgrid = &mut self.subgrids[[order, bin, channel]];
            if let SubgridEnum::EmptySubgrid(_) = subgrid {
                *subgrid = FillSubgrid::new(&self.axes).into();
            }

            subgrid.fill(&self.axes, ntuple, weight)?;
        }

        Ok(())
    }

    /// Perform all convolutions of this grid with the functions stored in `cache`.
    ///
    /// The parameters `order_mask` and `channel_mask` select a subset of the orders and channels;
    /// empty masks select everything. An empty `bin_indices` selects all bins, otherwise results
    /// are returned for the listed bins only. For every triple in `xi` the result is evaluated
    /// with the renormalization, factorization and fragmentation scales multiplied by the
    /// respective factor; the result for bin `b` and triple `x` is stored at `x + xi.len() * b`.
    ///
    /// # Errors
    ///
    /// Returns an error when `cache` does not cover all convolutions of this grid or when a bin
    /// result is not finite.
    pub fn convolve(
        &self,
        cache: &mut ConvCache,
        order_mask: &[bool],
        bin_indices: &[usize],
        channel_mask: &[bool],
        xi: &[(f64, f64, f64)],
    ) -> Result<Vec<f64>> {
        let mut cache = cache.new_grid_conv_cache(self, xi)?;

        let bin_indices = if bin_indices.is_empty() {
            (0..self.bins.bins()).collect()
        } else {
            bin_indices.to_vec()
        };
        let mut bins = vec![0.0; bin_indices.len() * xi.len()];
        let normalizations = self.normalizations();

        for (xi_index, &xis @ (xir, xif, xia)) in xi.iter().enumerate() {
            for ((ord, bin, chan), subgrid) in self.subgrids.indexed_iter() {
                let order = &self.orders[ord];

                // log contributions vanish at the central scales
                if ((order.logxir != 0) && approx_eq!(f64, xir, 1.0, ulps = 4))
                    || ((order.logxif != 0) && approx_eq!(f64, xif, 1.0, ulps = 4))
                    || ((order.logxia != 0) && approx_eq!(f64, xia, 1.0, ulps = 4))
                {
                    continue;
                }

                if (!order_mask.is_empty() && !order_mask[ord])
                    || (!channel_mask.is_empty() && !channel_mask[chan])
                {
                    continue;
                }

                let Some(bin_index) = bin_indices.iter().position(|&index| index == bin) else {
                    continue;
                };

                if subgrid.is_empty() {
                    continue;
                }

                let channel = &self.channels[chan];
                let mut value = 0.0;

                cache.set_grids(self, subgrid, xis);

                for (idx, v) in subgrid.indexed_iter() {
                    let mut lumi = 0.0;

                    for (pids, factor) in channel.terms() {
                        lumi += cache.as_fx_prod(pids, order.alphas, &idx) * factor;
                    }

                    value += lumi * v;
                }

                if order.logxir != 0 {
                    value *= (xir * xir).ln().powi(order.logxir.into());
                }

                if order.logxif != 0 {
                    value *= (xif * xif).ln().powi(order.logxif.into());
                }

                if order.logxia != 0 {
                    value *= (xia * xia).ln().powi(order.logxia.into());
                }

                bins[xi_index + xi.len() * bin_index] += value / normalizations[bin];
            }
        }

        if let Some((index, &value)) = bins
            .iter()
            .enumerate()
            .find(|(_, value)| !value.is_finite())
        {
            return Err(Error::Numeric(format!(
                "non-finite result {value} for bin {}",
                bin_indices[index / xi.len()]
            )));
        }

        Ok(bins)
    }

    /// Construct a `Grid` by deserializing it from `reader`. Reading is buffered and
    /// transparently decompresses LZ4 frames.
    ///
    /// # Errors
    ///
    /// Returns an error when reading fails or when the byte stream is not a supported grid
    /// container.
    pub fn read(reader: impl Read) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        let buffer = reader.fill_buf()?;
        let lz4_compressed = buffer.len() >= 4
            && u32::from_le_bytes(buffer[0..4].try_into().unwrap_or_else(|_| unreachable!()))
                == 0x18_4D_22_04;

        if lz4_compressed {
            Self::read_uncompressed(BufReader::new(FrameDecoder::new(reader)))
        } else {
            Self::read_uncompressed(reader)
        }
    }

    fn read_uncompressed(mut reader: impl BufRead) -> Result<Self> {
        let buffer = reader.fill_buf()?;

        if buffer.len() < 16 || &buffer[0..8] != FILE_MAGIC {
            return Err(Error::Format(
                "the byte stream is not a grid container".to_owned(),
            ));
        }

        let file_version = u64::from_le_bytes(
            buffer[8..16].try_into().unwrap_or_else(|_| unreachable!()),
        );
        reader.consume(16);

        match file_version {
            FILE_VERSION => {
                bincode::deserialize_from(reader).map_err(|err| Error::Other(err.into()))
            }
            _ => Err(Error::Format(format!(
                "file version {file_version} is not supported"
            ))),
        }
    }

    /// Serializes `self` into `writer`. Writing is buffered.
    ///
    /// # Errors
    ///
    /// If writing fails an error is returned.
    pub fn write(&self, writer: impl Write) -> Result<()> {
        let mut writer = BufWriter::new(writer);

        writer.write_all(FILE_MAGIC)?;
        writer.write_all(&FILE_VERSION.to_le_bytes())?;

        bincode::serialize_into(writer, self).map_err(|err| Error::Other(err.into()))
    }

    /// Serializes `self` into `writer`, using LZ4 frame compression. Writing is buffered.
    ///
    /// # Errors
    ///
    /// If writing or compression fails an error is returned.
    pub fn write_lz4(&self, writer: impl Write) -> Result<()> {
        let mut encoder = FrameEncoder::new(writer);
        self.write(&mut encoder)?;
        encoder.try_finish().map_err(|err| Error::Other(err.into()))?;

        Ok(())
    }

    /// Merge non-empty subgrids contained in `other` into `self`. Channels unknown to `self` are
    /// appended, subgrids of matching channels are added cell-wise.
    ///
    /// # Errors
    ///
    /// Returns an error when `self` and `other` differ in their orders, bin limits, remappers,
    /// convolutions, kinematics, interpolation axes or scales. No mutation happens in that case.
    pub fn merge(&mut self, mut other: Self) -> Result<()> {
        if self.orders != other.orders {
            return Err(Error::config("orders do not match"));
        }
        if self.bins != other.bins {
            return Err(Error::config("bin limits do not match"));
        }
        if self.remapper != other.remapper {
            return Err(Error::config("bin remappers do not match"));
        }
        if self.convolutions != other.convolutions {
            return Err(Error::config("convolutions do not match"));
        }
        if self.kinematics != other.kinematics {
            return Err(Error::config("kinematics do not match"));
        }
        if self.axes != other.axes {
            return Err(Error::config("interpolation axes do not match"));
        }
        if self.scales != other.scales {
            return Err(Error::config("scales do not match"));
        }

        let mut new_channels: Vec<Channel> = Vec::new();

        for ((_, _, k), _) in other
            .subgrids
            .indexed_iter()
            .filter(|(_, subgrid)| !subgrid.is_empty())
        {
            let other_channel = &other.channels[k];

            if !self
                .channels
                .iter()
                .chain(new_channels.iter())
                .any(|channel| channel == other_channel)
            {
                new_channels.push(other_channel.clone());
            }
        }

        if !new_channels.is_empty() {
            let old_dim = self.subgrids.raw_dim().into_pattern();
            let mut new_subgrids = Array3::from_shape_simple_fn(
                (old_dim.0, old_dim.1, old_dim.2 + new_channels.len()),
                || EmptySubgrid.into(),
            );

            for (index, subgrid) in self.subgrids.indexed_iter_mut() {
                mem::swap(&mut new_subgrids[<[usize; 3]>::from(index)], subgrid);
            }

            self.subgrids = new_subgrids;
        }

        self.channels.append(&mut new_channels);

        for ((i, j, k), subgrid) in other
            .subgrids
            .indexed_iter_mut()
            .filter(|(_, subgrid)| !subgrid.is_empty())
        {
            let self_k = self
                .channels
                .iter()
                .position(|channel| channel == &other.channels[k])
                // UNWRAP: we added the channels previously so we must find them
                .unwrap_or_else(|| unreachable!());

            if self.subgrids[[i, j, self_k]].is_empty() {
                mem::swap(&mut self.subgrids[[i, j, self_k]], subgrid);
            } else {
                merge_subgrids(&mut self.subgrids[[i, j, self_k]], subgrid);
            }
        }

        Ok(())
    }

    /// Merge the bins in `range` together into a single one.
    ///
    /// # Errors
    ///
    /// Returns an error when `range` is not contained in the bin limits or when a bin remapper is
    /// set, whose limits a merge would invalidate.
    pub fn merge_bins(&mut self, range: Range<usize>) -> Result<()> {
        if self.remapper.is_some() {
            return Err(Error::config(
                "cannot merge bins of a grid with a bin remapper",
            ));
        }

        self.bins.merge_bins(range.clone())?;

        let (intermediate, right) = self.subgrids.view().split_at(BIN_AXIS, range.end);
        let (left, merge) = intermediate.split_at(BIN_AXIS, range.start);

        let mut merged: Array2<SubgridEnum> = Array2::from_shape_simple_fn(
            (self.orders.len(), self.channels.len()),
            || EmptySubgrid.into(),
        );

        for subview in merge.axis_iter(BIN_AXIS) {
            Zip::from(&mut merged).and(subview).for_each(|lhs, rhs| {
                if !rhs.is_empty() {
                    if lhs.is_empty() {
                        *lhs = rhs.clone();
                    } else {
                        merge_subgrids(lhs, rhs);
                    }
                }
            });
        }
        let merged = merged.insert_axis(BIN_AXIS);

        self.subgrids = ndarray::concatenate(BIN_AXIS, &[left, merged.view(), right])
            // UNWRAP: if this fails there's a bug
            .unwrap_or_else(|_| unreachable!());

        Ok(())
    }

    /// Return the orders of this grid.
    #[must_use]
    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    /// Return a mutable reference to the orders of this grid.
    #[must_use]
    pub fn orders_mut(&mut self) -> &mut [Order] {
        &mut self.orders
    }

    /// Return the order with the given `index`.
    ///
    /// # Errors
    ///
    /// Returns an error when `index` is out of range.
    pub fn order(&self, index: usize) -> Result<&Order> {
        self.orders.get(index).ok_or(Error::Range {
            object: "orders",
            index,
            len: self.orders.len(),
        })
    }

    /// Return the channels of this grid.
    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Return a mutable reference to the channels of this grid.
    pub fn channels_mut(&mut self) -> &mut [Channel] {
        &mut self.channels
    }

    /// Return the channel with the given `index`.
    ///
    /// # Errors
    ///
    /// Returns an error when `index` is out of range.
    pub fn channel(&self, index: usize) -> Result<&Channel> {
        self.channels.get(index).ok_or(Error::Range {
            object: "channels",
            index,
            len: self.channels.len(),
        })
    }

    /// Append `order` to this grid, growing the subgrid array with empty subgrids.
    pub fn push_order(&mut self, order: Order) {
        let old_dim = self.subgrids.raw_dim().into_pattern();
        let mut new_subgrids = Array3::from_shape_simple_fn(
            (old_dim.0 + 1, old_dim.1, old_dim.2),
            || EmptySubgrid.into(),
        );

        for (index, subgrid) in self.subgrids.indexed_iter_mut() {
            mem::swap(&mut new_subgrids[<[usize; 3]>::from(index)], subgrid);
        }

        self.subgrids = new_subgrids;
        self.orders.push(order);
    }

    /// Append `channel` to this grid, growing the subgrid array with empty subgrids.
    ///
    /// # Errors
    ///
    /// Returns an error when the number of PIDs in `channel` does not match the number of
    /// convolutions of this grid.
    pub fn push_channel(&mut self, channel: Channel) -> Result<()> {
        if let Some((pids, _)) = channel
            .terms()
            .iter()
            .find(|(pids, _)| pids.len() != self.convolutions.len())
        {
            return Err(Error::config(format!(
                "channel has wrong number of PIDs: expected {}, found {}",
                self.convolutions.len(),
                pids.len()
            )));
        }

        let old_dim = self.subgrids.raw_dim().into_pattern();
        let mut new_subgrids = Array3::from_shape_simple_fn(
            (old_dim.0, old_dim.1, old_dim.2 + 1),
            || EmptySubgrid.into(),
        );

        for (index, subgrid) in self.subgrids.indexed_iter_mut() {
            mem::swap(&mut new_subgrids[<[usize; 3]>::from(index)], subgrid);
        }

        self.subgrids = new_subgrids;
        self.channels.push(channel);

        Ok(())
    }

    /// Return the convolutions of this grid.
    #[must_use]
    pub fn convolutions(&self) -> &[Convolution] {
        &self.convolutions
    }

    /// Return a mutable reference to the convolutions of this grid.
    pub fn convolutions_mut(&mut self) -> &mut [Convolution] {
        &mut self.convolutions
    }

    /// Charge conjugate both the convolution function with index `convolution` and the PIDs in
    /// the channel definition corresponding to it. This leaves the results returned by
    /// [`Grid::convolve`] invariant.
    ///
    /// # Errors
    ///
    /// Returns an error when `convolution` is out of range.
    pub fn charge_conjugate(&mut self, convolution: usize) -> Result<()> {
        if convolution >= self.convolutions.len() {
            return Err(Error::Range {
                object: "convolutions",
                index: convolution,
                len: self.convolutions.len(),
            });
        }

        for channel in &mut self.channels {
            *channel = Channel::new(
                channel
                    .terms()
                    .iter()
                    .cloned()
                    .map(|(mut pids, factor)| {
                        pids[convolution] = pids::charge_conjugate_pdg_pid(pids[convolution]);
                        (pids, factor)
                    })
                    .collect(),
            );
        }

        self.convolutions[convolution] = self.convolutions[convolution].cc();

        Ok(())
    }

    /// Scale all subgrids by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.subgrids
            .iter_mut()
            .for_each(|subgrid| subgrid.scale(factor));
    }

    /// Scales each subgrid by a factor which is the product of the given values `alphas`,
    /// `alpha`, `logxir`, `logxif` and `logxia`, each raised to the corresponding exponents of
    /// the subgrid's order. In addition, every subgrid is scaled by the factor `global`
    /// independently of its order.
    pub fn scale_by_order(
        &mut self,
        alphas: f64,
        alpha: f64,
        logxir: f64,
        logxif: f64,
        logxia: f64,
        global: f64,
    ) {
        for ((i, _, _), subgrid) in self.subgrids.indexed_iter_mut() {
            let order = &self.orders[i];
            let factor = global
                * alphas.powi(order.alphas.into())
                * alpha.powi(order.alpha.into())
                * logxir.powi(order.logxir.into())
                * logxif.powi(order.logxif.into())
                * logxia.powi(order.logxia.into());

            subgrid.scale(factor);
        }
    }

    /// Scales each subgrid by a bin-dependent factor given in `factors`. If a bin does not have a
    /// corresponding entry in `factors` it is not rescaled; superfluous entries have no effect.
    pub fn scale_by_bin(&mut self, factors: &[f64]) {
        for ((_, bin, _), subgrid) in self.subgrids.indexed_iter_mut() {
            if let Some(&factor) = factors.get(bin) {
                subgrid.scale(factor);
            }
        }
    }

    /// Return the bin limits of this grid.
    #[must_use]
    pub const fn bins(&self) -> &BinLimits {
        &self.bins
    }

    /// Return the bin remapper of this grid, if any.
    #[must_use]
    pub const fn remapper(&self) -> Option<&BinRemapper> {
        self.remapper.as_ref()
    }

    /// Set a bin remapper, which overrides the one-dimensional bin limits with multi-dimensional
    /// limits and normalizations over the same storage.
    ///
    /// # Errors
    ///
    /// Returns an error when the number of bins of `remapper` does not match this grid.
    pub fn set_remapper(&mut self, remapper: BinRemapper) -> Result<()> {
        if remapper.bins() != self.bins.bins() {
            return Err(Error::config(format!(
                "remapper has {} bins, but the grid has {}",
                remapper.bins(),
                self.bins.bins()
            )));
        }

        self.remapper = Some(remapper);

        Ok(())
    }

    /// Return the normalization of every bin, either the bin sizes or the normalizations of the
    /// remapper if one is set.
    #[must_use]
    pub fn normalizations(&self) -> Vec<f64> {
        self.remapper
            .as_ref()
            .map_or_else(|| self.bins.bin_sizes(), |remapper| {
                remapper.normalizations().to_vec()
            })
    }

    /// Return all subgrids as an `ArrayView3`.
    #[must_use]
    pub fn subgrids(&self) -> ArrayView3<SubgridEnum> {
        self.subgrids.view()
    }

    /// Return all subgrids as an `ArrayViewMut3`.
    #[must_use]
    pub fn subgrids_mut(&mut self) -> ArrayViewMut3<SubgridEnum> {
        self.subgrids.view_mut()
    }

    /// Return the interpolation axes of this grid.
    #[must_use]
    pub fn axes(&self) -> &[InterpAxis] {
        &self.axes
    }

    /// Return the kinematics of this grid.
    #[must_use]
    pub fn kinematics(&self) -> &[Kinematic] {
        &self.kinematics
    }

    /// Return the scale choices of this grid.
    #[must_use]
    pub const fn scales(&self) -> &Scales {
        &self.scales
    }

    /// Return the metadata of this grid.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Return a mutable reference to the metadata of this grid.
    pub fn metadata_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.metadata
    }

    /// Calls [`Self::optimize_using`] with all possible optimization options
    /// ([`GridOptFlags::all`]).
    pub fn optimize(&mut self) {
        self.optimize_using(GridOptFlags::all());
    }

    /// Optimizes the internal datastructures for space efficiency. The parameter `flags`
    /// determines which optimizations are applied, see [`GridOptFlags`].
    pub fn optimize_using(&mut self, flags: GridOptFlags) {
        if flags.contains(GridOptFlags::OPTIMIZE_NODES) {
            self.optimize_nodes();
        }
        if flags.contains(GridOptFlags::COMPACT_SUBGRIDS) {
            self.compact_subgrids();
        }
        if flags.contains(GridOptFlags::STRIP_EMPTY_ORDERS) {
            self.strip_empty_orders();
        }
        if flags.contains(GridOptFlags::MERGE_SAME_CHANNELS) {
            self.merge_same_channels();
        }
        if flags.contains(GridOptFlags::STRIP_EMPTY_CHANNELS) {
            self.strip_empty_channels();
        }
        if flags.contains(GridOptFlags::STRIP_EMPTY_BINS) {
            self.strip_empty_bins();
        }
    }

    fn optimize_nodes(&mut self) {
        for subgrid in &mut self.subgrids {
            subgrid.optimize_nodes();
        }
    }

    fn compact_subgrids(&mut self) {
        for subgrid in &mut self.subgrids {
            if subgrid.is_empty() {
                *subgrid = EmptySubgrid.into();
            } else {
                *subgrid = ImportSubgrid::from(&*subgrid).into();
            }
        }
    }

    fn merge_same_channels(&mut self) {
        let mut indices: Vec<_> = (0..self.channels.len()).rev().collect();

        while let Some(index) = indices.pop() {
            if let Some((other_index, factor)) = indices.iter().find_map(|&i| {
                self.channels[i]
                    .common_factor(&self.channels[index])
                    .map(|factor| (i, factor))
            }) {
                let (mut a, mut b) = self
                    .subgrids
                    .multi_slice_mut((s![.., .., other_index], s![.., .., index]));

                for (lhs, rhs) in a.iter_mut().zip(b.iter_mut()) {
                    if !rhs.is_empty() {
                        rhs.scale(1.0 / factor);
                        if lhs.is_empty() {
                            *lhs = mem::replace(rhs, EmptySubgrid.into());
                        } else {
                            merge_subgrids(lhs, rhs);
                            *rhs = EmptySubgrid.into();
                        }
                    }
                }
            }
        }
    }

    fn strip_empty_channels(&mut self) {
        let mut indices: Vec<_> = (0..self.channels.len()).collect();

        while let Some(index) = indices.pop() {
            if self
                .subgrids
                .slice(s![.., .., index])
                .iter()
                .all(Subgrid::is_empty)
            {
                self.channels.remove(index);
                self.subgrids.remove_index(CHANNEL_AXIS, index);
            }
        }
    }

    fn strip_empty_orders(&mut self) {
        let mut indices: Vec<_> = (0..self.orders.len()).collect();

        while let Some(index) = indices.pop() {
            if self
                .subgrids
                .slice(s![index, .., ..])
                .iter()
                .all(Subgrid::is_empty)
            {
                self.orders.remove(index);
                self.subgrids.remove_index(ORDER_AXIS, index);
            }
        }
    }

    fn strip_empty_bins(&mut self) {
        let indices: Vec<_> = (0..self.bins.bins())
            .filter(|&bin| {
                self.subgrids
                    .slice(s![.., bin, ..])
                    .iter()
                    .all(Subgrid::is_empty)
            })
            .collect();

        self.delete_bins(&indices);
    }

    /// Try to deduplicate channels by detecting pairs of them that contain the same subgrids. The
    /// numerical equality is tested using a tolerance of `ulps`, given in units of least
    /// precision. When a pair is found the channel with the larger index is merged into the one
    /// with the smaller index.
    pub fn dedup_channels(&mut self, ulps: i64) {
        let mut indices: Vec<usize> = (0..self.channels.len()).collect();

        while let Some(index) = indices.pop() {
            if let Some(other_index) = indices.iter().copied().find(|&other_index| {
                let a = self.subgrids.slice(s![.., .., other_index]);
                let b = self.subgrids.slice(s![.., .., index]);

                // TODO: use `Iterator::eq_by` once stabilized
                for (lhs, rhs) in a.iter().zip(b.iter()) {
                    let mut it_a = lhs.indexed_iter();
                    let mut it_b = rhs.indexed_iter();

                    loop {
                        match (it_a.next(), it_b.next()) {
                            (Some((tuple_a, value_a)), Some((tuple_b, value_b))) => {
                                if tuple_a != tuple_b {
                                    return false;
                                }

                                let u = ulps;
                                if !approx_eq!(f64, value_a, value_b, ulps = u) {
                                    return false;
                                }
                            }
                            (None, None) => break,
                            _ => return false,
                        }
                    }
                }

                true
            }) {
                let old_channel = self.channels.remove(index);
                let mut new_terms = self.channels[other_index].terms().to_vec();
                new_terms.extend(old_channel.terms().iter().cloned());
                self.channels[other_index] = Channel::new(new_terms);
                self.subgrids.remove_index(CHANNEL_AXIS, index);
            }
        }
    }

    /// Deletes bins with the corresponding `bin_indices`. Repeated indices and indices larger or
    /// equal to the number of bins are ignored. Deleting interior bins leaves a gap in the
    /// one-dimensional limits; in that case the limits are replaced by unit-width fill limits and
    /// the physical limits and normalizations are preserved in a remapper.
    pub fn delete_bins(&mut self, bin_indices: &[usize]) {
        let mut bin_indices: Vec<_> = bin_indices
            .iter()
            .copied()
            // ignore indices corresponding to bins that don't exist
            .filter(|&index| index < self.bins.bins())
            .collect();

        // sort and remove repeated indices
        bin_indices.sort_unstable();
        bin_indices.dedup();
        let bin_indices = bin_indices;

        if bin_indices.is_empty() || bin_indices.len() == self.bins.bins() {
            return;
        }

        let kept: Vec<_> = (0..self.bins.bins())
            .filter(|bin| bin_indices.binary_search(bin).is_err())
            .collect();
        let limits = self.bins.limits().to_vec();
        let normalizations = self.normalizations();

        for &bin_index in bin_indices.iter().rev() {
            self.subgrids.remove_index(BIN_AXIS, bin_index);
        }

        let pairs: Vec<_> = kept
            .iter()
            .map(|&bin| (limits[bin], limits[bin + 1]))
            .collect();
        let contiguous = pairs.windows(2).all(|pair| pair[0].1 == pair[1].0);

        if contiguous && self.remapper.is_none() {
            let new_limits: Vec<_> = iter::once(pairs[0].0)
                .chain(pairs.iter().map(|&(_, right)| right))
                .collect();
            // UNWRAP: a subset of valid limits is still valid
            self.bins = BinLimits::new(new_limits).unwrap_or_else(|_| unreachable!());
        } else {
            let new_limits: Vec<_> = (0..=kept.len()).map(interp::f64_from_usize).collect();
            let remapper_limits = self.remapper.as_ref().map_or(pairs, |remapper| {
                let dimensions = remapper.dimensions();
                kept.iter()
                    .flat_map(|&bin| {
                        remapper.limits()[bin * dimensions..(bin + 1) * dimensions].to_vec()
                    })
                    .collect()
            });
            let kept_normalizations = kept.iter().map(|&bin| normalizations[bin]).collect();

            // UNWRAP: the new limits and the remapper are consistent by construction
            self.bins = BinLimits::new(new_limits).unwrap_or_else(|_| unreachable!());
            self.remapper = Some(
                BinRemapper::new(kept_normalizations, remapper_limits)
                    .unwrap_or_else(|_| unreachable!()),
            );
        }
    }

    /// Deletes channels with the corresponding `channel_indices`. Repeated indices and indices
    /// larger or equal than the number of channels are ignored.
    pub fn delete_channels(&mut self, channel_indices: &[usize]) {
        let mut channel_indices: Vec<_> = channel_indices
            .iter()
            .copied()
            // ignore indices corresponding to channels that don't exist
            .filter(|&index| index < self.channels.len())
            .collect();

        // sort and remove repeated indices
        channel_indices.sort_unstable();
        channel_indices.dedup();
        channel_indices.reverse();
        let channel_indices = channel_indices;

        for index in channel_indices {
            self.channels.remove(index);
            self.subgrids.remove_index(CHANNEL_AXIS, index);
        }
    }

    /// Delete orders with the corresponding `order_indices`. Repeated indices and indices larger
    /// or equal than the number of orders are ignored.
    pub fn delete_orders(&mut self, order_indices: &[usize]) {
        let mut order_indices: Vec<_> = order_indices
            .iter()
            .copied()
            // ignore indices corresponding to orders that don't exist
            .filter(|&index| index < self.orders.len())
            .collect();

        // sort and remove repeated indices
        order_indices.sort_unstable();
        order_indices.dedup();
        order_indices.reverse();
        let order_indices = order_indices;

        for index in order_indices {
            self.orders.remove(index);
            self.subgrids.remove_index(ORDER_AXIS, index);
        }
    }

    /// Splits the grid such that each channel contains only a single tuple of PIDs.
    pub fn split_channels(&mut self) {
        let indices: Vec<_> = self
            .channels
            .iter()
            .enumerate()
            .flat_map(|(index, channel)| iter::repeat(index).take(channel.terms().len()))
            .collect();

        self.subgrids = self.subgrids.select(CHANNEL_AXIS, &indices);
        self.channels = self
            .channels
            .iter()
            .flat_map(|channel| {
                channel
                    .terms()
                    .iter()
                    .cloned()
                    .map(|term| Channel::new(vec![term]))
            })
            .collect();
    }

    /// Returns information for the generation of evolution operators that are being used in
    /// [`Grid::convolve`] with the parameter `order_mask`.
    #[must_use]
    pub fn evolve_info(&self, order_mask: &[bool]) -> EvolveInfo {
        let mut ren1 = Vec::new();
        let mut fac1 = Vec::new();
        let mut frg1 = Vec::new();
        let mut x1 = Vec::new();
        let mut pids1 = Vec::new();

        for (channel, subgrid) in self.subgrids.indexed_iter().filter_map(|(tuple, subgrid)| {
            (!subgrid.is_empty() && (order_mask.is_empty() || order_mask[tuple.0]))
                .then_some((&self.channels[tuple.2], subgrid))
        }) {
            let node_values = subgrid.node_values();

            ren1.extend(self.scales.ren.calc(&node_values, &self.kinematics).iter());
            ren1.sort_by(f64::total_cmp);
            ren1.dedup_by(subgrid::node_value_eq_ref_mut);

            fac1.extend(self.scales.fac.calc(&node_values, &self.kinematics).iter());
            fac1.sort_by(f64::total_cmp);
            fac1.dedup_by(subgrid::node_value_eq_ref_mut);

            frg1.extend(self.scales.frg.calc(&node_values, &self.kinematics).iter());
            frg1.sort_by(f64::total_cmp);
            frg1.dedup_by(subgrid::node_value_eq_ref_mut);

            x1.extend(
                node_values
                    .iter()
                    .zip(&self.kinematics)
                    .filter(|(_, kin)| matches!(kin, Kinematic::X(_)))
                    .flat_map(|(values, _)| values),
            );
            x1.sort_by(f64::total_cmp);
            x1.dedup_by(subgrid::node_value_eq_ref_mut);

            for (index, _) in self.convolutions.iter().enumerate() {
                pids1.extend(channel.terms().iter().map(|(pids, _)| pids[index]));
            }

            pids1.sort_unstable();
            pids1.dedup();
        }

        EvolveInfo {
            fac1,
            frg1,
            pids1,
            x1,
            ren1,
        }
    }

    /// Convert this `Grid` into an [`FkTable`] using `slices.len()` evolution operators, one per
    /// convolution. Each entry of `slices` must iterate over a `Result` of tuples of an
    /// [`OperatorSliceInfo`] and the corresponding sliced operator, so that operators never have
    /// to be fully materialized in memory. The parameter `order_mask` can be used to include or
    /// exclude orders from this operation; an empty mask activates all orders.
    ///
    /// # Errors
    ///
    /// Returns an error when the operators or their infos are incompatible with this `Grid`, when
    /// more than two convolutions are requested or when the iterators in `slices` return an
    /// error.
    pub fn evolve<
        'a,
        E: Into<anyhow::Error>,
        S: IntoIterator<Item = std::result::Result<(OperatorSliceInfo, CowArray<'a, f64, Ix4>), E>>,
    >(
        &self,
        slices: Vec<S>,
        order_mask: &[bool],
        xi: (f64, f64, f64),
        alphas_table: &AlphasTable,
    ) -> Result<FkTable> {
        struct Iter<T> {
            iters: Vec<T>,
        }

        impl<T: Iterator> Iterator for Iter<T> {
            type Item = Vec<T::Item>;

            fn next(&mut self) -> Option<Self::Item> {
                self.iters.iter_mut().map(Iterator::next).collect()
            }
        }

        fn zip_n<O, T>(iters: O) -> impl Iterator<Item = Vec<T::Item>>
        where
            O: IntoIterator<Item = T>,
            T: IntoIterator,
        {
            Iter {
                iters: iters.into_iter().map(IntoIterator::into_iter).collect(),
            }
        }

        if slices.len() != self.convolutions.len() {
            return Err(Error::config(format!(
                "expected {} operators, one per convolution, got {}",
                self.convolutions.len(),
                slices.len()
            )));
        }

        if self.convolutions.len() > 2 {
            return Err(Error::config(
                "evolution supports at most two convolutions",
            ));
        }

        let mut lhs: Option<Self> = None;
        // scale slices we use
        let mut used_op_fac1 = Vec::new();
        // scale slices we encounter, but possibly don't use
        let mut op_fac1 = Vec::new();
        // scale slices needed by the grid
        let grid_fac1: Vec<_> = self
            .evolve_info(order_mask)
            .fac1
            .into_iter()
            .map(|fac| xi.1 * xi.1 * fac)
            .collect();
        let mut fac0 = -1.0;
        let mut perm = Vec::new();

        for result in zip_n(slices) {
            let (infos, operators): (Vec<OperatorSliceInfo>, Vec<CowArray<'_, f64, Ix4>>) =
                result
                    .into_iter()
                    .map(|res| res.map_err(|err| Error::Other(err.into())))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .unzip();

            for (info, operator) in infos.iter().zip(&operators) {
                let dim_op_info = (
                    info.pids1.len(),
                    info.x1.len(),
                    info.pids0.len(),
                    info.x0.len(),
                );

                if operator.dim() != dim_op_info {
                    return Err(Error::config(format!(
                        "operator information {dim_op_info:?} does not match the operator's \
                         dimensions: {:?}",
                        operator.dim()
                    )));
                }

                if !subgrid::node_value_eq(infos[0].fac1, info.fac1) {
                    return Err(Error::config(
                        "operator slices for one scale have different scales",
                    ));
                }

                if fac0 < 0.0 {
                    fac0 = info.fac0;
                } else if !approx_eq!(f64, fac0, info.fac0, ulps = 8) {
                    return Err(Error::config(
                        "operators have different starting scales",
                    ));
                }
            }

            if perm.is_empty() {
                perm = self
                    .convolutions
                    .iter()
                    .enumerate()
                    .map(|(max_idx, conv)| {
                        infos
                            .iter()
                            .take(max_idx + 1)
                            .enumerate()
                            .rev()
                            .find_map(|(idx, info)| (conv.kind() == info.kind).then_some(idx))
                            .ok_or_else(|| {
                                Error::config(format!(
                                    "no operator for convolution {conv:?} was supplied"
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
            }

            op_fac1.push(infos[0].fac1);

            // small numerical differences may produce two slices that are almost the same; never
            // evolve the 'same' slice twice
            if used_op_fac1
                .iter()
                .any(|&fac| subgrid::node_value_eq(fac, infos[0].fac1))
            {
                continue;
            }

            // skip slices that the grid doesn't use
            if !grid_fac1
                .iter()
                .any(|&fac| subgrid::node_value_eq(fac, infos[0].fac1))
            {
                continue;
            }

            let operators: Vec<_> = perm.iter().map(|&idx| operators[idx].view()).collect();
            let infos: Vec<_> = perm.iter().map(|&idx| infos[idx].clone()).collect();

            let (subgrids, channels) =
                evolve::evolve_slice(self, &operators, &infos, order_mask, xi, alphas_table)?;

            let scale_dims = self
                .kinematics
                .iter()
                .filter(|kin| matches!(kin, Kinematic::Scale(_)))
                .count();
            let has_pdf = self.convolutions.iter().any(|conv| conv.kind().is_pdf());
            let has_frag = self.convolutions.iter().any(|conv| !conv.kind().is_pdf());

            let rhs = Self {
                subgrids,
                bins: self.bins.clone(),
                remapper: self.remapper.clone(),
                orders: vec![Order::new(0, 0, 0, 0, 0)],
                channels,
                convolutions: self.convolutions.clone(),
                axes: iter::once(self.axes[0].clone())
                    .chain(self.axes[scale_dims..].iter().cloned())
                    .collect(),
                kinematics: iter::once(Kinematic::Scale(0))
                    .chain((0..self.convolutions.len()).map(Kinematic::X))
                    .collect(),
                scales: Scales {
                    // FK tables have their renormalization scales burnt in
                    ren: ScaleChoice::None,
                    fac: if has_pdf {
                        ScaleChoice::Node(0)
                    } else {
                        ScaleChoice::None
                    },
                    frg: if has_frag {
                        ScaleChoice::Node(0)
                    } else {
                        ScaleChoice::None
                    },
                },
                metadata: self.metadata.clone(),
            };

            if let Some(lhs) = &mut lhs {
                lhs.merge(rhs)?;
            } else {
                lhs = Some(rhs);
            }

            used_op_fac1.push(infos[0].fac1);
        }

        op_fac1.sort_by(f64::total_cmp);

        // make sure we've evolved all slices
        if let Some(muf2) = grid_fac1.into_iter().find(|&grid_mu2| {
            !used_op_fac1
                .iter()
                .any(|&eko_mu2| subgrid::node_value_eq(grid_mu2, eko_mu2))
        }) {
            return Err(Error::config(format!(
                "no operator for muf2 = {muf2} found in {op_fac1:?}"
            )));
        }

        let grid = lhs.ok_or_else(|| Error::config("no operator slices were supplied"))?;

        FkTable::try_from(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::conv::ConvKind;
    use crate::interp::{Bounds, Map, Reweight};
    use float_cmp::assert_approx_eq;
    use std::io::Cursor;

    fn default_axes() -> Vec<InterpAxis> {
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
        ]
    }

    fn default_kinematics() -> Vec<Kinematic> {
        vec![Kinematic::Scale(0), Kinematic::X(0), Kinematic::X(1)]
    }

    fn default_scales() -> Scales {
        Scales {
            ren: ScaleChoice::Node(0),
            fac: ScaleChoice::Node(0),
            frg: ScaleChoice::None,
        }
    }

    fn simple_grid() -> Grid {
        Grid::new(
            BinLimits::new(vec![0.0, 1.0, 2.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        )
        .unwrap()
    }

    #[test]
    fn grid_new_rejects_wrong_pid_count() {
        let result = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0)],
            vec![channel![[2, -2, 21] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        );

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn grid_new_rejects_unordered_kinematics() {
        let result = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            vec![Kinematic::X(0), Kinematic::Scale(0), Kinematic::X(1)],
            default_scales(),
        );

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn fill_rejects_out_of_range_indices() {
        let mut grid = simple_grid();

        assert!(matches!(
            grid.fill(1, 0.5, 0, &[1000.0, 0.5, 0.5], 1.0),
            Err(Error::Range {
                object: "orders",
                index: 1,
                len: 1
            })
        ));
        assert!(matches!(
            grid.fill(0, 0.5, 7, &[1000.0, 0.5, 0.5], 1.0),
            Err(Error::Range {
                object: "channels",
                index: 7,
                len: 1
            })
        ));
    }

    #[test]
    fn fill_ignores_out_of_limits_observables() {
        let mut grid = simple_grid();

        grid.fill(0, 3.5, 0, &[1000.0, 0.5, 0.5], 1.0).unwrap();

        assert!(grid.subgrids().iter().all(Subgrid::is_empty));
    }

    fn convolve_unit_densities(grid: &Grid) -> Vec<f64> {
        let mut xfx1 = |_: i32, x: f64, _: f64| x;
        let mut xfx2 = |_: i32, x: f64, _: f64| x;
        let mut alphas = |_: f64| 1.0;
        let mut cache = ConvCache::new(
            grid.convolutions().to_vec(),
            vec![&mut xfx1, &mut xfx2],
            &mut alphas,
        );

        grid.convolve(&mut cache, &[], &[], &[], &[(1.0, 1.0, 1.0)])
            .unwrap()
    }

    #[test]
    fn fill_convolve_and_round_trip() {
        let mut grid = simple_grid();

        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        grid.fill(0, 1.5, 0, &[90000.0, 0.1, 0.3], 3.0).unwrap();

        // with unit densities the convolution reproduces the filled weights over the bin sizes
        let results = convolve_unit_densities(&grid);
        assert_approx_eq!(f64, results[0], 2.0, epsilon = 1e-9);
        assert_approx_eq!(f64, results[1], 3.0, epsilon = 1e-9);

        let mut buffer = Vec::new();
        grid.write(&mut buffer).unwrap();
        let read_back = Grid::read(Cursor::new(&buffer)).unwrap();
        assert_eq!(convolve_unit_densities(&read_back), results);

        let mut compressed = Vec::new();
        grid.write_lz4(&mut compressed).unwrap();
        assert!(compressed.len() < buffer.len());
        let read_back = Grid::read(Cursor::new(&compressed)).unwrap();
        assert_eq!(convolve_unit_densities(&read_back), results);
    }

    #[test]
    fn read_rejects_unknown_containers() {
        assert!(matches!(
            Grid::read(Cursor::new(b"this is certainly not a grid")),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn merge_rejects_different_orders() {
        let mut lhs = simple_grid();
        let mut rhs = simple_grid();
        rhs.orders_mut()[0] = Order::new(1, 2, 0, 0, 0);

        assert!(matches!(lhs.merge(rhs), Err(Error::Config(_))));
    }

    #[test]
    fn merge_is_additive() {
        let mut lhs = simple_grid();
        let mut rhs = simple_grid();

        lhs.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        rhs.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 3.0).unwrap();
        rhs.fill(0, 1.5, 0, &[90000.0, 0.1, 0.3], 1.0).unwrap();

        lhs.merge(rhs).unwrap();

        let results = convolve_unit_densities(&lhs);
        assert_approx_eq!(f64, results[0], 5.0, epsilon = 1e-9);
        assert_approx_eq!(f64, results[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn merge_compacted_into_filled_grid() {
        let mut lhs = simple_grid();
        let mut rhs = simple_grid();

        lhs.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        rhs.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 3.0).unwrap();
        rhs.fill(0, 1.5, 0, &[90000.0, 0.1, 0.3], 1.0).unwrap();

        // the compacted subgrids have a different type than the freshly filled ones
        rhs.optimize_using(GridOptFlags::COMPACT_SUBGRIDS);
        assert!(rhs
            .subgrids()
            .iter()
            .all(|subgrid| matches!(subgrid, SubgridEnum::ImportSubgrid(_))));

        lhs.merge(rhs).unwrap();

        let results = convolve_unit_densities(&lhs);
        assert_approx_eq!(f64, results[0], 5.0, epsilon = 1e-9);
        assert_approx_eq!(f64, results[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn merge_same_channels_rescales_and_folds() {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0], channel![[2, -2] => 2.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        )
        .unwrap();

        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        grid.fill(0, 0.5, 1, &[90000.0, 0.1, 0.3], 3.0).unwrap();

        let reference = convolve_unit_densities(&grid);
        assert_approx_eq!(f64, reference[0], 8.0, epsilon = 1e-9);

        grid.optimize_using(
            GridOptFlags::MERGE_SAME_CHANNELS | GridOptFlags::STRIP_EMPTY_CHANNELS,
        );

        assert_eq!(grid.channels().len(), 1);
        let results = convolve_unit_densities(&grid);
        assert_approx_eq!(f64, results[0], 8.0, epsilon = 1e-9);
    }

    #[test]
    fn split_and_dedup_channels() {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0; [1, -1] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        )
        .unwrap();

        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        let reference = convolve_unit_densities(&grid);

        grid.split_channels();
        assert_eq!(grid.channels().len(), 2);
        assert_eq!(convolve_unit_densities(&grid), reference);

        // both split channels contain identical subgrids and collapse back into one
        grid.dedup_channels(64);
        assert_eq!(grid.channels().len(), 1);
        assert_eq!(convolve_unit_densities(&grid), reference);
    }

    #[test]
    fn scale_by_order_targets_single_orders() {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 1.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0), Order::new(1, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        )
        .unwrap();

        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 1.0).unwrap();
        grid.fill(1, 0.5, 0, &[1000.0, 0.25, 0.5], 1.0).unwrap();

        // double only the order with one power of the strong coupling
        grid.scale_by_order(2.0, 1.0, 1.0, 1.0, 1.0, 1.0);

        let results = convolve_unit_densities(&grid);
        assert_approx_eq!(f64, results[0], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn delete_interior_bins_preserves_normalizations() {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 0.5, 1.0, 2.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        )
        .unwrap();

        grid.fill(0, 0.25, 0, &[1000.0, 0.25, 0.5], 1.0).unwrap();
        grid.fill(0, 1.5, 0, &[1000.0, 0.25, 0.5], 4.0).unwrap();

        grid.delete_bins(&[1]);

        assert_eq!(grid.bins().bins(), 2);
        // the gap forces unit-width fill limits with the physical limits in a remapper
        let remapper = grid.remapper().unwrap();
        assert_eq!(remapper.limits(), [(0.0, 0.5), (1.0, 2.0)]);
        assert_eq!(remapper.normalizations(), [0.5, 1.0]);

        let results = convolve_unit_densities(&grid);
        assert_approx_eq!(f64, results[0], 2.0, epsilon = 1e-9);
        assert_approx_eq!(f64, results[1], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn merge_bins_sums_contents() {
        let mut grid = simple_grid();

        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        grid.fill(0, 1.5, 0, &[1000.0, 0.25, 0.5], 3.0).unwrap();

        grid.merge_bins(0..2).unwrap();

        assert_eq!(grid.bins().bins(), 1);
        let results = convolve_unit_densities(&grid);
        // the merged bin has width two
        assert_approx_eq!(f64, results[0], 2.5, epsilon = 1e-9);
    }

    #[test]
    fn charge_conjugate_leaves_results_invariant() {
        let mut grid = simple_grid();
        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();

        let reference = convolve_unit_densities(&grid);

        grid.charge_conjugate(0).unwrap();
        assert_eq!(grid.convolutions()[0].pid(), -2212);
        assert_eq!(grid.channels()[0].terms()[0].0, [-2, -2]);

        assert_eq!(convolve_unit_densities(&grid), reference);
    }

    #[test]
    fn optimize_strips_and_compacts() {
        let mut grid = Grid::new(
            BinLimits::new(vec![0.0, 1.0, 2.0]).unwrap(),
            vec![Order::new(0, 2, 0, 0, 0), Order::new(1, 2, 0, 0, 0)],
            vec![channel![[2, -2] => 1.0], channel![[1, -1] => 1.0]],
            vec![
                Convolution::new(ConvKind::UnpolPdf, 2212),
                Convolution::new(ConvKind::UnpolPdf, 2212),
            ],
            default_axes(),
            default_kinematics(),
            default_scales(),
        )
        .unwrap();

        grid.fill(0, 0.5, 0, &[1000.0, 0.25, 0.5], 2.0).unwrap();
        let reference = convolve_unit_densities(&grid);

        grid.optimize();

        assert_eq!(grid.orders().len(), 1);
        assert_eq!(grid.channels().len(), 1);
        assert_eq!(grid.bins().bins(), 1);
        assert!(grid
            .subgrids()
            .iter()
            .all(|subgrid| matches!(subgrid, SubgridEnum::ImportSubgrid(_))));

        let results = convolve_unit_densities(&grid);
        assert_approx_eq!(f64, results[0], reference[0], ulps = 8);
    }

    #[test]
    fn push_order_and_channel_grow_the_subgrid_array() {
        let mut grid = simple_grid();

        grid.push_order(Order::new(1, 2, 0, 0, 0));
        grid.push_channel(channel![[21, 21] => 2.0]).unwrap();

        assert_eq!(grid.orders().len(), 2);
        assert_eq!(grid.channels().len(), 2);
        assert_eq!(grid.subgrids().dim(), (2, 2, 2));

        assert!(matches!(
            grid.push_channel(channel![[21, 21, 21] => 2.0]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn metadata_round_trips() {
        let mut grid = simple_grid();
        grid.metadata_mut()
            .insert("y_label".to_owned(), "dsig/dy".to_owned());

        let mut buffer = Vec::new();
        grid.write(&mut buffer).unwrap();
        let read_back = Grid::read(Cursor::new(&buffer)).unwrap();

        assert_eq!(
            read_back.metadata().get("y_label").map(String::as_str),
            Some("dsig/dy")
        );
    }
}
