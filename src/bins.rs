//! Helpers for binning observables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// One-dimensional limits that map fill-time observable values to bin indices.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BinLimits(Vec<f64>);

impl BinLimits {
    /// Constructor.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two limits are given or if the limits are not strictly
    /// increasing.
    pub fn new(limits: Vec<f64>) -> Result<Self> {
        if limits.len() < 2 {
            return Err(Error::config(format!(
                "need at least two bin limits, got {}",
                limits.len()
            )));
        }
        if limits
            .windows(2)
            .any(|win| !(win[0].is_finite() && win[1].is_finite() && win[1] > win[0]))
        {
            return Err(Error::config(
                "bin limits must be finite and strictly increasing",
            ));
        }

        Ok(Self(limits))
    }

    /// Returns the number of bins.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.0.len() - 1
    }

    /// Returns the bin index for the observable `value`, or `None` if the value over- or
    /// underflows.
    #[must_use]
    pub fn index(&self, value: f64) -> Option<usize> {
        if value < self.left() || value >= self.right() {
            return None;
        }

        Some(self.0.partition_point(|&left| left <= value) - 1)
    }

    /// Returns the left-most limit.
    #[must_use]
    pub fn left(&self) -> f64 {
        self.0[0]
    }

    /// Returns the right-most limit.
    #[must_use]
    pub fn right(&self) -> f64 {
        self.0[self.0.len() - 1]
    }

    /// Returns all limits.
    #[must_use]
    pub fn limits(&self) -> &[f64] {
        &self.0
    }

    /// Returns the size of each bin.
    #[must_use]
    pub fn bin_sizes(&self) -> Vec<f64> {
        self.0.windows(2).map(|win| win[1] - win[0]).collect()
    }

    /// Replace the bins in `range` with a single bin spanning them.
    ///
    /// # Errors
    ///
    /// Returns an error if `range` is empty or exceeds the number of bins.
    pub fn merge_bins(&mut self, range: std::ops::Range<usize>) -> Result<()> {
        if range.is_empty() || range.end > self.bins() {
            return Err(Error::config(format!(
                "bin range {}..{} can not be merged in {} bins",
                range.start,
                range.end,
                self.bins()
            )));
        }

        self.0.drain((range.start + 1)..range.end);

        Ok(())
    }

}

/// Maps the storage bins onto possibly multi-dimensional observable bins with their own
/// normalizations.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BinRemapper {
    normalizations: Vec<f64>,
    limits: Vec<(f64, f64)>,
}

impl BinRemapper {
    /// Constructor. The length of `limits` must be a non-zero multiple of the length of
    /// `normalizations`; the multiple is the number of dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lengths do not determine a well-defined number of dimensions.
    pub fn new(normalizations: Vec<f64>, limits: Vec<(f64, f64)>) -> Result<Self> {
        if normalizations.is_empty()
            || limits.is_empty()
            || limits.len() % normalizations.len() != 0
        {
            return Err(Error::config(format!(
                "could not determine the dimensions from a normalization vector with length {} \
                 and limits vector with length {}",
                normalizations.len(),
                limits.len()
            )));
        }

        Ok(Self {
            normalizations,
            limits,
        })
    }

    /// Returns the number of bins.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.normalizations.len()
    }

    /// Returns the number of dimensions.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.limits.len() / self.normalizations.len()
    }

    /// Returns the left and right limits of all bins, dimension-major within each bin.
    #[must_use]
    pub fn limits(&self) -> &[(f64, f64)] {
        &self.limits
    }

    /// Returns the normalization of each bin.
    #[must_use]
    pub fn normalizations(&self) -> &[f64] {
        &self.normalizations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_lookup() {
        let limits = BinLimits::new(vec![0.0, 0.25, 0.5, 0.75, 1.0]).unwrap();

        assert_eq!(limits.bins(), 4);
        assert_eq!(limits.index(-0.1), None);
        assert_eq!(limits.index(0.0), Some(0));
        assert_eq!(limits.index(0.3), Some(1));
        assert_eq!(limits.index(0.75), Some(3));
        assert_eq!(limits.index(1.0), None);
        assert_eq!(limits.bin_sizes(), vec![0.25; 4]);
    }

    #[test]
    fn unequal_sizes() {
        let limits = BinLimits::new(vec![0.125, 0.25, 1.0, 1.5]).unwrap();

        assert_eq!(limits.bin_sizes(), vec![0.125, 0.75, 0.5]);
        assert_eq!(limits.index(0.9), Some(1));
    }

    #[test]
    fn invalid_limits() {
        assert!(BinLimits::new(vec![0.0]).is_err());
        assert!(BinLimits::new(vec![0.0, 1.0, 0.5]).is_err());
        assert!(BinLimits::new(vec![0.0, f64::NAN, 1.0]).is_err());
    }

    #[test]
    fn merge_bins() {
        let mut limits = BinLimits::new(vec![0.0, 0.25, 0.5, 0.75, 1.0]).unwrap();

        limits.merge_bins(1..3).unwrap();

        assert_eq!(limits.limits(), [0.0, 0.25, 0.75, 1.0]);
        assert!(limits.merge_bins(3..5).is_err());
        assert!(limits.merge_bins(1..1).is_err());
    }

    #[test]
    fn remapper() {
        let remapper = BinRemapper::new(
            vec![1.0, 1.0],
            vec![(0.0, 1.0), (0.0, 0.5), (0.0, 1.0), (0.5, 1.0)],
        )
        .unwrap();

        assert_eq!(remapper.bins(), 2);
        assert_eq!(remapper.dimensions(), 2);

        assert!(BinRemapper::new(vec![1.0, 1.0], vec![(0.0, 1.0); 3]).is_err());
    }
}
