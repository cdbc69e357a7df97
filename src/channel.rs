//! Flavor-combination channels.

use float_cmp::approx_eq;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A linear combination of flavor tuples. Each term pairs one particle ID per convolution with a
/// numerical factor multiplying the product of the corresponding densities.
#[derive(Clone, Debug, Deserialize, PartialEq, PartialOrd, Serialize)]
pub struct Channel {
    terms: Vec<(Vec<i32>, f64)>,
}

impl Channel {
    /// Constructor. The terms are sorted, terms with the same particle IDs are coalesced and
    /// terms whose factor is numerically zero are dropped.
    ///
    /// # Examples
    ///
    /// Ordering of the terms doesn't matter:
    ///
    /// ```rust
    /// use carambola::channel::Channel;
    ///
    /// let channel1 = Channel::new(vec![(vec![2, 2], 1.0), (vec![4, 4], 1.0)]);
    /// let channel2 = Channel::new(vec![(vec![4, 4], 1.0), (vec![2, 2], 1.0)]);
    ///
    /// assert_eq!(channel1, channel2);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `terms` is empty or if its tuples have different lengths.
    #[must_use]
    pub fn new(mut terms: Vec<(Vec<i32>, f64)>) -> Self {
        assert!(!terms.is_empty(), "can not create empty channel");
        assert!(
            terms.iter().map(|(pids, _)| pids.len()).all_equal(),
            "can not create channel with a different number of PIDs"
        );

        // sort terms to make channels comparable independently of the insertion order
        terms.sort_by(|x, y| x.0.cmp(&y.0));

        Self {
            terms: terms
                .into_iter()
                .coalesce(|lhs, rhs| {
                    // sum the factors of repeated elements
                    if lhs.0 == rhs.0 {
                        Ok((lhs.0, lhs.1 + rhs.1))
                    } else {
                        Err((lhs, rhs))
                    }
                })
                .filter(|&(_, f)| !approx_eq!(f64, f.abs(), 0.0, epsilon = 1e-14))
                .collect(),
        }
    }

    /// Returns the terms of this channel.
    #[must_use]
    pub fn terms(&self) -> &[(Vec<i32>, f64)] {
        &self.terms
    }

    /// Create a new channel with the particle IDs at indices `i` and `j` swapped in every term.
    #[must_use]
    pub fn transpose(&self, i: usize, j: usize) -> Self {
        Self::new(
            self.terms
                .iter()
                .map(|(pids, f)| {
                    let mut transposed = pids.clone();
                    transposed.swap(i, j);
                    (transposed, *f)
                })
                .collect(),
        )
    }

    /// If `other` contains the same particle-ID tuples as `self` and the ratios of the paired
    /// factors agree, return that common ratio.
    #[must_use]
    pub fn common_factor(&self, other: &Self) -> Option<f64> {
        if self.terms.len() != other.terms.len() {
            return None;
        }

        let result: Option<Vec<_>> = self
            .terms
            .iter()
            .zip(&other.terms)
            .map(|((pids_a, fa), (pids_b, fb))| (pids_a == pids_b).then_some(fa / fb))
            .collect();

        result.and_then(|factors| {
            if factors
                .windows(2)
                .all(|win| approx_eq!(f64, win[0], win[1], ulps = 4))
            {
                factors.first().copied()
            } else {
                None
            }
        })
    }
}

/// Helper macro to quickly generate a [`Channel`]:
///
/// ```rust
/// use carambola::channel;
///
/// let channel = channel![[22, 22] => 1.0; [22, 100] => 0.5];
/// ```
#[macro_export]
macro_rules! channel {
    ($([$($pid:expr),+] => $factor:expr);+) => {
        $crate::channel::Channel::new(vec![$((vec![$($pid),+], $factor)),+])
    };
}
