//! Perturbative orders.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Coupling and scale-logarithm exponents of a perturbative order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Order {
    /// Exponent of the strong coupling.
    pub alphas: u8,
    /// Exponent of the electromagnetic coupling.
    pub alpha: u8,
    /// Exponent of the logarithm of the ratio of the renormalization scale to the central scale.
    pub logxir: u8,
    /// Exponent of the logarithm of the ratio of the factorization scale to the central scale.
    pub logxif: u8,
    /// Exponent of the logarithm of the ratio of the fragmentation scale to the central scale.
    pub logxia: u8,
}

impl Ord for Order {
    fn cmp(&self, other: &Self) -> Ordering {
        // sort leading orders before next-to-leading orders, then the lowest power in alpha, the
        // rest lexicographically
        (self.alphas + self.alpha)
            .cmp(&(other.alphas + other.alpha))
            .then((self.alpha, self.logxir, self.logxif, self.logxia).cmp(&(
                other.alpha,
                other.logxir,
                other.logxif,
                other.logxia,
            )))
    }
}

impl PartialOrd for Order {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Order {
    /// Constructor.
    #[must_use]
    pub const fn new(alphas: u8, alpha: u8, logxir: u8, logxif: u8, logxia: u8) -> Self {
        Self {
            alphas,
            alpha,
            logxir,
            logxif,
            logxia,
        }
    }

    /// Return a mask suitable for the `order_mask` parameters of
    /// [`Grid::convolve`](crate::grid::Grid::convolve) and
    /// [`Grid::evolve`](crate::grid::Grid::evolve), selecting all orders up to `max_as` powers of
    /// the strong and `max_al` powers of the electromagnetic coupling relative to the leading
    /// order. Scale-logarithmic orders are selected only if `logs` is `true`.
    #[must_use]
    pub fn mask(orders: &[Self], max_as: u8, max_al: u8, logs: bool) -> Vec<bool> {
        // smallest sum of alphas and alpha
        let lo = orders
            .iter()
            .map(|Self { alphas, alpha, .. }| alphas + alpha)
            .min()
            .unwrap_or_default();

        // all leading orders, without logarithms
        let leading_orders: Vec<_> = orders
            .iter()
            .filter(|Self { alphas, alpha, .. }| alphas + alpha == lo)
            .copied()
            .collect();

        let lo_as = leading_orders
            .iter()
            .map(|Self { alphas, .. }| *alphas)
            .max()
            .unwrap_or_default();
        let lo_al = leading_orders
            .iter()
            .map(|Self { alpha, .. }| *alpha)
            .max()
            .unwrap_or_default();

        let max = max_as.max(max_al);
        let min = max_as.min(max_al);

        orders
            .iter()
            .map(
                |&Self {
                     alphas,
                     alpha,
                     logxir,
                     logxif,
                     logxia,
                 }| {
                    if !logs && (logxir > 0 || logxif > 0 || logxia > 0) {
                        return false;
                    }

                    let pto = alphas + alpha - lo;

                    alphas + alpha < min + lo
                        || (alphas + alpha < max + lo
                            && match max_as.cmp(&max_al) {
                                Ordering::Greater => lo_as + pto == alphas,
                                Ordering::Less => lo_al + pto == alpha,
                                Ordering::Equal => false,
                            })
                },
            )
            .collect()
    }
}
