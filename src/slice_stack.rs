//! Sparse tensor storage for subgrids.

use arrayvec::ArrayVec;
use ndarray::{ArrayD, ArrayViewD, Axis, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

/// Maximum number of dimensions a [`SliceStack`] can have.
pub const MAX_DIMS: usize = 8;

/// Sparse tensor that stores one dense block for every populated node of its first axis. The
/// first axis typically runs over scale nodes, which a fill touches only a few of, while the
/// remaining axes are densely populated momentum fractions.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SliceStack {
    shape: Vec<usize>,
    // sorted by slice index
    slices: Vec<(usize, ArrayD<f64>)>,
}

impl SliceStack {
    /// Constructor. `shape` must have at least two dimensions and at most [`MAX_DIMS`].
    #[must_use]
    pub fn new(shape: Vec<usize>) -> Self {
        assert!((2..=MAX_DIMS).contains(&shape.len()));

        Self {
            shape,
            slices: Vec::new(),
        }
    }

    /// Returns the shape of the full tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns `true` if no non-zero value is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices
            .iter()
            .all(|(_, block)| block.iter().all(|&value| value == 0.0))
    }

    fn block_at(&mut self, index: usize) -> &mut ArrayD<f64> {
        debug_assert!(index < self.shape[0]);

        let position = match self.slices.binary_search_by_key(&index, |&(i, _)| i) {
            Ok(position) => position,
            Err(position) => {
                self.slices.insert(
                    position,
                    (index, ArrayD::zeros(IxDyn(&self.shape[1..]))),
                );
                position
            }
        };

        &mut self.slices[position].1
    }

    /// Add `value` at `indices`. Adding zero is a no-op and never allocates a block.
    ///
    /// # Panics
    ///
    /// Panics if `indices` does not match the tensor shape.
    pub fn add(&mut self, indices: &[usize], value: f64) {
        if value == 0.0 {
            return;
        }

        assert_eq!(indices.len(), self.shape.len());

        self.block_at(indices[0])[&indices[1..]] += value;
    }

    /// Add the dense `block` to the slice at `index`. A block that contains only zeros is
    /// dropped, so an all-zero slice is never stored.
    ///
    /// # Panics
    ///
    /// Panics if `index` or the block shape do not match the tensor shape.
    pub fn import_slice(&mut self, index: usize, block: ArrayViewD<f64>) {
        assert!(index < self.shape[0]);
        assert_eq!(block.shape(), &self.shape[1..]);

        if block.iter().all(|&value| value == 0.0) {
            return;
        }

        *self.block_at(index) += &block;
    }

    /// Returns an iterator over all populated slices and their first-axis indices.
    pub fn slices(&self) -> impl Iterator<Item = (usize, ArrayViewD<'_, f64>)> + '_ {
        self.slices.iter().map(|(index, block)| (*index, block.view()))
    }

    /// Returns an iterator over all non-zero elements, slice-major and row-major within each
    /// slice.
    pub fn indexed_iter(&self) -> impl Iterator<Item = (Vec<usize>, f64)> + '_ {
        let dims = self.shape.len();

        self.slices.iter().flat_map(move |(slice_index, block)| {
            block
                .indexed_iter()
                .filter(|(_, &value)| value != 0.0)
                .map(move |(index, &value)| {
                    let mut indices = Vec::with_capacity(dims);
                    indices.push(*slice_index);
                    indices.extend_from_slice(index.slice());
                    (indices, value)
                })
        })
    }

    /// Multiply all elements with `factor`.
    pub fn scale(&mut self, factor: f64) {
        if factor == 0.0 {
            self.slices.clear();
        } else {
            for (_, block) in &mut self.slices {
                *block *= factor;
            }
        }
    }

    /// Add all elements of `other` to `self`. If `transpose` is given, the two axes are swapped
    /// in `other` before adding; both must be block axes, not the slice axis.
    ///
    /// # Panics
    ///
    /// Panics if the shapes do not match or if `transpose` names the slice axis.
    pub fn merge(&mut self, other: &Self, transpose: Option<(usize, usize)>) {
        let mut other_shape = other.shape.to_vec();
        if let Some((a, b)) = transpose {
            assert!(a > 0 && b > 0);
            other_shape.swap(a, b);
        }
        assert_eq!(self.shape, other_shape);

        for (index, block) in &other.slices {
            let mut view = block.view();
            if let Some((a, b)) = transpose {
                view.swap_axes(a - 1, b - 1);
            }

            self.import_slice(*index, view);
        }
    }

    /// Remove slices whose elements have cancelled to zero.
    pub fn prune_zero_slices(&mut self) {
        self.slices
            .retain(|(_, block)| block.iter().any(|&value| value != 0.0));
    }

    /// Remove the sub-tensor outside `ranges` and renumber the remaining indices to start at
    /// zero.
    pub fn shrink(&mut self, ranges: &[std::ops::Range<usize>]) {
        assert_eq!(ranges.len(), self.shape.len());

        self.slices.retain_mut(|(index, block)| {
            if !ranges[0].contains(index) {
                return false;
            }
            *index -= ranges[0].start;

            for (axis, range) in ranges[1..].iter().enumerate() {
                block.slice_axis_inplace(Axis(axis), (range.start..range.end).into());
            }

            true
        });

        self.shape = ranges.iter().map(ExactSizeIterator::len).collect();
    }

    /// Returns the number of non-zero elements and the number of elements allocated in blocks.
    #[must_use]
    pub fn sparsity(&self) -> (usize, usize) {
        let allocated = self
            .slices
            .iter()
            .map(|(_, block)| block.len())
            .sum::<usize>();
        let non_zeros = self
            .slices
            .iter()
            .map(|(_, block)| block.iter().filter(|&&value| value != 0.0).count())
            .sum::<usize>();

        (non_zeros, allocated)
    }
}

/// Converts a flat index into a multi-dimensional index for the given shape, row-major.
pub(crate) fn unravel_index(mut index: usize, shape: &[usize]) -> ArrayVec<usize, MAX_DIMS> {
    debug_assert!(index < shape.iter().product());

    let mut indices = ArrayVec::new();
    for _ in 0..shape.len() {
        indices.push(0);
    }
    for (position, &dim) in indices.iter_mut().zip(shape).rev() {
        *position = index % dim;
        index /= dim;
    }

    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn add_and_iterate() {
        let mut stack = SliceStack::new(vec![4, 3, 3]);

        assert!(stack.is_empty());
        assert_eq!(stack.shape(), [4, 3, 3]);

        stack.add(&[2, 1, 0], 3.0);
        stack.add(&[0, 2, 2], 1.0);
        stack.add(&[2, 1, 0], -1.0);
        // adding zero must not allocate a slice
        stack.add(&[3, 0, 0], 0.0);

        assert!(!stack.is_empty());
        assert_eq!(stack.slices().count(), 2);
        assert_eq!(
            stack.indexed_iter().collect::<Vec<_>>(),
            [(vec![0, 2, 2], 1.0), (vec![2, 1, 0], 2.0)]
        );
    }

    #[test]
    fn import_skips_zero_blocks() {
        let mut stack = SliceStack::new(vec![2, 2, 2]);

        stack.import_slice(0, arr2(&[[0.0, 0.0], [0.0, 0.0]]).into_dyn().view());
        assert_eq!(stack.slices().count(), 0);

        stack.import_slice(1, arr2(&[[1.0, 0.0], [0.0, 2.0]]).into_dyn().view());
        assert_eq!(
            stack.indexed_iter().collect::<Vec<_>>(),
            [(vec![1, 0, 0], 1.0), (vec![1, 1, 1], 2.0)]
        );
    }

    #[test]
    fn scale_and_prune() {
        let mut stack = SliceStack::new(vec![2, 2, 2]);

        stack.add(&[0, 0, 1], 2.0);
        stack.scale(0.5);
        assert_eq!(stack.indexed_iter().next(), Some((vec![0, 0, 1], 1.0)));

        stack.add(&[0, 0, 1], -1.0);
        assert!(stack.is_empty());
        assert_eq!(stack.slices().count(), 1);
        stack.prune_zero_slices();
        assert_eq!(stack.slices().count(), 0);

        stack.add(&[1, 1, 1], 3.0);
        stack.scale(0.0);
        assert_eq!(stack.slices().count(), 0);
    }

    #[test]
    fn merge_with_transpose() {
        let mut lhs = SliceStack::new(vec![2, 2, 2]);
        let mut rhs = SliceStack::new(vec![2, 2, 2]);

        lhs.add(&[0, 0, 1], 1.0);
        rhs.add(&[0, 1, 0], 2.0);
        rhs.add(&[1, 0, 1], 4.0);

        lhs.merge(&rhs, Some((1, 2)));

        assert_eq!(
            lhs.indexed_iter().collect::<Vec<_>>(),
            [(vec![0, 0, 1], 3.0), (vec![1, 1, 0], 4.0)]
        );
    }

    #[test]
    fn shrink() {
        let mut stack = SliceStack::new(vec![4, 4, 4]);

        stack.add(&[1, 2, 3], 1.0);
        stack.add(&[2, 1, 2], 2.0);
        stack.shrink(&[1..3, 1..3, 2..4]);

        assert_eq!(stack.shape(), [2, 2, 2]);
        assert_eq!(
            stack.indexed_iter().collect::<Vec<_>>(),
            [(vec![0, 1, 1], 1.0), (vec![1, 0, 0], 2.0)]
        );
    }

    #[test]
    fn unravel() {
        assert_eq!(unravel_index(0, &[2, 3]).as_slice(), [0, 0]);
        assert_eq!(unravel_index(4, &[2, 3]).as_slice(), [1, 1]);
        assert_eq!(unravel_index(5, &[2, 3]).as_slice(), [1, 2]);
    }
}
