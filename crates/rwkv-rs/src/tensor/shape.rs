//! Lightweight wrapper for tensor shapes and dimension bookkeeping.
//!
//! Dimensions are listed fastest-varying first: a `[n_embed, n_vocab]` matrix holds `n_vocab`
//! rows of `n_embed` contiguous values, so a linear layer mapping `in -> out` is `[in, out]`.

/// Maximum number of axes a tensor can carry.
pub const MAX_DIMS: usize = 4;

/// Stores the logical dimensions of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: [usize; MAX_DIMS],
    rank: usize,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if `dims` is empty or has more than [`MAX_DIMS`] axes.
    pub fn new<const N: usize>(dims: [usize; N]) -> Self {
        Shape::from_slice(&dims)
    }

    /// Same as [`Shape::new`] for dimensions only known at runtime.
    pub fn from_slice(dims: &[usize]) -> Self {
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        assert!(
            dims.len() <= MAX_DIMS,
            "shape supports at most {MAX_DIMS} dimensions, got {}",
            dims.len()
        );
        let mut padded = [1; MAX_DIMS];
        padded[..dims.len()].copy_from_slice(dims);
        Shape {
            dims: padded,
            rank: dims.len(),
        }
    }

    /// Borrow the declared dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    /// Dimensions padded with trailing ones to [`MAX_DIMS`] axes.
    pub fn padded(&self) -> [usize; MAX_DIMS] {
        self.dims
    }

    /// Returns the rank (number of declared axes) of the shape.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}
