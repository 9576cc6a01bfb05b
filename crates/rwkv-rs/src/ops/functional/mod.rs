//! Functional helpers layered on the graph builder.
//!
//! [`kernels`] holds the pure element-wise routines the engine lacks natively; [`elementwise`]
//! wraps them as graph operations and [`normalization`] composes layer and group norms from
//! engine primitives.
pub mod elementwise;
pub mod kernels;
pub mod normalization;

pub use elementwise::{exp, maximum, one_minus, sigmoid};
pub use normalization::{group_norm, layer_norm, LAYER_NORM_EPS};
