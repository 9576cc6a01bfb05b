//! Graph-level wrappers around the custom kernels.
//!
//! Operands must be contiguous F32 tensors with at most two axes; binary wrappers also require
//! identical shapes. Violations panic during graph construction.

use super::kernels;
use crate::error::RwkvResult;
use crate::ops::graph::{GraphBuilder, TensorId};

pub fn exp(builder: &mut GraphBuilder<'_>, x: TensorId) -> RwkvResult<TensorId> {
    builder.map_unary("exp", kernels::exp, x)
}

/// Computes `1 - x`.
pub fn one_minus(builder: &mut GraphBuilder<'_>, x: TensorId) -> RwkvResult<TensorId> {
    builder.map_unary("one_minus", kernels::one_minus, x)
}

pub fn sigmoid(builder: &mut GraphBuilder<'_>, x: TensorId) -> RwkvResult<TensorId> {
    builder.map_unary("sigmoid", kernels::sigmoid, x)
}

/// Element-wise maximum of two same-shaped tensors.
pub fn maximum(builder: &mut GraphBuilder<'_>, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
    builder.map_binary("max", kernels::max, a, b)
}
