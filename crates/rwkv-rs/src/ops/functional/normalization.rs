//! Layer and group normalization composed from the engine's row norm.

use crate::error::RwkvResult;
use crate::ops::graph::{GraphBuilder, TensorId};

/// Epsilon used by every layer norm of the model.
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Applies `norm(x) * weight + bias` over axis 0 of every column.
pub fn layer_norm(
    builder: &mut GraphBuilder<'_>,
    x: TensorId,
    weight: TensorId,
    bias: TensorId,
) -> RwkvResult<TensorId> {
    let normalized = builder.norm(x, LAYER_NORM_EPS)?;
    let scaled = builder.mul(normalized, weight)?;
    builder.add(scaled, bias)
}

/// Normalizes each of `groups` equal slices of every column independently, then applies the
/// per-channel affine transform.
pub fn group_norm(
    builder: &mut GraphBuilder<'_>,
    x: TensorId,
    groups: usize,
    eps: f32,
    weight: TensorId,
    bias: TensorId,
) -> RwkvResult<TensorId> {
    let (channels, columns) = builder.dims2(x);
    assert_eq!(
        channels % groups,
        0,
        "group_norm: {channels} channels do not split into {groups} groups"
    );
    let contiguous = if builder.spec(x).is_contiguous() {
        x
    } else {
        builder.dup(x)?
    };
    let grouped = builder.reshape(contiguous, [channels / groups, groups * columns, 1, 1])?;
    let normalized = builder.norm(grouped, eps)?;
    let restored = builder.reshape(normalized, [channels, columns, 1, 1])?;
    let scaled = builder.mul(restored, weight)?;
    builder.add(scaled, bias)
}
