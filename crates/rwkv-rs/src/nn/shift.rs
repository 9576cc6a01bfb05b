//! Token shift: pairing every position with the input of the position before it.

use crate::error::RwkvResult;
use crate::ops::functional::one_minus;
use crate::ops::graph::{GraphBuilder, TensorId};

/// Result of [`carry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shifted {
    /// `[n_embed, seq_len]`: column `t` holds the input of position `t - 1`.
    pub x_prev: TensorId,
    /// The last column of the input, to be carried into the next call.
    pub carry: TensorId,
}

/// Shifts `x` (`[n_embed, seq_len]`) by one position, feeding `prev_carry` in at the front.
///
/// With a single position no node is created: the previous carry is used as is and `x`
/// becomes the new carry. Longer inputs concatenate the carry with all but the last column
/// and carry a view of the last column.
pub fn carry(
    builder: &mut GraphBuilder<'_>,
    x: TensorId,
    prev_carry: TensorId,
) -> RwkvResult<Shifted> {
    let (n_embed, seq_len) = builder.dims2(x);
    if seq_len == 1 {
        return Ok(Shifted {
            x_prev: prev_carry,
            carry: x,
        });
    }
    let leading = builder.view_2d(x, n_embed, seq_len - 1, n_embed, 0)?;
    let x_prev = builder.concat(prev_carry, leading)?;
    let carry = builder.view_1d(x, n_embed, (seq_len - 1) * n_embed)?;
    Ok(Shifted { x_prev, carry })
}

/// Interpolates per channel: `x * ratio + x_prev * (1 - ratio)`.
pub fn mix(
    builder: &mut GraphBuilder<'_>,
    x: TensorId,
    x_prev: TensorId,
    ratio: TensorId,
) -> RwkvResult<TensorId> {
    let current = builder.mul(x, ratio)?;
    let complement = one_minus(builder, ratio)?;
    let previous = builder.mul(x_prev, complement)?;
    builder.add(current, previous)
}
