//! Channel mixing: the gated squared-ReLU feed-forward half of a block.

use super::shift::mix;
use crate::error::RwkvResult;
use crate::model::ChannelMixWeights;
use crate::ops::functional::sigmoid;
use crate::ops::graph::{GraphBuilder, TensorId};

/// `sigmoid(W_r * xr) * (W_v * relu(W_k * xk)^2)` over the token-shifted inputs.
pub fn channel_mix(
    builder: &mut GraphBuilder<'_>,
    weights: &ChannelMixWeights,
    x: TensorId,
    x_prev: TensorId,
) -> RwkvResult<TensorId> {
    let mix_k = builder.weight(&weights.time_mix_k)?;
    let mix_r = builder.weight(&weights.time_mix_r)?;
    let xk = mix(builder, x, x_prev, mix_k)?;
    let xr = mix(builder, x, x_prev, mix_r)?;

    let receptance = builder.weight(&weights.receptance)?;
    let r = builder.mul_mat(receptance, xr)?;
    let r = sigmoid(builder, r)?;

    let key = builder.weight(&weights.key)?;
    let k = builder.mul_mat(key, xk)?;
    let k = builder.relu(k)?;
    let k = builder.sqr(k)?;

    let value = builder.weight(&weights.value)?;
    let v = builder.mul_mat(value, k)?;
    builder.mul(r, v)
}
