//! One residual RWKV block: time mixing followed by channel mixing.

use super::channel_mix::channel_mix;
use super::shift::carry;
use super::time_mix::{time_mix_v4, Accumulators};
use super::time_mix_v5::{time_mix_v5, HeadLayout};
use crate::error::RwkvResult;
use crate::model::{
    AttentionState, BlockWeights, LayerNormWeights, LayerState, RwkvConfig, TimeMixWeights,
};
use crate::ops::functional::layer_norm;
use crate::ops::graph::{GraphBuilder, TensorId};

fn normalize(
    builder: &mut GraphBuilder<'_>,
    weights: &LayerNormWeights,
    x: TensorId,
) -> RwkvResult<TensorId> {
    let weight = builder.weight(&weights.weight)?;
    let bias = builder.weight(&weights.bias)?;
    layer_norm(builder, x, weight, bias)
}

/// Applies one block to the residual stream `x` (`[n_embed, seq_len]`).
///
/// `state` holds the layer's carried state on entry and the updated handles on return.
pub fn block(
    builder: &mut GraphBuilder<'_>,
    config: &RwkvConfig,
    weights: &BlockWeights,
    x: TensorId,
    state: &mut LayerState<TensorId>,
) -> RwkvResult<TensorId> {
    let normed = normalize(builder, &weights.ln1, x)?;
    let shifted = carry(builder, normed, state.att_shift)?;
    state.att_shift = shifted.carry;
    let att = match (&weights.att, &mut state.att) {
        (
            TimeMixWeights::V4(att),
            AttentionState::V4 {
                num,
                den,
                log_scale,
            },
        ) => {
            let mut acc = Accumulators {
                num: *num,
                den: *den,
                log_scale: *log_scale,
            };
            let out = time_mix_v4(builder, att, normed, shifted.x_prev, &mut acc)?;
            *num = acc.num;
            *den = acc.den;
            *log_scale = acc.log_scale;
            out
        }
        (TimeMixWeights::V5(att), AttentionState::V5 { heads }) => {
            let layout = HeadLayout {
                head_size: config.head_size,
                head_count: config.head_count,
                group_norm_eps: config.group_norm_eps(),
            };
            time_mix_v5(builder, att, layout, normed, shifted.x_prev, heads)?
        }
        _ => panic!("block weights and carried state belong to different architecture variants"),
    };
    let x = builder.add(x, att)?;

    let normed = normalize(builder, &weights.ln2, x)?;
    let shifted = carry(builder, normed, state.ffn_shift)?;
    state.ffn_shift = shifted.carry;
    let ffn = channel_mix(builder, &weights.ffn, normed, shifted.x_prev)?;
    builder.add(x, ffn)
}
