//! Time mixing for version 5 blocks: one `head_size x head_size` state matrix per head.
//!
//! State matrices are stored as `[head_size (value index), head_size (key index), head_count]`.
//! Everything except the state recurrence is computed for all positions at once.

use super::shift::mix;
use crate::error::RwkvResult;
use crate::model::TimeMixV5Weights;
use crate::ops::functional::group_norm;
use crate::ops::graph::{GraphBuilder, TensorId};
use crate::tensor::DType;

/// Head geometry and readout normalization of a version 5 model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadLayout {
    pub head_size: usize,
    pub head_count: usize,
    pub group_norm_eps: f32,
}

/// One position of the matrix recurrence.
///
/// `r`, `k` and `v` are the position's `[n_embed]` projections. Returns the `[head_size, 1,
/// head_count]` readout and replaces `state` with the decayed, updated matrices.
fn wkv_step(
    builder: &mut GraphBuilder<'_>,
    heads: HeadLayout,
    time_first: TensorId,
    time_decay: TensorId,
    (r, k, v): (TensorId, TensorId, TensorId),
    state: &mut TensorId,
) -> RwkvResult<TensorId> {
    let HeadLayout {
        head_size,
        head_count,
        ..
    } = heads;
    let r = builder.reshape(r, [head_size, 1, head_count, 1])?;
    let k = builder.reshape(k, [1, head_size, head_count, 1])?;
    let v = builder.reshape(v, [1, head_size, head_count, 1])?;

    // kv[j, i, h] = v[j, h] * k[i, h]
    let kv = builder.mul_mat(v, k)?;
    let bonus = builder.mul(kv, time_first)?;
    let attended = builder.add(bonus, *state)?;
    let attended = builder.transpose(attended)?;
    let out = builder.mul_mat(attended, r)?;

    let decayed = builder.mul(*state, time_decay)?;
    *state = builder.add(decayed, kv)?;
    Ok(out)
}

/// Version 5 time mixing of the normalized input `x` and its shifted copy `x_prev`.
///
/// `heads_state` is the flat `[n_embed * head_size]` state of the layer on entry and the
/// reshaped updated state on return.
pub fn time_mix_v5(
    builder: &mut GraphBuilder<'_>,
    weights: &TimeMixV5Weights,
    heads: HeadLayout,
    x: TensorId,
    x_prev: TensorId,
    heads_state: &mut TensorId,
) -> RwkvResult<TensorId> {
    let (n_embed, seq_len) = builder.dims2(x);
    let HeadLayout {
        head_size,
        head_count,
        group_norm_eps,
    } = heads;

    let mix_k = builder.weight(&weights.time_mix_k)?;
    let mix_v = builder.weight(&weights.time_mix_v)?;
    let mix_r = builder.weight(&weights.time_mix_r)?;
    let xk = mix(builder, x, x_prev, mix_k)?;
    let xv = mix(builder, x, x_prev, mix_v)?;
    let xr = mix(builder, x, x_prev, mix_r)?;

    let receptance = builder.weight(&weights.receptance)?;
    let r = builder.mul_mat(receptance, xr)?;
    let key = builder.weight(&weights.key)?;
    let k = builder.mul_mat(key, xk)?;
    let value = builder.weight(&weights.value)?;
    let v = builder.mul_mat(value, xv)?;

    let gate = match &weights.gate {
        Some(gate) => {
            let mix_g = builder.weight(&gate.time_mix_g)?;
            let xg = mix(builder, x, x_prev, mix_g)?;
            let projection = builder.weight(&gate.gate)?;
            let g = builder.mul_mat(projection, xg)?;
            Some(builder.silu(g)?)
        }
        None => None,
    };

    let time_first = builder.weight(&weights.time_first)?;
    let time_decay = builder.weight(&weights.time_decay)?;
    let mut state = builder.reshape(*heads_state, [head_size, head_size, head_count, 1])?;
    let out = if seq_len == 1 {
        let out = wkv_step(builder, heads, time_first, time_decay, (r, k, v), &mut state)?;
        builder.reshape(out, [n_embed, 1, 1, 1])?
    } else {
        let columns = builder.new_tensor_2d(DType::F32, n_embed, seq_len)?;
        for t in 0..seq_len {
            let offset = t * n_embed;
            let r_t = builder.view_1d(r, n_embed, offset)?;
            let k_t = builder.view_1d(k, n_embed, offset)?;
            let v_t = builder.view_1d(v, n_embed, offset)?;
            let out_t = wkv_step(
                builder,
                heads,
                time_first,
                time_decay,
                (r_t, k_t, v_t),
                &mut state,
            )?;
            let column = builder.view_1d(columns, n_embed, offset)?;
            let write = builder.cpy(out_t, column)?;
            builder.expand(write);
        }
        columns
    };
    *heads_state = state;

    let ln_x_weight = builder.weight(&weights.ln_x.weight)?;
    let ln_x_bias = builder.weight(&weights.ln_x.bias)?;
    let normalized = group_norm(
        builder,
        out,
        head_count,
        group_norm_eps,
        ln_x_weight,
        ln_x_bias,
    )?;
    let gated = match gate {
        Some(g) => builder.mul(normalized, g)?,
        None => normalized,
    };
    let output = builder.weight(&weights.output)?;
    builder.mul_mat(output, gated)
}
