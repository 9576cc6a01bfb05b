//! Time mixing for version 4 blocks.
//!
//! The weighted key-value average is kept as three running vectors: a numerator, a
//! denominator and the log-domain scale both are expressed relative to. Each step rescales by
//! the larger of two exponents so every `exp` argument is at most zero.

use super::shift::mix;
use crate::error::RwkvResult;
use crate::model::TimeMixV4Weights;
use crate::ops::functional::{exp, maximum, sigmoid};
use crate::ops::graph::{GraphBuilder, TensorId};
use crate::tensor::DType;

/// Running accumulators of one version 4 layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulators {
    pub num: TensorId,
    pub den: TensorId,
    pub log_scale: TensorId,
}

/// Records one recurrence step for the `[n_embed]` key and value of a single position.
///
/// Returns the step's weighted average and advances `acc` to the post-step accumulators.
pub fn wkv_step(
    builder: &mut GraphBuilder<'_>,
    time_first: TensorId,
    time_decay: TensorId,
    k: TensorId,
    v: TensorId,
    acc: &mut Accumulators,
) -> RwkvResult<TensorId> {
    let ww = builder.add(time_first, k)?;
    let qq = maximum(builder, acc.log_scale, ww)?;
    let e1 = builder.sub(acc.log_scale, qq)?;
    let e1 = exp(builder, e1)?;
    let e2 = builder.sub(ww, qq)?;
    let e2 = exp(builder, e2)?;

    let scaled_num = builder.mul(e1, acc.num)?;
    let weighted_v = builder.mul(e2, v)?;
    let numerator = builder.add(scaled_num, weighted_v)?;
    let scaled_den = builder.mul(e1, acc.den)?;
    let denominator = builder.add(scaled_den, e2)?;
    let wkv = builder.div(numerator, denominator)?;

    let ww = builder.add(acc.log_scale, time_decay)?;
    let qq = maximum(builder, ww, k)?;
    let e1 = builder.sub(ww, qq)?;
    let e1 = exp(builder, e1)?;
    let e2 = builder.sub(k, qq)?;
    let e2 = exp(builder, e2)?;

    let scaled_num = builder.mul(e1, acc.num)?;
    let weighted_v = builder.mul(e2, v)?;
    let scaled_den = builder.mul(e1, acc.den)?;
    *acc = Accumulators {
        num: builder.add(scaled_num, weighted_v)?,
        den: builder.add(scaled_den, e2)?,
        log_scale: qq,
    };
    Ok(wkv)
}

/// Version 4 time mixing of the normalized input `x` and its shifted copy `x_prev`.
///
/// A single position feeds the step result straight into the output projection. Longer
/// inputs unroll one step per position, each copied into its column of a scratch matrix as
/// soon as it is recorded.
pub fn time_mix_v4(
    builder: &mut GraphBuilder<'_>,
    weights: &TimeMixV4Weights,
    x: TensorId,
    x_prev: TensorId,
    acc: &mut Accumulators,
) -> RwkvResult<TensorId> {
    let (n_embed, seq_len) = builder.dims2(x);
    let mix_k = builder.weight(&weights.time_mix_k)?;
    let mix_v = builder.weight(&weights.time_mix_v)?;
    let mix_r = builder.weight(&weights.time_mix_r)?;
    let xk = mix(builder, x, x_prev, mix_k)?;
    let xv = mix(builder, x, x_prev, mix_v)?;
    let xr = mix(builder, x, x_prev, mix_r)?;

    let receptance = builder.weight(&weights.receptance)?;
    let r = builder.mul_mat(receptance, xr)?;
    let r = sigmoid(builder, r)?;
    let key = builder.weight(&weights.key)?;
    let k = builder.mul_mat(key, xk)?;
    let value = builder.weight(&weights.value)?;
    let v = builder.mul_mat(value, xv)?;

    let time_first = builder.weight(&weights.time_first)?;
    let time_decay = builder.weight(&weights.time_decay)?;
    let wkv = if seq_len == 1 {
        wkv_step(builder, time_first, time_decay, k, v, acc)?
    } else {
        let columns = builder.new_tensor_2d(DType::F32, n_embed, seq_len)?;
        for t in 0..seq_len {
            let offset = t * n_embed;
            let k_t = builder.view_1d(k, n_embed, offset)?;
            let v_t = builder.view_1d(v, n_embed, offset)?;
            let wkv_t = wkv_step(builder, time_first, time_decay, k_t, v_t, acc)?;
            let column = builder.view_1d(columns, n_embed, offset)?;
            let write = builder.cpy(wkv_t, column)?;
            builder.expand(write);
        }
        columns
    };

    let gated = builder.mul(r, wkv)?;
    let output = builder.weight(&weights.output)?;
    builder.mul_mat(output, gated)
}
