//! Version 5 time mixing checked against a direct f64 evaluation of the matrix recurrence.
//!
//! Mixes are all one, so every projection sees the current position only, and the projections
//! are diagonal with distinct entries. Per-channel bonus and decay differ across the key index
//! of each head and the initial state is not symmetric, so swapping the key and value axes
//! anywhere changes the result.

use std::sync::Arc;

use approx::assert_relative_eq;
use rwkv_rs::model::{GateWeights, LayerNormWeights, TimeMixV5Weights};
use rwkv_rs::nn::{time_mix_v5, HeadLayout};
use rwkv_rs::ops::graph::GraphArena;
use rwkv_rs::{DType, GraphExecutor, HostTensor, RwkvConfig, Shape};
use rwkv_rs_backend_ref_cpu::CpuExecutor;

const HEAD_SIZE: usize = 4;
const HEAD_COUNT: usize = 2;
const N: usize = HEAD_SIZE * HEAD_COUNT;

fn channels(f: impl Fn(f32) -> f32) -> Vec<f32> {
    (0..N).map(|c| f(c as f32)).collect()
}

fn receptance_diag() -> Vec<f32> {
    channels(|c| 0.6 + 0.1 * c)
}

fn key_diag() -> Vec<f32> {
    channels(|c| 1.1 - 0.12 * c)
}

fn value_diag() -> Vec<f32> {
    channels(|c| -0.5 + 0.25 * c)
}

fn gate_diag() -> Vec<f32> {
    channels(|c| 0.9 - 0.2 * c)
}

fn bonus() -> Vec<f32> {
    channels(|c| 0.4 - 0.15 * c)
}

/// Already in evaluation form, i.e. the per-step multiplier.
fn decay() -> Vec<f32> {
    channels(|c| 0.95 - 0.09 * c)
}

fn inputs(seq_len: usize) -> Vec<f32> {
    (0..N * seq_len)
        .map(|index| {
            let (c, t) = (index % N, index / N);
            ((3 * c + 5 * t) % 7) as f32 * 0.3 - 0.8
        })
        .collect()
}

/// Flat `[value, key, head]` matrices; entry `(key i, value j)` differs from `(key j, value i)`.
fn initial_state() -> Vec<f32> {
    (0..N * HEAD_SIZE)
        .map(|index| ((7 * index) % 11) as f32 * 0.1 - 0.5)
        .collect()
}

fn vector(values: Vec<f32>) -> Arc<HostTensor> {
    Arc::new(HostTensor::from_vec(Shape::new([values.len()]), values).unwrap())
}

fn per_head(values: Vec<f32>) -> Arc<HostTensor> {
    Arc::new(HostTensor::from_vec(Shape::new([1, HEAD_SIZE, HEAD_COUNT]), values).unwrap())
}

fn diagonal(entries: &[f32]) -> Arc<HostTensor> {
    let mut data = vec![0.0; N * N];
    for (c, entry) in entries.iter().enumerate() {
        data[c * N + c] = *entry;
    }
    Arc::new(HostTensor::from_vec(Shape::new([N, N]), data).unwrap())
}

fn weights(gated: bool) -> TimeMixV5Weights {
    let ones = || Arc::new(HostTensor::ones(Shape::new([N])));
    TimeMixV5Weights {
        time_mix_k: ones(),
        time_mix_v: ones(),
        time_mix_r: ones(),
        time_first: per_head(bonus()),
        time_decay: per_head(decay()),
        key: diagonal(&key_diag()),
        value: diagonal(&value_diag()),
        receptance: diagonal(&receptance_diag()),
        output: diagonal(&[1.0; N]),
        ln_x: LayerNormWeights {
            weight: ones(),
            bias: vector(vec![0.0; N]),
        },
        gate: gated.then(|| GateWeights {
            time_mix_g: ones(),
            gate: diagonal(&gate_diag()),
        }),
    }
}

fn layout(minor: u32) -> HeadLayout {
    HeadLayout {
        head_size: HEAD_SIZE,
        head_count: HEAD_COUNT,
        group_norm_eps: RwkvConfig::v5(16, N, 1, HEAD_SIZE, minor).group_norm_eps(),
    }
}

/// Returns the `[N, seq_len]` block output and the updated flat state.
fn evaluate(minor: u32, seq_len: usize) -> (Vec<f32>, Vec<f32>) {
    let mut arena = GraphArena::with_capacity(1 << 20).unwrap();
    let x = arena.new_tensor(DType::F32, [N, seq_len, 1, 1]).unwrap();
    arena.write_f32(x, &inputs(seq_len)).unwrap();
    // Unit mixes multiply the shifted input by zero.
    let x_prev = arena.new_tensor(DType::F32, [N, seq_len, 1, 1]).unwrap();
    arena.write_f32(x_prev, &vec![7.0; N * seq_len]).unwrap();
    let state = arena.new_tensor(DType::F32, [N * HEAD_SIZE, 1, 1, 1]).unwrap();
    arena.write_f32(state, &initial_state()).unwrap();

    let weights = weights(minor >= 2);
    let mut builder = arena.builder();
    let mut heads_state = state;
    let out = time_mix_v5(&mut builder, &weights, layout(minor), x, x_prev, &mut heads_state)
        .unwrap();
    builder.expand(out);
    builder.expand(heads_state);
    let n_nodes = builder.n_nodes();
    CpuExecutor::new().compute(&mut arena, n_nodes, 1).unwrap();
    (
        arena.read_f32(out).unwrap(),
        arena.read_f32(heads_state).unwrap(),
    )
}

fn widen(values: &[f32]) -> Vec<f64> {
    values.iter().map(|v| *v as f64).collect()
}

fn silu(x: f64) -> f64 {
    x / (1.0 + (-x).exp())
}

/// `out[j] = sum_i r[i] * (u[i] * k[i] * v[j] + S[i][j])`, then `S[i][j] = w[i] * S[i][j] +
/// k[i] * v[j]`, per head and position, followed by the per-head norm and the optional gate.
fn reference(minor: u32, seq_len: usize) -> (Vec<f64>, Vec<f64>) {
    let x = widen(&inputs(seq_len));
    let (rd, kd, vd, gd) = (
        widen(&receptance_diag()),
        widen(&key_diag()),
        widen(&value_diag()),
        widen(&gate_diag()),
    );
    let (u, w) = (widen(&bonus()), widen(&decay()));
    let eps = layout(minor).group_norm_eps as f64;
    let mut state = widen(&initial_state());
    let mut out = vec![0.0; N * seq_len];

    for t in 0..seq_len {
        let column = &x[t * N..(t + 1) * N];
        let r: Vec<f64> = (0..N).map(|c| rd[c] * column[c]).collect();
        let k: Vec<f64> = (0..N).map(|c| kd[c] * column[c]).collect();
        let v: Vec<f64> = (0..N).map(|c| vd[c] * column[c]).collect();
        for h in 0..HEAD_COUNT {
            let base = h * HEAD_SIZE;
            let slot = |i: usize, j: usize| h * HEAD_SIZE * HEAD_SIZE + i * HEAD_SIZE + j;

            let mut readout = [0.0; HEAD_SIZE];
            for (j, value) in readout.iter_mut().enumerate() {
                for i in 0..HEAD_SIZE {
                    let kv = k[base + i] * v[base + j];
                    *value += r[base + i] * (u[base + i] * kv + state[slot(i, j)]);
                }
            }
            for i in 0..HEAD_SIZE {
                for j in 0..HEAD_SIZE {
                    state[slot(i, j)] =
                        w[base + i] * state[slot(i, j)] + k[base + i] * v[base + j];
                }
            }

            let mean = readout.iter().sum::<f64>() / HEAD_SIZE as f64;
            let var = readout.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / HEAD_SIZE as f64;
            for (j, value) in readout.iter().enumerate() {
                let c = base + j;
                let mut y = (value - mean) / (var + eps).sqrt();
                if minor >= 2 {
                    y *= silu(gd[c] * column[c]);
                }
                out[t * N + c] = y;
            }
        }
    }
    (out, state)
}

fn check(minor: u32, seq_len: usize) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (out, state) = evaluate(minor, seq_len);
    let (expected_out, expected_state) = reference(minor, seq_len);
    assert_eq!(state.len(), expected_state.len());
    for (actual, expected) in state.iter().zip(&expected_state) {
        assert_relative_eq!(*actual as f64, *expected, epsilon = 1e-5, max_relative = 1e-4);
    }
    assert_eq!(out.len(), expected_out.len());
    for (actual, expected) in out.iter().zip(&expected_out) {
        assert_relative_eq!(*actual as f64, *expected, epsilon = 1e-4, max_relative = 1e-3);
    }
}

#[test]
fn matrix_state_is_indexed_by_key_then_value() {
    check(1, 3);
}

#[test]
fn single_position_follows_the_same_recurrence() {
    check(1, 1);
}

#[test]
fn gate_scales_the_normalized_readout() {
    check(2, 3);
    check(2, 1);
}
