//! End-to-end checks against values derived by hand for a one-layer model whose projections
//! are identities, whose mixes select the current position and whose time parameters vanish.

use std::collections::HashMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use rwkv_rs::{HostTensor, RwkvConfig, RwkvContext, RwkvModel, Shape};
use rwkv_rs_backend_ref_cpu::CpuExecutor;

const N: usize = 4;

fn identity() -> HostTensor {
    let mut data = vec![0.0; N * N];
    for i in 0..N {
        data[i * N + i] = 1.0;
    }
    HostTensor::from_vec(Shape::new([N, N]), data).unwrap()
}

fn checkpoint() -> HashMap<String, HostTensor> {
    let vector = Shape::new([N]);
    let mut tensors = HashMap::new();
    tensors.insert("emb.weight".to_string(), identity());
    tensors.insert("head.weight".to_string(), identity());
    for norm in ["blocks.0.ln0", "blocks.0.ln1", "blocks.0.ln2", "ln_out"] {
        tensors.insert(format!("{norm}.weight"), HostTensor::ones(vector));
        tensors.insert(format!("{norm}.bias"), HostTensor::zeros(vector));
    }
    for mix in [
        "att.time_mix_k",
        "att.time_mix_v",
        "att.time_mix_r",
        "ffn.time_mix_k",
        "ffn.time_mix_r",
    ] {
        tensors.insert(format!("blocks.0.{mix}"), HostTensor::ones(vector));
    }
    for time in ["att.time_first", "att.time_decay"] {
        tensors.insert(format!("blocks.0.{time}"), HostTensor::zeros(vector));
    }
    for projection in [
        "att.key",
        "att.value",
        "att.receptance",
        "att.output",
        "ffn.key",
        "ffn.value",
        "ffn.receptance",
    ] {
        tensors.insert(format!("blocks.0.{projection}.weight"), identity());
    }
    tensors
}

fn context() -> RwkvContext<CpuExecutor> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = RwkvConfig {
        ffn_dim: N,
        ..RwkvConfig::v4(N, N, 1)
    };
    let model = RwkvModel::from_named_tensors(config, checkpoint()).unwrap();
    RwkvContext::new(Arc::new(model), Arc::new(CpuExecutor::new()), 1).unwrap()
}

fn layer_norm(x: &[f64]) -> Vec<f64> {
    let mean = x.iter().sum::<f64>() / x.len() as f64;
    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / x.len() as f64;
    x.iter().map(|v| (v - mean) / (var + 1e-5).sqrt()).collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn one_hot(token: usize) -> Vec<f64> {
    (0..N).map(|i| if i == token { 1.0 } else { 0.0 }).collect()
}

/// Channel mixing and the logits tail applied after the attention residual.
fn finish(x: &[f64], att: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let x1: Vec<f64> = x.iter().zip(att).map(|(a, b)| a + b).collect();
    let n2 = layer_norm(&x1);
    let x2: Vec<f64> = x1
        .iter()
        .zip(&n2)
        .map(|(x, n)| x + sigmoid(*n) * n.max(0.0).powi(2))
        .collect();
    (n2, layer_norm(&x2))
}

fn assert_close(actual: &[f32], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert_relative_eq!(*a as f64, *e, epsilon = 1e-5, max_relative = 1e-4);
    }
}

struct Expected {
    ffn_shift: Vec<f64>,
    att_shift: Vec<f64>,
    num_linear: Vec<f64>,
    den_linear: Vec<f64>,
    logits: Vec<f64>,
}

/// Hand-derived outputs after feeding `tokens` from the initial state.
///
/// With unit mixes, identity projections and zero time parameters, the attention output is
/// `sigmoid(n) * wkv` where `wkv` is the softmax-weighted average of every normalized input
/// seen so far, each weighted by `exp` of itself.
fn expected(tokens: &[usize]) -> Expected {
    let mut num = vec![0.0; N];
    let mut den = vec![0.0; N];
    let mut result = None;
    for &token in tokens {
        let x0 = layer_norm(&one_hot(token));
        let n1 = layer_norm(&x0);
        for i in 0..N {
            num[i] += n1[i].exp() * n1[i];
            den[i] += n1[i].exp();
        }
        let att: Vec<f64> = (0..N).map(|i| sigmoid(n1[i]) * num[i] / den[i]).collect();
        let (n2, logits) = finish(&x0, &att);
        result = Some(Expected {
            ffn_shift: n2,
            att_shift: n1,
            num_linear: num.clone(),
            den_linear: den.clone(),
            logits,
        });
    }
    result.unwrap()
}

fn check_state(state: &[f32], expected: &Expected) {
    assert_close(&state[0..N], &expected.ffn_shift);
    assert_close(&state[N..2 * N], &expected.att_shift);
    let num = &state[2 * N..3 * N];
    let den = &state[3 * N..4 * N];
    let log_scale = &state[4 * N..5 * N];
    let num_linear: Vec<f32> = (0..N).map(|i| num[i] * log_scale[i].exp()).collect();
    let den_linear: Vec<f32> = (0..N).map(|i| den[i] * log_scale[i].exp()).collect();
    assert_close(&num_linear, &expected.num_linear);
    assert_close(&den_linear, &expected.den_linear);
}

#[test]
fn first_token_from_empty_state() {
    let mut ctx = context();
    let mut state = vec![0.0; ctx.state_len()];
    let mut logits = vec![0.0; ctx.logits_len()];
    ctx.eval(0, None, &mut state, Some(&mut logits)).unwrap();

    let expected = expected(&[0]);
    check_state(&state, &expected);
    assert_close(&logits, &expected.logits);

    // A single position contributes weight one relative to its own key.
    assert_close(&state[3 * N..4 * N], &[1.0; N]);
    assert_close(&state[4 * N..5 * N], &expected.att_shift);
}

#[test]
fn second_token_averages_over_history() {
    let mut ctx = context();
    let mut state = vec![0.0; ctx.state_len()];
    ctx.eval(0, None, &mut state, None).unwrap();
    let carried = state.clone();
    let mut logits = vec![0.0; ctx.logits_len()];
    ctx.eval(2, Some(&carried), &mut state, Some(&mut logits))
        .unwrap();

    let expected = expected(&[0, 2]);
    check_state(&state, &expected);
    assert_close(&logits, &expected.logits);
}

#[test]
fn sequence_graph_reproduces_hand_derived_values() {
    let mut ctx = context();
    let mut state = vec![0.0; ctx.state_len()];
    let mut logits = vec![0.0; ctx.logits_len()];
    ctx.eval_sequence(&[1, 3, 0], None, &mut state, Some(&mut logits))
        .unwrap();

    let expected = expected(&[1, 3, 0]);
    check_state(&state, &expected);
    assert_close(&logits, &expected.logits);
}
