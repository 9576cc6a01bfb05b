use std::sync::Arc;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rwkv_rs::{RwkvConfig, RwkvContext, RwkvGraph, RwkvModel};
use rwkv_rs_backend_ref_cpu::CpuExecutor;

const TOKENS: [u32; 7] = [3, 1, 4, 1, 5, 9, 2];

fn context(config: RwkvConfig, seed: u64) -> RwkvContext<CpuExecutor> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(seed);
    let model = Arc::new(RwkvModel::random(config, &mut rng).unwrap());
    RwkvContext::new(model, Arc::new(CpuExecutor::new()), 2).unwrap()
}

struct Outputs {
    state: Vec<f32>,
    logits: Vec<f32>,
}

fn token_by_token(ctx: &mut RwkvContext<CpuExecutor>, tokens: &[u32]) -> Outputs {
    let mut state = vec![0.0; ctx.state_len()];
    let mut logits = vec![0.0; ctx.logits_len()];
    let mut previous: Option<Vec<f32>> = None;
    for &token in tokens {
        ctx.eval(token, previous.as_deref(), &mut state, Some(&mut logits))
            .unwrap();
        previous = Some(state.clone());
    }
    Outputs { state, logits }
}

fn whole_sequence(ctx: &mut RwkvContext<CpuExecutor>, tokens: &[u32]) -> Outputs {
    let mut state = vec![0.0; ctx.state_len()];
    let mut logits = vec![0.0; ctx.logits_len()];
    ctx.eval_sequence(tokens, None, &mut state, Some(&mut logits))
        .unwrap();
    Outputs { state, logits }
}

fn configs() -> [RwkvConfig; 3] {
    [
        RwkvConfig::v4(16, 8, 2),
        RwkvConfig::v5(16, 8, 2, 4, 1),
        RwkvConfig::v5(16, 8, 2, 4, 2),
    ]
}

#[test]
fn v4_sequence_matches_token_by_token_exactly() {
    let mut ctx = context(RwkvConfig::v4(16, 8, 3), 11);
    let serial = token_by_token(&mut ctx, &TOKENS);
    let sequential = whole_sequence(&mut ctx, &TOKENS);
    assert_eq!(serial.state, sequential.state);
    assert_eq!(serial.logits, sequential.logits);
}

#[test]
fn v5_sequence_matches_token_by_token() {
    for minor in [1, 2] {
        let mut ctx = context(RwkvConfig::v5(16, 8, 2, 4, minor), 12);
        let serial = token_by_token(&mut ctx, &TOKENS);
        let sequential = whole_sequence(&mut ctx, &TOKENS);
        for (a, b) in serial.state.iter().zip(&sequential.state) {
            assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-5);
        }
        for (a, b) in serial.logits.iter().zip(&sequential.logits) {
            assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-5);
        }
    }
}

#[test]
fn single_token_sequence_uses_the_serial_graph() {
    let mut ctx = context(RwkvConfig::v4(16, 8, 2), 3);
    let serial = token_by_token(&mut ctx, &[6]);
    let sequential = whole_sequence(&mut ctx, &[6]);
    assert!(ctx.sequential_graph().is_none());
    assert_eq!(serial.state, sequential.state);
    assert_eq!(serial.logits, sequential.logits);
}

#[test]
fn chunked_evaluation_matches_whole_sequence() {
    for config in configs() {
        let mut ctx = context(config, 5);
        let whole = whole_sequence(&mut ctx, &TOKENS);
        for chunk_size in [1, 3, 7, 16] {
            let mut state = vec![0.0; ctx.state_len()];
            let mut logits = vec![0.0; ctx.logits_len()];
            ctx.eval_sequence_in_chunks(&TOKENS, chunk_size, None, &mut state, Some(&mut logits))
                .unwrap();
            for (a, b) in whole.state.iter().zip(&state) {
                assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-5);
            }
            for (a, b) in whole.logits.iter().zip(&logits) {
                assert_relative_eq!(a, b, epsilon = 1e-6, max_relative = 1e-5);
            }
        }
    }
}

#[test]
fn state_continues_across_calls() {
    let mut ctx = context(RwkvConfig::v4(16, 8, 2), 8);
    let whole = whole_sequence(&mut ctx, &TOKENS);

    let (head, tail) = TOKENS.split_at(4);
    let mut state = vec![0.0; ctx.state_len()];
    ctx.eval_sequence(head, None, &mut state, None).unwrap();
    let carried = state.clone();
    let mut logits = vec![0.0; ctx.logits_len()];
    ctx.eval_sequence(tail, Some(&carried), &mut state, Some(&mut logits))
        .unwrap();

    assert_eq!(whole.state, state);
    assert_eq!(whole.logits, logits);
}

#[test]
fn skipping_logits_leaves_state_unchanged() {
    for config in configs() {
        let mut ctx = context(config, 9);
        for tokens in [&TOKENS[..1], &TOKENS[..]] {
            let mut with_logits = vec![0.0; ctx.state_len()];
            let mut logits = vec![0.0; ctx.logits_len()];
            ctx.eval_sequence(tokens, None, &mut with_logits, Some(&mut logits))
                .unwrap();
            let mut without_logits = vec![0.0; ctx.state_len()];
            ctx.eval_sequence(tokens, None, &mut without_logits, None)
                .unwrap();
            assert_eq!(with_logits, without_logits);
        }
    }
}

#[test]
fn logits_tail_is_recorded_after_state_updates() {
    let mut rng = StdRng::seed_from_u64(2);
    let model = RwkvModel::random(RwkvConfig::v4(16, 8, 2), &mut rng).unwrap();
    for sequence_len in [1, 5] {
        let graph = RwkvGraph::measure_and_build(&model, sequence_len).unwrap();
        let counts = graph.counts();
        assert!(counts.pre_logits_nodes < counts.post_logits_nodes);
        assert!(counts.pre_logits_leafs <= counts.post_logits_leafs);
        assert_eq!(counts.post_logits_nodes, graph.arena().n_nodes());
        assert_eq!(counts.post_logits_leafs, graph.arena().n_leafs());
    }
}

#[test]
fn graph_memory_is_planned_from_measurement() {
    let mut rng = StdRng::seed_from_u64(4);
    let model = RwkvModel::random(RwkvConfig::v5(16, 8, 2, 4, 2), &mut rng).unwrap();
    let short = RwkvGraph::measure_and_build(&model, 2).unwrap();
    let long = RwkvGraph::measure_and_build(&model, 6).unwrap();
    assert!(short.plan().measured_bytes < long.plan().measured_bytes);
    for graph in [&short, &long] {
        let plan = graph.plan();
        assert!(plan.required_bytes > plan.measured_bytes);
        assert_eq!(graph.arena().used_bytes(), plan.measured_bytes);
        assert_eq!(graph.arena().capacity_bytes(), plan.required_bytes);
    }
    assert!(RwkvGraph::measure_and_build(&model, 0).is_err());
}

#[test]
fn rebuilding_for_the_same_length_measures_the_same_graph() {
    let mut rng = StdRng::seed_from_u64(6);
    for config in configs() {
        let model = RwkvModel::random(config, &mut rng).unwrap();
        let first = RwkvGraph::measure_and_build(&model, 4).unwrap();
        let second = RwkvGraph::measure_and_build(&model, 4).unwrap();
        assert_eq!(first.plan(), second.plan());
        assert_eq!(first.counts(), second.counts());
        assert_eq!(first.arena().used_bytes(), second.arena().used_bytes());
    }
}
