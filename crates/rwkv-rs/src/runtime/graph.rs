//! Whole-model graphs for one fixed number of tokens.
//!
//! A graph reads `sequence_len` token ids and one state buffer, writes the updated state
//! buffer and the logits of the last position. The logits projection is recorded last, so
//! evaluating only the first [`GraphCounts::pre_logits_nodes`] nodes updates the state
//! without computing logits.

use log::trace;

use crate::backend::spec::GraphExecutor;
use crate::error::{RwkvError, RwkvResult};
use crate::model::{LayerNormWeights, RwkvModel, StateLayout};
use crate::nn::block;
use crate::ops::functional::layer_norm;
use crate::ops::graph::{measure_and_build, GraphArena, GraphBuilder, MemoryPlan, TensorId};
use crate::tensor::DType;

/// Node and leaf counts recorded before and after the logits tail was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCounts {
    pub pre_logits_nodes: usize,
    pub pre_logits_leafs: usize,
    pub post_logits_nodes: usize,
    pub post_logits_leafs: usize,
}

#[derive(Debug, Clone, Copy)]
struct GraphTensors {
    tokens: TensorId,
    input_state: TensorId,
    output_state: TensorId,
    logits: TensorId,
    counts: GraphCounts,
}

/// Built graph together with the arena holding all of its tensors.
pub struct RwkvGraph {
    arena: GraphArena,
    layout: StateLayout,
    n_vocab: usize,
    sequence_len: usize,
    tensors: GraphTensors,
    plan: MemoryPlan,
}

fn final_norm(
    builder: &mut GraphBuilder<'_>,
    weights: &LayerNormWeights,
    x: TensorId,
) -> RwkvResult<TensorId> {
    let weight = builder.weight(&weights.weight)?;
    let bias = builder.weight(&weights.bias)?;
    layer_norm(builder, x, weight, bias)
}

fn assemble(
    arena: &mut GraphArena,
    model: &RwkvModel,
    sequence_len: usize,
) -> RwkvResult<GraphTensors> {
    let config = &model.config;
    let layout = config.state_layout();
    let mut builder = arena.builder();

    let tokens = builder.new_tensor_1d(DType::I32, sequence_len)?;
    let input_state = builder.new_tensor_1d(DType::F32, layout.state_len())?;
    let output_state = builder.new_tensor_1d(DType::F32, layout.state_len())?;
    let (inputs, outputs) = layout.views(&mut builder, input_state, output_state)?;

    let emb = builder.weight(&model.emb)?;
    let x = builder.get_rows(emb, tokens)?;
    let mut x = final_norm(&mut builder, &model.ln0, x)?;

    for ((weights, input), output) in model.blocks.iter().zip(inputs).zip(outputs) {
        let mut state = input.tensors();
        x = block(&mut builder, config, weights, x, &mut state)?;
        output.store(&mut builder, &state)?;
    }

    let pre_logits_nodes = builder.n_nodes();
    let pre_logits_leafs = builder.n_leafs();

    let last = if sequence_len == 1 {
        x
    } else {
        builder.view_1d(x, config.n_embed, (sequence_len - 1) * config.n_embed)?
    };
    let last = final_norm(&mut builder, &model.ln_out, last)?;
    let head = builder.weight(&model.head)?;
    let logits = builder.mul_mat(head, last)?;
    builder.expand(logits);

    Ok(GraphTensors {
        tokens,
        input_state,
        output_state,
        logits,
        counts: GraphCounts {
            pre_logits_nodes,
            pre_logits_leafs,
            post_logits_nodes: builder.n_nodes(),
            post_logits_leafs: builder.n_leafs(),
        },
    })
}

impl RwkvGraph {
    /// Measures and builds the single-token graph.
    pub fn measure_and_build_serial(model: &RwkvModel) -> RwkvResult<Self> {
        RwkvGraph::measure_and_build(model, 1)
    }

    /// Measures and builds the graph consuming `sequence_len` tokens per evaluation.
    pub fn measure_and_build(model: &RwkvModel, sequence_len: usize) -> RwkvResult<Self> {
        if sequence_len == 0 {
            return Err(RwkvError::invalid_argument("sequence length must be positive"));
        }
        let (arena, tensors, plan) =
            measure_and_build(|arena| assemble(arena, model, sequence_len))?;
        Ok(RwkvGraph {
            arena,
            layout: model.config.state_layout(),
            n_vocab: model.config.n_vocab,
            sequence_len,
            tensors,
            plan,
        })
    }

    pub fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    pub fn counts(&self) -> GraphCounts {
        self.tensors.counts
    }

    pub fn plan(&self) -> MemoryPlan {
        self.plan
    }

    pub fn arena(&self) -> &GraphArena {
        &self.arena
    }

    /// Runs the graph.
    ///
    /// `state_in = None` starts from the initial state. Without `logits_out` only the nodes
    /// recorded before the logits tail are executed. Buffer lengths are checked by the caller.
    pub(crate) fn evaluate<E: GraphExecutor + ?Sized>(
        &mut self,
        executor: &E,
        tokens: &[u32],
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
        n_threads: usize,
    ) -> RwkvResult<()> {
        debug_assert_eq!(tokens.len(), self.sequence_len);
        debug_assert_eq!(state_out.len(), self.layout.state_len());
        let ids: Vec<i32> = tokens.iter().map(|&token| token as i32).collect();
        self.arena.write_i32(self.tensors.tokens, &ids)?;
        match state_in {
            Some(state) => self.arena.write_f32(self.tensors.input_state, state)?,
            None => {
                let mut initial = vec![0.0; self.layout.state_len()];
                self.layout.init_state(&mut initial);
                self.arena.write_f32(self.tensors.input_state, &initial)?;
            }
        }

        let counts = self.tensors.counts;
        let n_nodes = if logits_out.is_some() {
            counts.post_logits_nodes
        } else {
            counts.pre_logits_nodes
        };
        trace!(
            "evaluating {n_nodes} nodes for {} tokens on {}",
            tokens.len(),
            executor.backend_name()
        );
        executor.compute(&mut self.arena, n_nodes, n_threads)?;

        state_out.copy_from_slice(&self.arena.read_f32(self.tensors.output_state)?);
        if let Some(logits) = logits_out {
            debug_assert_eq!(logits.len(), self.n_vocab);
            logits.copy_from_slice(&self.arena.read_f32(self.tensors.logits)?);
        }
        Ok(())
    }
}
