//! Evaluation context: one model, its graphs, and the error bookkeeping of a caller.

use std::sync::Arc;

use log::{error, info};

use super::graph::RwkvGraph;
use crate::backend::spec::GraphExecutor;
use crate::env;
use crate::error::{record_global_error, ErrorFlags, RwkvError, RwkvResult};
use crate::model::{RwkvModel, StateLayout};

/// Evaluates a shared [`RwkvModel`] one token or one sequence at a time.
///
/// The context owns a single-token graph and, once a multi-token evaluation was requested, a
/// graph for the most recently used sequence length. State buffers are owned by the caller:
/// every evaluation reads `state_in` and writes `state_out`, and the caller feeds the output
/// back in as the next input.
pub struct RwkvContext<E: GraphExecutor + ?Sized> {
    model: Arc<RwkvModel>,
    executor: Arc<E>,
    layout: StateLayout,
    serial: RwkvGraph,
    sequential: Option<RwkvGraph>,
    last_used_sequence_length: usize,
    n_threads: usize,
    print_errors: bool,
    last_error: ErrorFlags,
}

fn check_threads(n_threads: usize) -> RwkvResult<()> {
    if n_threads == 0 {
        return Err(RwkvError::invalid_argument("thread count must be positive"));
    }
    Ok(())
}

impl<E: GraphExecutor + ?Sized> RwkvContext<E> {
    /// Creates a context and builds its single-token graph.
    ///
    /// Failures are recorded in the process-wide error slot, see
    /// [`take_global_last_error`](crate::error::take_global_last_error).
    pub fn new(model: Arc<RwkvModel>, executor: Arc<E>, n_threads: usize) -> RwkvResult<Self> {
        RwkvContext::create(model, executor, n_threads, env::print_errors_default())
            .inspect_err(record_global_error)
    }

    fn create(
        model: Arc<RwkvModel>,
        executor: Arc<E>,
        n_threads: usize,
        print_errors: bool,
    ) -> RwkvResult<Self> {
        check_threads(n_threads)?;
        let serial = RwkvGraph::measure_and_build_serial(&model)?;
        Ok(RwkvContext {
            layout: model.config.state_layout(),
            model,
            executor,
            serial,
            sequential: None,
            last_used_sequence_length: 0,
            n_threads,
            print_errors,
            last_error: ErrorFlags::NONE,
        })
    }

    /// Creates an independent context sharing this context's model and executor.
    ///
    /// The clone gets its own single-token graph, no sequence graph and inherits the
    /// print-errors setting. Failures are recorded on `self`.
    pub fn clone_context(&mut self, n_threads: usize) -> RwkvResult<Self> {
        let result = RwkvContext::create(
            Arc::clone(&self.model),
            Arc::clone(&self.executor),
            n_threads,
            self.print_errors,
        );
        self.record(result)
    }

    fn record<T>(&mut self, result: RwkvResult<T>) -> RwkvResult<T> {
        if let Err(err) = &result {
            self.last_error |= err.flags();
            if self.print_errors {
                error!("{err}");
            }
        }
        result
    }

    fn check_tokens(&self, tokens: &[u32]) -> RwkvResult<()> {
        if tokens.is_empty() {
            return Err(RwkvError::invalid_argument("token sequence is empty"));
        }
        let n_vocab = self.model.config.n_vocab;
        if let Some(&token) = tokens.iter().find(|&&token| token as usize >= n_vocab) {
            return Err(RwkvError::invalid_argument(format!(
                "token {token} is out of range for a vocabulary of {n_vocab}"
            )));
        }
        Ok(())
    }

    fn check_buffers(
        &self,
        state_in: Option<&[f32]>,
        state_out: &[f32],
        logits_out: Option<&[f32]>,
    ) -> RwkvResult<()> {
        let state_len = self.state_len();
        if let Some(state) = state_in {
            if state.len() != state_len {
                return Err(RwkvError::buffer_size("input state", state_len, state.len()));
            }
        }
        if state_out.len() != state_len {
            return Err(RwkvError::buffer_size("output state", state_len, state_out.len()));
        }
        if let Some(logits) = logits_out {
            if logits.len() != self.logits_len() {
                return Err(RwkvError::buffer_size("logits", self.logits_len(), logits.len()));
            }
        }
        Ok(())
    }

    /// Evaluates a single token with the single-token graph.
    pub fn eval(
        &mut self,
        token: u32,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> RwkvResult<()> {
        let result = self.try_eval(token, state_in, state_out, logits_out);
        self.record(result)
    }

    fn try_eval(
        &mut self,
        token: u32,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> RwkvResult<()> {
        let tokens = [token];
        self.check_tokens(&tokens)?;
        self.check_buffers(state_in, state_out, logits_out.as_deref())?;
        self.serial.evaluate(
            self.executor.as_ref(),
            &tokens,
            state_in,
            state_out,
            logits_out,
            self.n_threads,
        )
    }

    /// Evaluates `tokens` in one pass; the logits belong to the last token.
    ///
    /// A single token uses the single-token graph. Otherwise the sequence graph is rebuilt
    /// whenever the length differs from the previous call.
    pub fn eval_sequence(
        &mut self,
        tokens: &[u32],
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> RwkvResult<()> {
        let result = self.try_eval_sequence(tokens, state_in, state_out, logits_out);
        self.record(result)
    }

    fn try_eval_sequence(
        &mut self,
        tokens: &[u32],
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> RwkvResult<()> {
        self.check_tokens(tokens)?;
        self.check_buffers(state_in, state_out, logits_out.as_deref())?;
        let executor = Arc::clone(&self.executor);
        let n_threads = self.n_threads;
        let graph = if tokens.len() == 1 {
            &mut self.serial
        } else {
            self.sequence_graph(tokens.len())?
        };
        graph.evaluate(
            executor.as_ref(),
            tokens,
            state_in,
            state_out,
            logits_out,
            n_threads,
        )
    }

    fn sequence_graph(&mut self, sequence_len: usize) -> RwkvResult<&mut RwkvGraph> {
        let cached = self.sequential.is_some() && self.last_used_sequence_length == sequence_len;
        if !cached {
            self.sequential = None;
            self.last_used_sequence_length = 0;
            info!("building sequence graph for {sequence_len} tokens");
            let graph = RwkvGraph::measure_and_build(&self.model, sequence_len)?;
            self.last_used_sequence_length = sequence_len;
            self.sequential = Some(graph);
        }
        self.sequential
            .as_mut()
            .ok_or_else(|| RwkvError::model(ErrorFlags::GRAPH, "sequence graph is missing"))
    }

    /// Builds the sequence graph for `sequence_len` tokens ahead of the first evaluation.
    ///
    /// A length of one is served by the single-token graph and builds nothing.
    pub fn prepare_sequence(&mut self, sequence_len: usize) -> RwkvResult<()> {
        let result = if sequence_len == 0 {
            Err(RwkvError::invalid_argument("sequence length must be positive"))
        } else if sequence_len == 1 {
            Ok(())
        } else {
            self.sequence_graph(sequence_len).map(|_| ())
        };
        self.record(result)
    }

    /// Evaluates `tokens` as consecutive chunks of at most `chunk_size` tokens.
    ///
    /// The state is threaded from chunk to chunk; only the last chunk computes logits.
    pub fn eval_sequence_in_chunks(
        &mut self,
        tokens: &[u32],
        chunk_size: usize,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> RwkvResult<()> {
        let result = self.try_eval_in_chunks(tokens, chunk_size, state_in, state_out, logits_out);
        self.record(result)
    }

    fn try_eval_in_chunks(
        &mut self,
        tokens: &[u32],
        chunk_size: usize,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        mut logits_out: Option<&mut [f32]>,
    ) -> RwkvResult<()> {
        if chunk_size == 0 {
            return Err(RwkvError::invalid_argument("chunk size must be positive"));
        }
        self.check_tokens(tokens)?;
        self.check_buffers(state_in, state_out, logits_out.as_deref())?;

        let chunk_count = tokens.len().div_ceil(chunk_size);
        let mut carried: Option<Vec<f32>> = None;
        for (index, chunk) in tokens.chunks(chunk_size).enumerate() {
            let input = carried.as_deref().or(state_in);
            let logits = if index + 1 == chunk_count {
                logits_out.take()
            } else {
                None
            };
            self.try_eval_sequence(chunk, input, state_out, logits)?;
            carried = Some(state_out.to_vec());
        }
        Ok(())
    }

    /// Fills `state` with the initial (empty history) state.
    pub fn init_state(&mut self, state: &mut [f32]) -> RwkvResult<()> {
        let result = if state.len() == self.state_len() {
            self.layout.init_state(state);
            Ok(())
        } else {
            Err(RwkvError::buffer_size("state", self.state_len(), state.len()))
        };
        self.record(result)
    }

    /// Returns and clears the flags of every failure since the previous call.
    pub fn take_last_error(&mut self) -> ErrorFlags {
        std::mem::take(&mut self.last_error)
    }

    pub fn set_print_errors(&mut self, enabled: bool) {
        self.print_errors = enabled;
    }

    pub fn print_errors(&self) -> bool {
        self.print_errors
    }

    pub fn set_n_threads(&mut self, n_threads: usize) -> RwkvResult<()> {
        let result = check_threads(n_threads).map(|()| self.n_threads = n_threads);
        self.record(result)
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn model(&self) -> &Arc<RwkvModel> {
        &self.model
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Number of `f32` elements in a state buffer.
    pub fn state_len(&self) -> usize {
        self.layout.state_len()
    }

    /// Number of `f32` elements in a logits buffer.
    pub fn logits_len(&self) -> usize {
        self.model.config.n_vocab
    }

    pub fn n_vocab(&self) -> usize {
        self.model.config.n_vocab
    }

    pub fn n_embed(&self) -> usize {
        self.model.config.n_embed
    }

    pub fn n_layer(&self) -> usize {
        self.model.config.n_layer
    }

    pub fn serial_graph(&self) -> &RwkvGraph {
        &self.serial
    }

    /// Graph of the most recent multi-token evaluation, if any.
    pub fn sequential_graph(&self) -> Option<&RwkvGraph> {
        self.sequential.as_ref()
    }

    pub fn last_used_sequence_length(&self) -> usize {
        self.last_used_sequence_length
    }
}
