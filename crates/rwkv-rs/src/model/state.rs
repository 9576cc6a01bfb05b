//! Layout of the flat recurrent state buffer and typed views into it.
//!
//! A state buffer holds `n_layer` consecutive layer records of `slots_per_layer` vectors of
//! `n_embed` elements each:
//!
//! | slot | V4            | V5                          |
//! |------|---------------|-----------------------------|
//! | 0    | `ffn_shift`   | `ffn_shift`                 |
//! | 1    | `att_shift`   | `att_shift`                 |
//! | 2..  | `num, den, log_scale` | `heads` (`head_size` slots) |
//!
//! Inside a graph the input buffer is only ever read through [`InputView`]s and the output
//! buffer only ever written through [`OutputView`]s, each of which can be stored to once.

use super::config::{ArchVariant, RwkvConfig};
use crate::error::RwkvResult;
use crate::ops::graph::{GraphBuilder, TensorId};

/// Initial value of the log-domain running maximum; makes the empty history contribute nothing.
pub const INITIAL_LOG_SCALE: f32 = -1e30;

const FFN_SHIFT_SLOT: usize = 0;
const ATT_SHIFT_SLOT: usize = 1;
const ATT_STATE_SLOT: usize = 2;

/// Offsets of every per-layer field inside a state buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub variant: ArchVariant,
    pub n_embed: usize,
    pub n_layer: usize,
    pub head_size: usize,
}

impl StateLayout {
    pub fn new(config: &RwkvConfig) -> Self {
        StateLayout {
            variant: config.variant(),
            n_embed: config.n_embed,
            n_layer: config.n_layer,
            head_size: config.head_size,
        }
    }

    pub fn slots_per_layer(&self) -> usize {
        match self.variant {
            ArchVariant::V4 => 5,
            ArchVariant::V5 => 2 + self.head_size,
        }
    }

    pub fn layer_len(&self) -> usize {
        self.n_embed * self.slots_per_layer()
    }

    pub fn state_len(&self) -> usize {
        self.layer_len() * self.n_layer
    }

    /// Element offset of `slot` of `layer`.
    pub fn slot_offset(&self, layer: usize, slot: usize) -> usize {
        debug_assert!(layer < self.n_layer && slot < self.slots_per_layer());
        layer * self.layer_len() + slot * self.n_embed
    }

    /// Resets `state` to the empty history.
    ///
    /// Everything is zero except the V4 log-scale slots, which start at [`INITIAL_LOG_SCALE`].
    pub fn init_state(&self, state: &mut [f32]) {
        debug_assert_eq!(state.len(), self.state_len());
        state.fill(0.0);
        if self.variant == ArchVariant::V4 {
            for layer in 0..self.n_layer {
                let offset = self.slot_offset(layer, ATT_STATE_SLOT + 2);
                state[offset..offset + self.n_embed].fill(INITIAL_LOG_SCALE);
            }
        }
    }

    /// Creates the per-layer views of an input and an output state buffer.
    pub fn views(
        &self,
        builder: &mut GraphBuilder<'_>,
        input: TensorId,
        output: TensorId,
    ) -> RwkvResult<(Vec<LayerState<InputView>>, Vec<LayerState<OutputView>>)> {
        let mut inputs = Vec::with_capacity(self.n_layer);
        let mut outputs = Vec::with_capacity(self.n_layer);
        for layer in 0..self.n_layer {
            inputs.push(self.layer_views(builder, input, layer, InputView)?);
            outputs.push(self.layer_views(builder, output, layer, OutputView)?);
        }
        Ok((inputs, outputs))
    }

    fn layer_views<V>(
        &self,
        builder: &mut GraphBuilder<'_>,
        buffer: TensorId,
        layer: usize,
        wrap: fn(TensorId) -> V,
    ) -> RwkvResult<LayerState<V>> {
        let n = self.n_embed;
        let slot = |builder: &mut GraphBuilder<'_>, index: usize, len: usize| {
            builder
                .view_1d(buffer, len, self.slot_offset(layer, index))
                .map(wrap)
        };
        let ffn_shift = slot(builder, FFN_SHIFT_SLOT, n)?;
        let att_shift = slot(builder, ATT_SHIFT_SLOT, n)?;
        let att = match self.variant {
            ArchVariant::V4 => AttentionState::V4 {
                num: slot(builder, ATT_STATE_SLOT, n)?,
                den: slot(builder, ATT_STATE_SLOT + 1, n)?,
                log_scale: slot(builder, ATT_STATE_SLOT + 2, n)?,
            },
            ArchVariant::V5 => AttentionState::V5 {
                heads: slot(builder, ATT_STATE_SLOT, n * self.head_size)?,
            },
        };
        Ok(LayerState {
            ffn_shift,
            att_shift,
            att,
        })
    }
}

/// Read-only window into the input state buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputView(TensorId);

impl InputView {
    pub fn tensor(self) -> TensorId {
        self.0
    }
}

/// Exclusive window into the output state buffer.
///
/// The only operation is [`OutputView::store`], which consumes the view.
#[derive(Debug, PartialEq, Eq)]
pub struct OutputView(TensorId);

impl OutputView {
    /// Copies `value` into the window and registers the write immediately, so it is ordered
    /// after everything `value` depends on and before any later node.
    pub fn store(self, builder: &mut GraphBuilder<'_>, value: TensorId) -> RwkvResult<TensorId> {
        let write = builder.cpy(value, self.0)?;
        builder.expand(write);
        Ok(write)
    }
}

/// Carried memory of one layer, parameterised over how each field is referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerState<V> {
    pub ffn_shift: V,
    pub att_shift: V,
    pub att: AttentionState<V>,
}

/// Variant-specific accumulators; exactly one shape exists per model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttentionState<V> {
    V4 { num: V, den: V, log_scale: V },
    V5 { heads: V },
}

impl LayerState<InputView> {
    /// Working copy of the carried state as plain graph tensors.
    pub fn tensors(&self) -> LayerState<TensorId> {
        LayerState {
            ffn_shift: self.ffn_shift.tensor(),
            att_shift: self.att_shift.tensor(),
            att: match &self.att {
                AttentionState::V4 {
                    num,
                    den,
                    log_scale,
                } => AttentionState::V4 {
                    num: num.tensor(),
                    den: den.tensor(),
                    log_scale: log_scale.tensor(),
                },
                AttentionState::V5 { heads } => AttentionState::V5 {
                    heads: heads.tensor(),
                },
            },
        }
    }
}

impl LayerState<OutputView> {
    /// Writes the updated state of one layer into the output buffer.
    pub fn store(
        self,
        builder: &mut GraphBuilder<'_>,
        updated: &LayerState<TensorId>,
    ) -> RwkvResult<()> {
        self.ffn_shift.store(builder, updated.ffn_shift)?;
        self.att_shift.store(builder, updated.att_shift)?;
        match (self.att, &updated.att) {
            (
                AttentionState::V4 {
                    num,
                    den,
                    log_scale,
                },
                AttentionState::V4 {
                    num: new_num,
                    den: new_den,
                    log_scale: new_log_scale,
                },
            ) => {
                num.store(builder, *new_num)?;
                den.store(builder, *new_den)?;
                log_scale.store(builder, *new_log_scale)?;
            }
            (AttentionState::V5 { heads }, AttentionState::V5 { heads: new_heads }) => {
                heads.store(builder, *new_heads)?;
            }
            _ => panic!("attention state variant changed during graph construction"),
        }
        Ok(())
    }
}
