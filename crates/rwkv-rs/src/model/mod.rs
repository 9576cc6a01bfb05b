//! Model description: hyperparameters, the shared weight table and the recurrent state layout.
pub mod config;
pub mod state;
pub mod weights;

pub use config::{ArchVariant, RwkvConfig};
pub use state::{AttentionState, InputView, LayerState, OutputView, StateLayout, INITIAL_LOG_SCALE};
pub use weights::{
    random_named_tensors, BlockWeights, ChannelMixWeights, GateWeights, LayerNormWeights,
    RwkvModel, TimeMixV4Weights, TimeMixV5Weights, TimeMixWeights,
};
