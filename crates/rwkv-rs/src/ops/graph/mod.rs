//! Arena-backed computation graphs.
//!
//! Every tensor of a graph, inputs and intermediates alike, is carved out of one
//! [`GraphArena`] whose byte budget is fixed at creation. Graphs are built twice: once against
//! a measuring arena that only accounts for sizes, then against a backed arena of exactly the
//! measured size plus fixed overheads (see [`plan`]).
mod arena;
mod builder;
pub mod plan;
mod state;

pub use arena::{GraphArena, TensorId, TENSOR_ALIGNMENT, TENSOR_OVERHEAD};
pub use builder::GraphBuilder;
pub use plan::{measure_and_build, required_arena_bytes, MemoryPlan, GRAPH_OVERHEAD};
