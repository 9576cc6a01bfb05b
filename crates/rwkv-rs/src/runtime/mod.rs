//! Graph assembly and the evaluation context built on it.
mod context;
mod graph;

pub use context::RwkvContext;
pub use graph::{GraphCounts, RwkvGraph};
