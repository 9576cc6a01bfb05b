//! Two-pass sizing of graph arenas.
//!
//! The build closure runs first against a measuring arena, then against a backed arena sized
//! from the measurement. Both passes must record the same tensors in the same order.

use log::debug;

use super::arena::{GraphArena, TENSOR_ALIGNMENT};
use crate::error::RwkvResult;

/// Fixed slack reserved on top of the measured tensor bytes for graph bookkeeping.
pub const GRAPH_OVERHEAD: usize = 1 << 16;

/// Sizes recorded while planning a graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    pub measured_bytes: usize,
    pub required_bytes: usize,
}

/// Capacity of the backed arena for a graph that measured `measured_bytes`.
pub fn required_arena_bytes(measured_bytes: usize) -> usize {
    measured_bytes + GRAPH_OVERHEAD + TENSOR_ALIGNMENT
}

/// Measures the graph produced by `build`, then builds it again in an exactly sized arena.
pub fn measure_and_build<T, F>(mut build: F) -> RwkvResult<(GraphArena, T, MemoryPlan)>
where
    F: FnMut(&mut GraphArena) -> RwkvResult<T>,
{
    let mut measuring = GraphArena::measuring();
    build(&mut measuring)?;
    let measured_bytes = measuring.used_bytes();
    drop(measuring);

    let required_bytes = required_arena_bytes(measured_bytes);
    let mut arena = GraphArena::with_capacity(required_bytes)?;
    let value = build(&mut arena)?;
    debug!(
        "graph arena planned: {} tensors, {} nodes, {} leafs, {} bytes measured, {} bytes reserved",
        arena.num_tensors(),
        arena.n_nodes(),
        arena.n_leafs(),
        measured_bytes,
        required_bytes
    );
    Ok((
        arena,
        value,
        MemoryPlan {
            measured_bytes,
            required_bytes,
        },
    ))
}
