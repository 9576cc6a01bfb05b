//! Internal bookkeeping records shared by the arena and builder.

use std::sync::Arc;

use smallvec::SmallVec;

use super::arena::TensorId;
use crate::backend::spec::{Operation, TensorSpec};
use crate::tensor::HostTensor;

/// Metadata kept for every tensor recorded in an arena.
pub(super) struct TensorRecord {
    pub(super) spec: TensorSpec,
    pub(super) op: Operation,
    pub(super) sources: SmallVec<[TensorId; 2]>,
    pub(super) storage: Storage,
}

/// Location of a tensor's first element.
///
/// Offsets are in elements. Views and copy nodes reuse the storage of the tensor they alias.
#[derive(Clone)]
pub(super) enum Storage {
    /// Data lives in the arena buffer; absent in measuring arenas.
    Arena { offset: usize },
    /// Data is borrowed from a model weight shared across contexts.
    Weight {
        tensor: Arc<HostTensor>,
        offset: usize,
    },
}

impl Storage {
    pub(super) fn shifted(&self, extra: usize) -> Storage {
        match self {
            Storage::Arena { offset } => Storage::Arena {
                offset: offset + extra,
            },
            Storage::Weight { tensor, offset } => Storage::Weight {
                tensor: Arc::clone(tensor),
                offset: offset + extra,
            },
        }
    }
}
