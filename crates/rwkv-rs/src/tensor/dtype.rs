use serde::{Deserialize, Serialize};

/// Scalar element types understood by the graph layer.
///
/// Activations, weights and state are `F32`; token ids are the only `I32` tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
}

impl DType {
    /// Returns the storage size of one element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
        }
    }
}
