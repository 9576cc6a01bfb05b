//! Host-side tensor types shared by the model loader and the graph layer.
mod dtype;
mod host_tensor;
mod shape;

pub use dtype::DType;
pub use host_tensor::HostTensor;
pub use shape::{Shape, MAX_DIMS};
