//! Graph construction and recurrent state handling for RWKV sequence models.
//!
//! A model evaluation is expressed as a computation graph carved out of a precisely sized
//! [`GraphArena`](ops::graph::GraphArena), together with a flat state buffer that carries the
//! recurrent memory from one call to the next. Execution of the built graph is delegated to a
//! [`GraphExecutor`] implementation such as the reference CPU backend.
pub mod backend;
mod env;
pub mod error;
pub mod model;
pub mod nn;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use backend::spec::GraphExecutor;
pub use error::{ErrorFlags, RwkvError, RwkvResult};
pub use model::{ArchVariant, RwkvConfig, RwkvModel};
pub use runtime::{RwkvContext, RwkvGraph};
pub use tensor::{DType, HostTensor, Shape};
