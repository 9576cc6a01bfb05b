//! Tensor layouts, graph operations and the executor trait.
//!
//! A built graph is a list of [`Operation`] records inside a
//! [`GraphArena`](crate::ops::graph::GraphArena). Executors walk the registered node list in
//! order and write each result into the node's own storage; they never reorder nodes.

use thiserror::Error;

use crate::ops::graph::GraphArena;
use crate::tensor::{DType, MAX_DIMS};

/// Layout of a tensor inside the arena: element counts and element strides per axis.
///
/// Axis 0 is the fastest varying one. Views share storage with their base tensor and may have
/// non-contiguous strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub dtype: DType,
    pub ne: [usize; MAX_DIMS],
    pub nb: [usize; MAX_DIMS],
}

impl TensorSpec {
    /// Densely packed layout for the given element counts.
    pub fn contiguous(dtype: DType, ne: [usize; MAX_DIMS]) -> Self {
        let mut nb = [1; MAX_DIMS];
        for axis in 1..MAX_DIMS {
            nb[axis] = nb[axis - 1] * ne[axis - 1];
        }
        TensorSpec { dtype, ne, nb }
    }

    pub fn num_elements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Size in bytes of the packed payload.
    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }

    /// Number of storage elements between the first and one past the last addressed element.
    pub fn span(&self) -> usize {
        if self.num_elements() == 0 {
            return 0;
        }
        1 + self
            .ne
            .iter()
            .zip(self.nb.iter())
            .map(|(&ne, &nb)| (ne - 1) * nb)
            .sum::<usize>()
    }

    /// Reports whether the elements are packed in logical order. Axes of extent one are ignored.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for axis in 0..MAX_DIMS {
            if self.ne[axis] != 1 && self.nb[axis] != expected {
                return false;
            }
            expected *= self.ne[axis];
        }
        true
    }

    /// Only the first two axes are populated.
    pub fn is_matrix(&self) -> bool {
        self.ne[2] == 1 && self.ne[3] == 1
    }

    pub fn same_shape(&self, other: &TensorSpec) -> bool {
        self.ne == other.ne
    }

    /// Reports whether `self` can be tiled to cover `target` along every axis.
    pub fn can_repeat_into(&self, target: &TensorSpec) -> bool {
        self.ne
            .iter()
            .zip(target.ne.iter())
            .all(|(&src, &dst)| src != 0 && dst % src == 0)
    }

    /// Visits the storage offset of every element in logical order (axis 0 fastest).
    pub fn for_each_offset(&self, mut f: impl FnMut(usize)) {
        let [n0, n1, n2, n3] = self.ne;
        for i3 in 0..n3 {
            for i2 in 0..n2 {
                for i1 in 0..n1 {
                    let base = i1 * self.nb[1] + i2 * self.nb[2] + i3 * self.nb[3];
                    for i0 in 0..n0 {
                        f(base + i0 * self.nb[0]);
                    }
                }
            }
        }
    }
}

/// Pure element-wise kernel over one operand.
pub type UnaryKernelFn = fn(&[f32], &mut [f32]);
/// Pure element-wise kernel over two operands of identical shape.
pub type BinaryKernelFn = fn(&[f32], &[f32], &mut [f32]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Relu,
    Sqr,
    Silu,
}

/// Element-wise arithmetic; the right operand is broadcast by repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Operation recorded for one graph tensor.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Input, weight or externally filled buffer.
    Leaf,
    /// Alias of a source tensor with a different layout; never computed.
    View,
    /// Fresh contiguous copy of the source.
    Dup,
    /// Writes source 0 into the storage of source 1 (the destination view).
    Cpy,
    Binary(BinaryOp),
    Unary(UnaryOp),
    MapUnary {
        name: &'static str,
        kernel: UnaryKernelFn,
    },
    MapBinary {
        name: &'static str,
        kernel: BinaryKernelFn,
    },
    /// `out[i, j] = sum_k a[k, i] * b[k, j]` batched over axes 2 and 3.
    MulMat,
    /// Per-row standardization over axis 0.
    Norm { eps: f32 },
    /// Selects rows of source 0 indexed by the `I32` ids in source 1.
    GetRows,
    /// Appends source 1 after source 0 along axis 1.
    Concat,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Leaf => "leaf",
            Operation::View => "view",
            Operation::Dup => "dup",
            Operation::Cpy => "cpy",
            Operation::Binary(BinaryOp::Add) => "add",
            Operation::Binary(BinaryOp::Sub) => "sub",
            Operation::Binary(BinaryOp::Mul) => "mul",
            Operation::Binary(BinaryOp::Div) => "div",
            Operation::Unary(UnaryOp::Relu) => "relu",
            Operation::Unary(UnaryOp::Sqr) => "sqr",
            Operation::Unary(UnaryOp::Silu) => "silu",
            Operation::MapUnary { name, .. } | Operation::MapBinary { name, .. } => name,
            Operation::MulMat => "mul_mat",
            Operation::Norm { .. } => "norm",
            Operation::GetRows => "get_rows",
            Operation::Concat => "concat",
        }
    }

    /// Leaves are counted separately from computed nodes.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Operation::Leaf)
    }
}

/// Errors produced while executing a graph.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    #[error("graph arena has no backing storage")]
    Unbacked,
}

impl BackendError {
    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for backend results.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Engine capable of evaluating a graph built in a [`GraphArena`].
pub trait GraphExecutor: Send + Sync {
    /// Human-readable backend identifier used in logs.
    fn backend_name(&self) -> &str;

    /// Evaluates the first `n_nodes` registered nodes of `arena`, in registration order.
    ///
    /// Passing fewer nodes than registered skips the tail of the graph, which is how the
    /// logits projection is pruned when no logits are requested.
    fn compute(&self, arena: &mut GraphArena, n_nodes: usize, n_threads: usize)
        -> BackendResult<()>;
}
