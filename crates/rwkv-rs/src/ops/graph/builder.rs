//! Operation-level API used by the layers to record graph nodes.
//!
//! Shape and dtype mismatches are programming errors in the graph construction code and
//! panic; running out of arena space is a recoverable error and is returned.

use std::sync::Arc;

use smallvec::smallvec;

use super::arena::{GraphArena, TensorId};
use crate::backend::spec::{
    BinaryKernelFn, BinaryOp, Operation, TensorSpec, UnaryKernelFn, UnaryOp,
};
use crate::error::RwkvResult;
use crate::tensor::{DType, HostTensor};

/// Records operations into a [`GraphArena`].
pub struct GraphBuilder<'a> {
    arena: &'a mut GraphArena,
}

impl<'a> GraphBuilder<'a> {
    pub(super) fn new(arena: &'a mut GraphArena) -> Self {
        GraphBuilder { arena }
    }

    pub fn spec(&self, id: TensorId) -> TensorSpec {
        *self.arena.spec(id)
    }

    /// Element counts of the first two axes.
    pub fn dims2(&self, id: TensorId) -> (usize, usize) {
        let spec = self.arena.spec(id);
        (spec.ne[0], spec.ne[1])
    }

    pub fn new_tensor_1d(&mut self, dtype: DType, ne0: usize) -> RwkvResult<TensorId> {
        self.arena.new_tensor(dtype, [ne0, 1, 1, 1])
    }

    pub fn new_tensor_2d(&mut self, dtype: DType, ne0: usize, ne1: usize) -> RwkvResult<TensorId> {
        self.arena.new_tensor(dtype, [ne0, ne1, 1, 1])
    }

    pub fn weight(&mut self, tensor: &Arc<HostTensor>) -> RwkvResult<TensorId> {
        self.arena.import_weight(tensor)
    }

    /// Registers `id` and its dependencies for execution.
    pub fn expand(&mut self, id: TensorId) {
        self.arena.expand(id);
    }

    pub fn n_nodes(&self) -> usize {
        self.arena.n_nodes()
    }

    pub fn n_leafs(&self) -> usize {
        self.arena.n_leafs()
    }

    fn node(
        &mut self,
        op: Operation,
        dtype: DType,
        ne: [usize; 4],
        sources: &[TensorId],
    ) -> RwkvResult<TensorId> {
        let spec = TensorSpec::contiguous(dtype, ne);
        self.arena
            .push_allocated(spec, op, sources.iter().copied().collect())
    }

    fn assert_f32(&self, id: TensorId, op: &str) {
        assert_eq!(
            self.arena.spec(id).dtype,
            DType::F32,
            "{op}: operand {} must be F32",
            id.index()
        );
    }

    fn binary(&mut self, op: BinaryOp, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        let name = Operation::Binary(op).name();
        self.assert_f32(a, name);
        self.assert_f32(b, name);
        let (lhs, rhs) = (self.spec(a), self.spec(b));
        assert!(
            rhs.can_repeat_into(&lhs),
            "{name}: cannot broadcast {:?} into {:?}",
            rhs.ne,
            lhs.ne
        );
        self.node(Operation::Binary(op), DType::F32, lhs.ne, &[a, b])
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        self.binary(BinaryOp::Div, a, b)
    }

    fn unary(&mut self, op: UnaryOp, a: TensorId) -> RwkvResult<TensorId> {
        self.assert_f32(a, Operation::Unary(op).name());
        let ne = self.spec(a).ne;
        self.node(Operation::Unary(op), DType::F32, ne, &[a])
    }

    pub fn relu(&mut self, a: TensorId) -> RwkvResult<TensorId> {
        self.unary(UnaryOp::Relu, a)
    }

    pub fn sqr(&mut self, a: TensorId) -> RwkvResult<TensorId> {
        self.unary(UnaryOp::Sqr, a)
    }

    pub fn silu(&mut self, a: TensorId) -> RwkvResult<TensorId> {
        self.unary(UnaryOp::Silu, a)
    }

    fn assert_kernel_operand(&self, id: TensorId, name: &str) {
        let spec = self.arena.spec(id);
        assert_eq!(spec.dtype, DType::F32, "{name}: operand must be F32");
        assert!(spec.is_contiguous(), "{name}: operand must be contiguous");
        assert!(spec.is_matrix(), "{name}: operand must have at most two axes");
    }

    /// Custom element-wise kernel over one contiguous F32 matrix.
    pub fn map_unary(
        &mut self,
        name: &'static str,
        kernel: UnaryKernelFn,
        a: TensorId,
    ) -> RwkvResult<TensorId> {
        self.assert_kernel_operand(a, name);
        let ne = self.spec(a).ne;
        self.node(Operation::MapUnary { name, kernel }, DType::F32, ne, &[a])
    }

    /// Custom element-wise kernel over two contiguous F32 matrices of identical shape.
    pub fn map_binary(
        &mut self,
        name: &'static str,
        kernel: BinaryKernelFn,
        a: TensorId,
        b: TensorId,
    ) -> RwkvResult<TensorId> {
        self.assert_kernel_operand(a, name);
        self.assert_kernel_operand(b, name);
        let (lhs, rhs) = (self.spec(a), self.spec(b));
        assert!(
            lhs.same_shape(&rhs),
            "{name}: operand shapes differ: {:?} vs {:?}",
            lhs.ne,
            rhs.ne
        );
        self.node(Operation::MapBinary { name, kernel }, DType::F32, lhs.ne, &[a, b])
    }

    /// Contracts axis 0 of both operands: `[k, m] x [k, n] -> [m, n]`.
    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        self.assert_f32(a, "mul_mat");
        self.assert_f32(b, "mul_mat");
        let (lhs, rhs) = (self.spec(a), self.spec(b));
        assert_eq!(lhs.ne[0], rhs.ne[0], "mul_mat: inner dimensions differ");
        assert_eq!(
            (lhs.ne[2], lhs.ne[3]),
            (rhs.ne[2], rhs.ne[3]),
            "mul_mat: batch dimensions differ"
        );
        let ne = [lhs.ne[1], rhs.ne[1], lhs.ne[2], lhs.ne[3]];
        self.node(Operation::MulMat, DType::F32, ne, &[a, b])
    }

    /// Standardizes every row (axis 0) to zero mean and unit variance.
    pub fn norm(&mut self, a: TensorId, eps: f32) -> RwkvResult<TensorId> {
        self.assert_f32(a, "norm");
        let ne = self.spec(a).ne;
        self.node(Operation::Norm { eps }, DType::F32, ne, &[a])
    }

    /// Looks up rows of the matrix `a` by the `I32` ids in `ids`.
    pub fn get_rows(&mut self, a: TensorId, ids: TensorId) -> RwkvResult<TensorId> {
        self.assert_f32(a, "get_rows");
        let (table, index) = (self.spec(a), self.spec(ids));
        assert!(table.is_matrix(), "get_rows: table must be a matrix");
        assert_eq!(index.dtype, DType::I32, "get_rows: ids must be I32");
        assert_eq!(
            index.num_elements(),
            index.ne[0],
            "get_rows: ids must be a vector"
        );
        self.node(
            Operation::GetRows,
            DType::F32,
            [table.ne[0], index.ne[0], 1, 1],
            &[a, ids],
        )
    }

    /// Joins two matrices along axis 1.
    pub fn concat(&mut self, a: TensorId, b: TensorId) -> RwkvResult<TensorId> {
        self.assert_f32(a, "concat");
        self.assert_f32(b, "concat");
        let (lhs, rhs) = (self.spec(a), self.spec(b));
        assert!(lhs.is_matrix() && rhs.is_matrix(), "concat: operands must be matrices");
        assert_eq!(lhs.ne[0], rhs.ne[0], "concat: row lengths differ");
        self.node(
            Operation::Concat,
            DType::F32,
            [lhs.ne[0], lhs.ne[1] + rhs.ne[1], 1, 1],
            &[a, b],
        )
    }

    /// Fresh contiguous copy.
    pub fn dup(&mut self, a: TensorId) -> RwkvResult<TensorId> {
        let spec = self.spec(a);
        self.node(Operation::Dup, spec.dtype, spec.ne, &[a])
    }

    /// Copies `src` into the storage of `dst`, returning the node that performs the write.
    ///
    /// The write only happens once the returned node is expanded and executed.
    pub fn cpy(&mut self, src: TensorId, dst: TensorId) -> RwkvResult<TensorId> {
        let (from, to) = (self.spec(src), self.spec(dst));
        assert_eq!(from.dtype, to.dtype, "cpy: dtypes differ");
        assert_eq!(
            from.num_elements(),
            to.num_elements(),
            "cpy: element counts differ"
        );
        self.arena
            .push_alias(dst, to, 0, Operation::Cpy, smallvec![src, dst])
    }

    fn view(&mut self, base: TensorId, spec: TensorSpec, offset: usize) -> RwkvResult<TensorId> {
        let base_span = self.arena.spec(base).span();
        assert!(
            offset + spec.span() <= base_span,
            "view of {} elements at offset {offset} exceeds base span {base_span}",
            spec.span()
        );
        self.arena
            .push_alias(base, spec, offset, Operation::View, smallvec![base])
    }

    /// One-dimensional view of `ne0` elements starting `offset` elements into `base`.
    pub fn view_1d(&mut self, base: TensorId, ne0: usize, offset: usize) -> RwkvResult<TensorId> {
        let dtype = self.spec(base).dtype;
        let spec = TensorSpec::contiguous(dtype, [ne0, 1, 1, 1]);
        self.view(base, spec, offset)
    }

    /// Two-dimensional view whose rows are `nb1` elements apart.
    pub fn view_2d(
        &mut self,
        base: TensorId,
        ne0: usize,
        ne1: usize,
        nb1: usize,
        offset: usize,
    ) -> RwkvResult<TensorId> {
        let dtype = self.spec(base).dtype;
        let spec = TensorSpec {
            dtype,
            ne: [ne0, ne1, 1, 1],
            nb: [1, nb1, nb1 * ne1, nb1 * ne1],
        };
        self.view(base, spec, offset)
    }

    /// Reinterprets a contiguous tensor with new element counts.
    pub fn reshape(&mut self, a: TensorId, ne: [usize; 4]) -> RwkvResult<TensorId> {
        let spec = self.spec(a);
        assert!(spec.is_contiguous(), "reshape: operand must be contiguous");
        assert_eq!(
            spec.num_elements(),
            ne.iter().product::<usize>(),
            "reshape: element counts differ"
        );
        self.view(a, TensorSpec::contiguous(spec.dtype, ne), 0)
    }

    /// Swaps axes 0 and 1 without moving data.
    pub fn transpose(&mut self, a: TensorId) -> RwkvResult<TensorId> {
        let mut spec = self.spec(a);
        spec.ne.swap(0, 1);
        spec.nb.swap(0, 1);
        self.view(a, spec, 0)
    }
}
