//! Fixed-budget tensor arena and forward-graph registration.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use smallvec::SmallVec;

use super::builder::GraphBuilder;
use super::state::{Storage, TensorRecord};
use crate::backend::spec::{BackendError, BackendResult, Operation, TensorSpec};
use crate::error::{RwkvError, RwkvResult};
use crate::tensor::{DType, HostTensor, MAX_DIMS};

/// Alignment applied to every tensor payload carved out of an arena.
pub const TENSOR_ALIGNMENT: usize = 16;
/// Bytes charged for the bookkeeping record of each tensor, data or view.
pub const TENSOR_OVERHEAD: usize = 256;

const WORD: usize = std::mem::size_of::<u32>();

/// Handle to a tensor recorded in a [`GraphArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u32);

impl TensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owns every tensor of one computation graph.
///
/// A measuring arena has zero capacity and no storage; it only records what a backed arena
/// would charge so the real one can be sized exactly. A backed arena refuses any allocation
/// past its budget.
pub struct GraphArena {
    measuring: bool,
    capacity: usize,
    used: usize,
    data_words: usize,
    words: Vec<u32>,
    records: Vec<TensorRecord>,
    weight_lookup: HashMap<usize, TensorId>,
    nodes: Vec<TensorId>,
    leafs: Vec<TensorId>,
    registered: HashSet<TensorId>,
}

fn align_up(bytes: usize) -> usize {
    bytes.div_ceil(TENSOR_ALIGNMENT) * TENSOR_ALIGNMENT
}

impl GraphArena {
    /// Creates an arena that accounts for sizes without allocating tensor data.
    pub fn measuring() -> Self {
        GraphArena::empty(true, 0, Vec::new())
    }

    /// Creates a backed arena holding at most `bytes` of records and tensor data.
    pub fn with_capacity(bytes: usize) -> RwkvResult<Self> {
        let len = bytes.div_ceil(WORD);
        let mut words = Vec::new();
        words.try_reserve_exact(len).map_err(|_| RwkvError::Alloc {
            what: "graph arena",
            bytes,
        })?;
        words.resize(len, 0);
        Ok(GraphArena::empty(false, bytes, words))
    }

    fn empty(measuring: bool, capacity: usize, words: Vec<u32>) -> Self {
        GraphArena {
            measuring,
            capacity,
            used: 0,
            data_words: 0,
            words,
            records: Vec::new(),
            weight_lookup: HashMap::new(),
            nodes: Vec::new(),
            leafs: Vec::new(),
            registered: HashSet::new(),
        }
    }

    /// Returns a builder that records operations into this arena.
    pub fn builder(&mut self) -> GraphBuilder<'_> {
        GraphBuilder::new(self)
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring
    }

    /// Bytes charged so far, identical for measuring and backed arenas building the same graph.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    fn charge(&mut self, data_bytes: usize) -> RwkvResult<usize> {
        let aligned = align_up(data_bytes);
        let requested = TENSOR_OVERHEAD + aligned;
        if !self.measuring && self.used + requested > self.capacity {
            return Err(RwkvError::ArenaExhausted {
                requested,
                available: self.capacity.saturating_sub(self.used),
                capacity: self.capacity,
            });
        }
        let offset = self.data_words;
        self.data_words += aligned / WORD;
        self.used += requested;
        Ok(offset)
    }

    fn push(&mut self, record: TensorRecord) -> TensorId {
        let id = TensorId(self.records.len() as u32);
        self.records.push(record);
        id
    }

    /// Records a leaf tensor with fresh zeroed storage, to be filled before execution.
    pub fn new_tensor(&mut self, dtype: DType, ne: [usize; MAX_DIMS]) -> RwkvResult<TensorId> {
        let spec = TensorSpec::contiguous(dtype, ne);
        self.push_allocated(spec, Operation::Leaf, SmallVec::new())
    }

    pub(super) fn push_allocated(
        &mut self,
        spec: TensorSpec,
        op: Operation,
        sources: SmallVec<[TensorId; 2]>,
    ) -> RwkvResult<TensorId> {
        let offset = self.charge(spec.byte_len())?;
        Ok(self.push(TensorRecord {
            spec,
            op,
            sources,
            storage: Storage::Arena { offset },
        }))
    }

    /// Records a tensor aliasing the storage of `base`, shifted by `offset` elements.
    pub(super) fn push_alias(
        &mut self,
        base: TensorId,
        spec: TensorSpec,
        offset: usize,
        op: Operation,
        sources: SmallVec<[TensorId; 2]>,
    ) -> RwkvResult<TensorId> {
        self.charge(0)?;
        let storage = self.record(base).storage.shifted(offset);
        Ok(self.push(TensorRecord {
            spec,
            op,
            sources,
            storage,
        }))
    }

    /// Makes a model weight visible to the graph without copying it.
    ///
    /// Importing the same weight twice returns the same tensor.
    pub fn import_weight(&mut self, tensor: &Arc<HostTensor>) -> RwkvResult<TensorId> {
        let key = Arc::as_ptr(tensor) as usize;
        if let Some(&id) = self.weight_lookup.get(&key) {
            return Ok(id);
        }
        self.charge(0)?;
        let spec = TensorSpec::contiguous(DType::F32, tensor.shape().padded());
        let id = self.push(TensorRecord {
            spec,
            op: Operation::Leaf,
            sources: SmallVec::new(),
            storage: Storage::Weight {
                tensor: Arc::clone(tensor),
                offset: 0,
            },
        });
        self.weight_lookup.insert(key, id);
        Ok(id)
    }

    /// Registers `root` and every tensor it depends on, sources first.
    ///
    /// Tensors already registered are skipped, so repeated expansion only appends new work.
    pub fn expand(&mut self, root: TensorId) {
        if self.registered.contains(&root) {
            return;
        }
        let mut stack: Vec<(TensorId, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let (tensor, next) = *frame;
            let record = &self.records[tensor.index()];
            if next < record.sources.len() {
                frame.1 += 1;
                let source = record.sources[next];
                if !self.registered.contains(&source) {
                    stack.push((source, 0));
                }
                continue;
            }
            let is_leaf = record.op.is_leaf();
            stack.pop();
            if self.registered.insert(tensor) {
                if is_leaf {
                    self.leafs.push(tensor);
                } else {
                    self.nodes.push(tensor);
                }
            }
        }
    }

    /// Computed tensors in execution order.
    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    pub fn leafs(&self) -> &[TensorId] {
        &self.leafs
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_leafs(&self) -> usize {
        self.leafs.len()
    }

    pub fn num_tensors(&self) -> usize {
        self.records.len()
    }

    fn record(&self, id: TensorId) -> &TensorRecord {
        &self.records[id.index()]
    }

    pub fn spec(&self, id: TensorId) -> &TensorSpec {
        &self.record(id).spec
    }

    pub fn op(&self, id: TensorId) -> &Operation {
        &self.record(id).op
    }

    pub fn sources(&self, id: TensorId) -> &[TensorId] {
        &self.record(id).sources
    }

    fn f32_storage(&self, id: TensorId) -> BackendResult<(&[f32], usize)> {
        let record = self.record(id);
        if record.spec.dtype != DType::F32 {
            return Err(BackendError::execution(format!(
                "tensor {} is {:?}, expected F32",
                id.index(),
                record.spec.dtype
            )));
        }
        match &record.storage {
            Storage::Weight { tensor, offset } => Ok((tensor.data(), *offset)),
            Storage::Arena { .. } if self.measuring => Err(BackendError::Unbacked),
            Storage::Arena { offset } => Ok((bytemuck::cast_slice(self.words.as_slice()), *offset)),
        }
    }

    /// Gathers the tensor's values in logical order.
    pub fn read_f32(&self, id: TensorId) -> BackendResult<Vec<f32>> {
        let spec = self.record(id).spec;
        let (data, base) = self.f32_storage(id)?;
        let mut values = Vec::with_capacity(spec.num_elements());
        spec.for_each_offset(|offset| values.push(data[base + offset]));
        Ok(values)
    }

    /// Borrows the values when the layout is packed, gathering them otherwise.
    pub fn contiguous_f32(&self, id: TensorId) -> BackendResult<Cow<'_, [f32]>> {
        let spec = self.record(id).spec;
        if !spec.is_contiguous() {
            return self.read_f32(id).map(Cow::Owned);
        }
        let (data, base) = self.f32_storage(id)?;
        Ok(Cow::Borrowed(&data[base..base + spec.num_elements()]))
    }

    pub fn read_i32(&self, id: TensorId) -> BackendResult<Vec<i32>> {
        let (words, base, spec) = self.arena_words(id, DType::I32)?;
        let mut values = Vec::with_capacity(spec.num_elements());
        spec.for_each_offset(|offset| values.push(words[base + offset] as i32));
        Ok(values)
    }

    fn arena_words(
        &self,
        id: TensorId,
        dtype: DType,
    ) -> BackendResult<(&[u32], usize, TensorSpec)> {
        let record = self.record(id);
        if record.spec.dtype != dtype {
            return Err(BackendError::execution(format!(
                "tensor {} is {:?}, expected {:?}",
                id.index(),
                record.spec.dtype,
                dtype
            )));
        }
        match record.storage {
            Storage::Weight { .. } => Err(BackendError::execution(format!(
                "tensor {} is an imported weight",
                id.index()
            ))),
            Storage::Arena { .. } if self.measuring => Err(BackendError::Unbacked),
            Storage::Arena { offset } => Ok((self.words.as_slice(), offset, record.spec)),
        }
    }

    fn scatter(&mut self, id: TensorId, dtype: DType, values: &[u32]) -> BackendResult<()> {
        let (_, base, spec) = self.arena_words(id, dtype)?;
        if values.len() != spec.num_elements() {
            return Err(BackendError::execution(format!(
                "tensor {} holds {} elements, got {}",
                id.index(),
                spec.num_elements(),
                values.len()
            )));
        }
        let words = &mut self.words;
        let mut source = values.iter();
        spec.for_each_offset(|offset| {
            if let Some(&value) = source.next() {
                words[base + offset] = value;
            }
        });
        Ok(())
    }

    /// Scatters `values`, given in logical order, into the tensor's storage.
    pub fn write_f32(&mut self, id: TensorId, values: &[f32]) -> BackendResult<()> {
        self.scatter(id, DType::F32, bytemuck::cast_slice(values))
    }

    pub fn write_i32(&mut self, id: TensorId, values: &[i32]) -> BackendResult<()> {
        self.scatter(id, DType::I32, bytemuck::cast_slice(values))
    }
}
