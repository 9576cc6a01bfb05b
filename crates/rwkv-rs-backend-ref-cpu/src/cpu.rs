use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use rwkv_rs::backend::spec::{
    BackendError, BackendResult, BinaryOp, GraphExecutor, Operation, TensorSpec, UnaryOp,
};
use rwkv_rs::ops::graph::{GraphArena, TensorId};
use rwkv_rs::tensor::DType;

/// Host executor evaluating graph nodes one after another.
///
/// Thread pools are created on first use for each requested thread count and reused.
#[derive(Default)]
pub struct CpuExecutor {
    pools: Mutex<HashMap<usize, Arc<ThreadPool>>>,
}

impl CpuExecutor {
    pub fn new() -> Self {
        CpuExecutor::default()
    }

    fn pool(&self, n_threads: usize) -> BackendResult<Arc<ThreadPool>> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| BackendError::execution("thread pool cache is poisoned"))?;
        if let Some(pool) = pools.get(&n_threads) {
            return Ok(Arc::clone(pool));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|err| {
                BackendError::execution(format!(
                    "failed to start {n_threads} worker threads: {err}"
                ))
            })?;
        debug!("started cpu worker pool with {n_threads} threads");
        let pool = Arc::new(pool);
        pools.insert(n_threads, Arc::clone(&pool));
        Ok(pool)
    }
}

impl GraphExecutor for CpuExecutor {
    fn backend_name(&self) -> &str {
        "cpu-reference"
    }

    fn compute(
        &self,
        arena: &mut GraphArena,
        n_nodes: usize,
        n_threads: usize,
    ) -> BackendResult<()> {
        if arena.is_measuring() {
            return Err(BackendError::Unbacked);
        }
        if n_nodes > arena.n_nodes() {
            return Err(BackendError::execution(format!(
                "requested {n_nodes} nodes but the graph has {}",
                arena.n_nodes()
            )));
        }
        let pool = self.pool(n_threads.max(1))?;
        for index in 0..n_nodes {
            let node = arena.nodes()[index];
            execute_node(arena, node, &pool)
                .map_err(|err| augment_backend_error(err, index, node, arena))?;
        }
        Ok(())
    }
}

fn augment_backend_error(
    error: BackendError,
    index: usize,
    node: TensorId,
    arena: &GraphArena,
) -> BackendError {
    let context = format!(
        "node #{index}, {} id {} sources {:?}",
        arena.op(node).name(),
        node.index(),
        arena
            .sources(node)
            .iter()
            .map(|source| source.index())
            .collect::<Vec<_>>()
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} (at {context})"),
        },
        other => other,
    }
}

fn execute_node(arena: &mut GraphArena, node: TensorId, pool: &ThreadPool) -> BackendResult<()> {
    let op = *arena.op(node);
    let spec = *arena.spec(node);
    let sources: Vec<TensorId> = arena.sources(node).to_vec();
    let output = match op {
        Operation::Leaf | Operation::View => return Ok(()),
        Operation::Dup | Operation::Cpy if spec.dtype == DType::I32 => {
            let values = arena.read_i32(sources[0])?;
            return arena.write_i32(node, &values);
        }
        Operation::Dup | Operation::Cpy => arena.read_f32(sources[0])?,
        Operation::Binary(op) => op_binary(arena, &spec, sources[0], sources[1], op)?,
        Operation::Unary(op) => op_unary(arena, sources[0], op)?,
        Operation::MapUnary { kernel, .. } => {
            let src = arena.contiguous_f32(sources[0])?;
            let mut out = vec![0.0; src.len()];
            kernel(&src, &mut out);
            out
        }
        Operation::MapBinary { kernel, .. } => {
            let lhs = arena.contiguous_f32(sources[0])?;
            let rhs = arena.contiguous_f32(sources[1])?;
            if lhs.len() != rhs.len() {
                return Err(BackendError::execution("map_binary operand size mismatch"));
            }
            let mut out = vec![0.0; lhs.len()];
            kernel(&lhs, &rhs, &mut out);
            out
        }
        Operation::MulMat => op_mul_mat(arena, &spec, sources[0], sources[1], pool)?,
        Operation::Norm { eps } => op_norm(arena, sources[0], eps)?,
        Operation::GetRows => op_get_rows(arena, sources[0], sources[1])?,
        Operation::Concat => {
            let mut out = arena.read_f32(sources[0])?;
            out.extend(arena.read_f32(sources[1])?);
            out
        }
    };
    arena.write_f32(node, &output)
}

fn op_binary(
    arena: &GraphArena,
    output: &TensorSpec,
    lhs: TensorId,
    rhs: TensorId,
    op: BinaryOp,
) -> BackendResult<Vec<f32>> {
    let a = arena.read_f32(lhs)?;
    let b = arena.read_f32(rhs)?;
    let rhs_spec = arena.spec(rhs);
    let apply = |x: f32, y: f32| match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
    };
    if a.len() == b.len() {
        return Ok(a.iter().zip(&b).map(|(&x, &y)| apply(x, y)).collect());
    }
    if !rhs_spec.can_repeat_into(output) {
        return Err(BackendError::execution(format!(
            "cannot broadcast {:?} into {:?}",
            rhs_spec.ne, output.ne
        )));
    }
    let [n0, n1, n2, n3] = output.ne;
    let [r0, r1, r2, r3] = rhs_spec.ne;
    let mut out = Vec::with_capacity(a.len());
    for i3 in 0..n3 {
        for i2 in 0..n2 {
            for i1 in 0..n1 {
                let row = ((i3 % r3) * r2 + i2 % r2) * r1 + i1 % r1;
                let lhs_row = &a[((i3 * n2 + i2) * n1 + i1) * n0..][..n0];
                for (i0, &x) in lhs_row.iter().enumerate() {
                    out.push(apply(x, b[row * r0 + i0 % r0]));
                }
            }
        }
    }
    Ok(out)
}

fn op_unary(arena: &GraphArena, source: TensorId, op: UnaryOp) -> BackendResult<Vec<f32>> {
    let values = arena.read_f32(source)?;
    Ok(values
        .into_iter()
        .map(|x| match op {
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sqr => x * x,
            UnaryOp::Silu => x / (1.0 + (-x).exp()),
        })
        .collect())
}

fn dot(lhs: &[f32], rhs: &[f32]) -> f32 {
    lhs.iter().zip(rhs).fold(0.0, |acc, (&x, &y)| acc + x * y)
}

fn op_mul_mat(
    arena: &GraphArena,
    output: &TensorSpec,
    lhs: TensorId,
    rhs: TensorId,
    pool: &ThreadPool,
) -> BackendResult<Vec<f32>> {
    let inner = arena.spec(lhs).ne[0];
    if arena.spec(rhs).ne[0] != inner {
        return Err(BackendError::execution("mul_mat inner dimensions differ"));
    }
    let a = arena.contiguous_f32(lhs)?;
    let b = arena.contiguous_f32(rhs)?;
    let [rows, cols, ..] = output.ne;
    let mut out = vec![0.0f32; output.num_elements()];
    if rows == 0 || inner == 0 {
        return Ok(out);
    }
    pool.install(|| {
        out.par_chunks_mut(rows)
            .enumerate()
            .for_each(|(column, dst)| {
                let batch = column / cols;
                let rhs_column = &b[column * inner..][..inner];
                for (row, value) in dst.iter_mut().enumerate() {
                    let lhs_row = &a[(batch * rows + row) * inner..][..inner];
                    *value = dot(lhs_row, rhs_column);
                }
            });
    });
    Ok(out)
}

fn op_norm(arena: &GraphArena, source: TensorId, eps: f32) -> BackendResult<Vec<f32>> {
    let width = arena.spec(source).ne[0];
    let mut values = arena.read_f32(source)?;
    if width == 0 {
        return Ok(values);
    }
    for row in values.chunks_mut(width) {
        let mean = row.iter().map(|&x| x as f64).sum::<f64>() / width as f64;
        let mut sum_sq = 0.0f64;
        for x in row.iter_mut() {
            let centered = (*x as f64 - mean) as f32;
            *x = centered;
            sum_sq += (centered as f64) * (centered as f64);
        }
        let variance = sum_sq / width as f64;
        let scale = (1.0 / (variance + eps as f64).sqrt()) as f32;
        for x in row.iter_mut() {
            *x *= scale;
        }
    }
    Ok(values)
}

fn op_get_rows(arena: &GraphArena, table: TensorId, ids: TensorId) -> BackendResult<Vec<f32>> {
    let [width, rows, ..] = arena.spec(table).ne;
    let table = arena.contiguous_f32(table)?;
    let ids = arena.read_i32(ids)?;
    let mut out = Vec::with_capacity(ids.len() * width);
    for id in ids {
        let row = usize::try_from(id)
            .ok()
            .filter(|&row| row < rows)
            .ok_or_else(|| {
                BackendError::execution(format!("row id {id} is out of range for {rows} rows"))
            })?;
        out.extend_from_slice(&table[row * width..][..width]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn filled(arena: &mut GraphArena, ne: [usize; 4], values: &[f32]) -> TensorId {
        let id = arena.new_tensor(DType::F32, ne).unwrap();
        arena.write_f32(id, values).unwrap();
        id
    }

    #[test]
    fn mul_mat_contracts_the_leading_axis() {
        let mut arena = GraphArena::with_capacity(1 << 16).unwrap();
        // a: two rows [1, 2, 3] and [4, 5, 6]; b: one column [1, 0, -1]
        let a = filled(&mut arena, [3, 2, 1, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = filled(&mut arena, [3, 1, 1, 1], &[1.0, 0.0, -1.0]);
        let mut builder = arena.builder();
        let c = builder.mul_mat(a, b).unwrap();
        builder.expand(c);
        CpuExecutor::new().compute(&mut arena, 1, 2).unwrap();
        assert_eq!(arena.read_f32(c).unwrap(), vec![-2.0, -2.0]);
    }

    #[test]
    fn results_do_not_depend_on_thread_count() {
        let values: Vec<f32> = (0..64).map(|v| (v as f32 * 0.37).sin()).collect();
        let mut outputs = Vec::new();
        for threads in [1, 3] {
            let mut arena = GraphArena::with_capacity(1 << 16).unwrap();
            let a = filled(&mut arena, [8, 8, 1, 1], &values);
            let b = filled(&mut arena, [8, 8, 1, 1], &values);
            let mut builder = arena.builder();
            let c = builder.mul_mat(a, b).unwrap();
            builder.expand(c);
            CpuExecutor::new().compute(&mut arena, 1, threads).unwrap();
            outputs.push(arena.read_f32(c).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn norm_standardizes_rows() {
        let mut arena = GraphArena::with_capacity(1 << 16).unwrap();
        let x = filled(&mut arena, [4, 2, 1, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 5.0, 5.0, 5.0]);
        let mut builder = arena.builder();
        let y = builder.norm(x, 1e-5).unwrap();
        builder.expand(y);
        CpuExecutor::new().compute(&mut arena, 1, 1).unwrap();
        let out = arena.read_f32(y).unwrap();
        let mean: f32 = out[..4].iter().sum::<f32>() / 4.0;
        let var: f32 = out[..4].iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_relative_eq!(mean, 0.0, epsilon = 1e-6);
        assert_relative_eq!(var, 1.0, epsilon = 1e-4);
        assert_eq!(&out[4..], &[0.0; 4]);
    }

    #[test]
    fn broadcast_and_cpy_into_view() {
        let mut arena = GraphArena::with_capacity(1 << 16).unwrap();
        let x = filled(&mut arena, [2, 3, 1, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bias = filled(&mut arena, [2, 1, 1, 1], &[10.0, 20.0]);
        let target = arena.new_tensor(DType::F32, [4, 1, 1, 1]).unwrap();
        let mut builder = arena.builder();
        let sum = builder.add(x, bias).unwrap();
        let column = builder.view_2d(sum, 2, 1, 2, 4).unwrap();
        let slot = builder.view_1d(target, 2, 2).unwrap();
        let write = builder.cpy(column, slot).unwrap();
        builder.expand(write);
        let n_nodes = builder.n_nodes();
        CpuExecutor::new().compute(&mut arena, n_nodes, 1).unwrap();
        assert_eq!(
            arena.read_f32(sum).unwrap(),
            vec![11.0, 22.0, 13.0, 24.0, 15.0, 26.0]
        );
        assert_eq!(arena.read_f32(target).unwrap(), vec![0.0, 0.0, 15.0, 26.0]);
    }

    #[test]
    fn measuring_arena_cannot_be_executed() {
        let mut arena = GraphArena::measuring();
        let err = CpuExecutor::new().compute(&mut arena, 0, 1).unwrap_err();
        assert!(matches!(err, BackendError::Unbacked));
    }
}
