//! Forward execution engine: walks the DAG from a root, materializing every
//! node's buffer exactly once. Grounded on `original_source/python/metal/graph.py`'s
//! `MTLGraph._recur_forw` (memoized post-order dispatch, fusion roots
//! launched as a single kernel) and on the visit-memoization pattern in
//! `cuda-nn-eval/src/planner.rs`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::instrument;

use crate::backend::{Buffer, FusedKernelSpec, KernelKey};
use crate::context::Context;
use crate::dtype::Dtype;
use crate::errors::GPResult;
use crate::shape::Shape;
use crate::tensor::{Op, ReduceOp, TensorId};

pub struct ExecEngine;

impl ExecEngine {
    /// Materializes `root`, along with every node it transitively depends
    /// on. Idempotent: nodes already holding storage (or resolvable through
    /// a view chain to a materialized ancestor) are skipped.
    #[instrument(skip(ctx, fusion))]
    pub fn forward(ctx: &Rc<RefCell<Context>>, root: TensorId, fusion: &HashMap<TensorId, FusedKernelSpec>) -> GPResult<()> {
        let mut done = HashSet::new();
        Self::materialize(ctx, root, fusion, &mut done)?;
        ctx.borrow_mut().backend_mut().wait()
    }

    fn materialize(
        ctx: &Rc<RefCell<Context>>,
        id: TensorId,
        fusion: &HashMap<TensorId, FusedKernelSpec>,
        done: &mut HashSet<TensorId>,
    ) -> GPResult<()> {
        if done.contains(&id) {
            return Ok(());
        }
        if ctx.borrow().node(id).storage.is_some() {
            done.insert(id);
            return Ok(());
        }
        let op = ctx.borrow().node(id).op.clone();
        if is_pure_view(&op) {
            let base = ctx.borrow().node(id).base.expect("pure view always has a base");
            Self::materialize(ctx, base, fusion, done)?;
            done.insert(id);
            return Ok(());
        }
        if let Some(spec) = fusion.get(&id) {
            for &terminal in &spec.terminals {
                Self::materialize(ctx, terminal, fusion, done)?;
            }
            Self::dispatch_fused(ctx, id, spec)?;
            done.insert(id);
            return Ok(());
        }
        for operand in op.operands() {
            Self::materialize(ctx, operand, fusion, done)?;
        }
        Self::dispatch(ctx, id, &op)?;
        done.insert(id);
        Ok(())
    }

    fn dispatch(ctx: &Rc<RefCell<Context>>, id: TensorId, op: &Op) -> GPResult<()> {
        let dtype = ctx.borrow().node(id).dtype;
        let out_shape = ctx.borrow().node(id).shape.clone();
        let numel = out_shape.numel();

        match op {
            Op::Constant(value) => {
                let mut c = ctx.borrow_mut();
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                c.backend_mut().dispatch_constant(dtype, *value, &mut out, numel)?;
                c.node_mut(id).storage = Some(out);
            }
            Op::Arange { start, step } => {
                let mut c = ctx.borrow_mut();
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                c.backend_mut().dispatch_arange(dtype, *start, *step, &mut out, numel)?;
                c.node_mut(id).storage = Some(out);
            }
            Op::FromHostBuffer => unreachable!("from_host_buffer nodes carry storage at construction"),
            Op::Unary(u, a) => {
                let operand_dtype = ctx.borrow().node(*a).dtype;
                let (a_buf, a_shape) = ctx.borrow().buffer_and_shape(*a)?;
                let mut c = ctx.borrow_mut();
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                if a_shape.has_dense_strides() && out_shape.has_dense_strides() {
                    let key = KernelKey::dense(u.name(), operand_dtype);
                    c.backend_mut().dispatch(&key, &[&a_buf], &mut out, numel)?;
                } else {
                    let key = KernelKey::sparse(u.name(), operand_dtype);
                    c.backend_mut().dispatch_strided(&key, &[(&a_buf, &a_shape)], &mut out, &out_shape)?;
                }
                c.node_mut(id).storage = Some(out);
            }
            Op::Binary(b, a, rhs) => {
                let operand_dtype = ctx.borrow().node(*a).dtype;
                let (a_buf, a_shape0) = ctx.borrow().buffer_and_shape(*a)?;
                let (b_buf, b_shape0) = ctx.borrow().buffer_and_shape(*rhs)?;
                let a_shape = a_shape0.broadcast_to(out_shape.dims())?;
                let b_shape = b_shape0.broadcast_to(out_shape.dims())?;
                let mut c = ctx.borrow_mut();
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                if a_shape.has_dense_strides() && b_shape.has_dense_strides() && out_shape.has_dense_strides() {
                    let key = KernelKey::dense(b.name(), operand_dtype);
                    c.backend_mut().dispatch(&key, &[&a_buf, &b_buf], &mut out, numel)?;
                } else {
                    let key = KernelKey::sparse(b.name(), operand_dtype);
                    c.backend_mut()
                        .dispatch_strided(&key, &[(&a_buf, &a_shape), (&b_buf, &b_shape)], &mut out, &out_shape)?;
                }
                c.node_mut(id).storage = Some(out);
            }
            Op::Reduce { op: rop, input, dims } => {
                let (in_buf, in_shape) = ctx.borrow().buffer_and_shape(*input)?;
                let mut c = ctx.borrow_mut();
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                match rop {
                    ReduceOp::Sum => {
                        c.backend_mut().dispatch_reduce_sum(&in_buf, &in_shape, dims, &mut out, &out_shape, dtype)?;
                    }
                    ReduceOp::Max => {
                        let mut argmax = c.backend_mut().alloc(Dtype::I32, numel)?;
                        c.backend_mut()
                            .dispatch_reduce_max(&in_buf, &in_shape, dims, &mut out, &out_shape, &mut argmax, dtype)?;
                    }
                }
                c.node_mut(id).storage = Some(out);
            }
            Op::MatMul(a, b) => {
                let (a_buf, a_shape) = ctx.borrow().buffer_and_shape(*a)?;
                let (b_buf, b_shape) = ctx.borrow().buffer_and_shape(*b)?;
                let mut c = ctx.borrow_mut();
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                c.backend_mut()
                    .dispatch_matmul(&a_buf, &a_shape, &b_buf, &b_shape, &mut out, &out_shape, dtype)?;
                c.node_mut(id).storage = Some(out);
            }
            Op::AsContiguous { input } => materialize_via_copy(ctx, id, *input, dtype, numel)?,
            Op::Reshape { input, requires_copy: true } => materialize_via_copy(ctx, id, *input, dtype, numel)?,
            Op::Reshape { requires_copy: false, .. } | Op::Permute { .. } | Op::Slice { .. } => {
                unreachable!("pure views are handled before dispatch")
            }
            Op::SliceScatter { input, ranges, full_dims } => {
                let (in_buf, in_shape) = ctx.borrow().buffer_and_shape(*input)?;
                let view_shape = Shape::contiguous(full_dims.clone()).slice(ranges)?;
                let mut c = ctx.borrow_mut();
                // alloc is zero-filled; scatter only touches the positions view_shape covers.
                let mut out = c.backend_mut().alloc(dtype, numel)?;
                if in_shape.has_dense_strides() {
                    c.backend_mut().dispatch_scatter(&in_buf, &mut out, &view_shape)?;
                } else {
                    let mut scratch = c.backend_mut().alloc(dtype, in_shape.numel())?;
                    c.backend_mut().dispatch_copy(&in_buf, &in_shape, &mut scratch)?;
                    c.backend_mut().dispatch_scatter(&scratch, &mut out, &view_shape)?;
                }
                c.node_mut(id).storage = Some(out);
            }
        }
        Ok(())
    }

    fn dispatch_fused(ctx: &Rc<RefCell<Context>>, id: TensorId, spec: &FusedKernelSpec) -> GPResult<()> {
        let out_shape = ctx.borrow().node(id).shape.clone();
        let numel = out_shape.numel();

        // Fused kernels index terminals densely (`input{i}[idx]`); a
        // non-contiguous terminal is copied into a scratch dense buffer
        // first.
        let mut inputs: Vec<Buffer> = Vec::with_capacity(spec.terminals.len());
        for &terminal in &spec.terminals {
            let terminal_dtype = ctx.borrow().node(terminal).dtype;
            let (buf, shape) = ctx.borrow().buffer_and_shape(terminal)?;
            if shape.has_dense_strides() {
                inputs.push(buf);
            } else {
                let mut c = ctx.borrow_mut();
                let mut scratch = c.backend_mut().alloc(terminal_dtype, shape.numel())?;
                c.backend_mut().dispatch_copy(&buf, &shape, &mut scratch)?;
                inputs.push(scratch);
            }
        }

        let mut c = ctx.borrow_mut();
        let mut out = c.backend_mut().alloc(spec.dtype, numel)?;
        let refs: Vec<&Buffer> = inputs.iter().collect();
        c.backend_mut().dispatch_fused(&spec.key, &refs, &mut out, numel)?;
        c.node_mut(id).storage = Some(out);
        Ok(())
    }
}

fn materialize_via_copy(ctx: &Rc<RefCell<Context>>, id: TensorId, input: TensorId, dtype: Dtype, numel: usize) -> GPResult<()> {
    let (in_buf, in_shape) = ctx.borrow().buffer_and_shape(input)?;
    let mut c = ctx.borrow_mut();
    let mut out = c.backend_mut().alloc(dtype, numel)?;
    c.backend_mut().dispatch_copy(&in_buf, &in_shape, &mut out)?;
    c.node_mut(id).storage = Some(out);
    Ok(())
}

fn is_pure_view(op: &Op) -> bool {
    matches!(
        op,
        Op::Reshape { requires_copy: false, .. } | Op::Permute { .. } | Op::Slice { .. }
    )
}
