//! Reverse-mode autograd. Gradients are built as ordinary graph nodes using
//! the same `Tensor` operator methods forward code uses, then attached via
//! `TensorData::grad` — there is no separate gradient interpreter. The
//! broadcast-aware reduction on accumulation mirrors the teacher's
//! `graph/node.rs::Add::backward`'s `resolve_grad` closure.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::instrument;

use crate::context::Context;
use crate::errors::{GPError, GPResult};
use crate::tensor::{BinaryOp, Op, ReduceOp, Tensor, TensorId, UnaryOp};

pub struct Autograd;

impl Autograd {
    /// Computes gradients of `root` (which must be a scalar, i.e. `numel() == 1`)
    /// with respect to every node it transitively depends on, accumulating
    /// each result onto that node's existing `TensorData::grad` rather than
    /// replacing it — calling `backward()` again without rebuilding the
    /// graph adds another pass's contribution into the same slots, the way
    /// a fresh `try_add` call on the old and new gradient would. Callers
    /// that want a fresh gradient must build a new graph. Does not execute
    /// the gradient graph; call `ExecEngine::forward` on a gradient tensor
    /// (or `Graph::forward`) to materialize it.
    #[instrument(skip(root))]
    pub fn backward(root: &Tensor) -> GPResult<()> {
        let numel = root.numel();
        if numel != 1 {
            return Err(GPError::Gradient { numel });
        }
        let ctx = root.ctx();

        let mut order = Vec::new();
        let mut visited = HashSet::new();
        topo_postorder(&ctx, root.id, &mut visited, &mut order);

        let mut grads: HashMap<TensorId, Tensor> = HashMap::new();
        let seed = Context::ones(&ctx, root.dtype(), root.shape().dims());
        grads.insert(root.id, seed);

        for &id in order.iter().rev() {
            let Some(grad_output) = grads.get(&id).cloned() else {
                continue;
            };
            let op = ctx.borrow().node(id).op.clone();
            for (operand_id, operand_grad) in local_grads(&ctx, id, &op, &grad_output)? {
                accumulate(&mut grads, operand_id, operand_grad)?;
            }
        }

        for (id, grad) in grads {
            let existing = ctx.borrow().node(id).grad.map(|grad_id| Tensor { ctx: ctx.clone(), id: grad_id });
            let combined = match existing {
                Some(prior) => prior.try_add(&grad)?,
                None => grad,
            };
            ctx.borrow_mut().node_mut(id).grad = Some(combined.id);
        }
        Ok(())
    }
}

fn topo_postorder(ctx: &Rc<RefCell<Context>>, id: TensorId, visited: &mut HashSet<TensorId>, order: &mut Vec<TensorId>) {
    if !visited.insert(id) {
        return;
    }
    let operands = ctx.borrow().node(id).op.operands();
    for operand in operands {
        topo_postorder(ctx, operand, visited, order);
    }
    order.push(id);
}

fn accumulate(grads: &mut HashMap<TensorId, Tensor>, id: TensorId, grad: Tensor) -> GPResult<()> {
    match grads.remove(&id) {
        Some(existing) => {
            let summed = existing.try_add(&grad)?;
            grads.insert(id, summed);
        }
        None => {
            grads.insert(id, grad);
        }
    }
    Ok(())
}

/// Sums `grad` over axes that were broadcast in the forward pass so it ends
/// up with `target_dims`: first reduces leading dims `grad` has beyond
/// `target_dims`, then any remaining axis where `target_dims` is `1` but
/// `grad` is not.
fn reduce_grad_to_shape(grad: &Tensor, target_dims: &[usize]) -> GPResult<Tensor> {
    let grad_dims = grad.shape().dims().to_vec();
    if grad_dims == target_dims {
        return Ok(grad.clone());
    }
    let ndim = grad_dims.len();
    let pad = ndim - target_dims.len();
    let mut reduce_axes = Vec::new();
    for i in 0..ndim {
        let target_dim = if i < pad { 1 } else { target_dims[i - pad] };
        if target_dim == 1 && grad_dims[i] != 1 {
            reduce_axes.push(i);
        }
    }
    let reduced = if reduce_axes.is_empty() { grad.clone() } else { grad.sum(&reduce_axes)? };
    if reduced.shape().dims() == target_dims {
        Ok(reduced)
    } else {
        reduced.reshape(target_dims)
    }
}

fn local_grads(ctx: &Rc<RefCell<Context>>, id: TensorId, op: &Op, grad_output: &Tensor) -> GPResult<Vec<(TensorId, Tensor)>> {
    let output = Tensor { ctx: ctx.clone(), id };

    match op {
        Op::Constant(_) | Op::Arange { .. } | Op::FromHostBuffer => Ok(vec![]),

        Op::Unary(u, a) => {
            let a_t = Tensor { ctx: ctx.clone(), id: *a };
            let grad_a = match u {
                UnaryOp::Exp => grad_output.try_mul(&output)?,
                UnaryOp::Log => grad_output.try_div(&a_t)?,
                UnaryOp::Neg => -grad_output,
                UnaryOp::Recip => {
                    let squared = output.sq();
                    let scaled = grad_output.try_mul(&squared)?;
                    -&scaled
                }
                UnaryOp::Sqrt => {
                    let inv = output.recip();
                    grad_output.try_mul(&inv)?.mul_scalar(0.5)
                }
                UnaryOp::Sq => {
                    let doubled = a_t.mul_scalar(2.0);
                    grad_output.try_mul(&doubled)?
                }
            };
            Ok(vec![(*a, grad_a)])
        }

        Op::Binary(b, a, c) => {
            if b.is_comparison() {
                return Ok(vec![]);
            }
            let a_t = Tensor { ctx: ctx.clone(), id: *a };
            let c_t = Tensor { ctx: ctx.clone(), id: *c };
            let (grad_a_full, grad_c_full) = match b {
                BinaryOp::Add => (grad_output.clone(), grad_output.clone()),
                BinaryOp::Sub => (grad_output.clone(), -grad_output),
                BinaryOp::Mul => (grad_output.try_mul(&c_t)?, grad_output.try_mul(&a_t)?),
                BinaryOp::Div => {
                    let grad_a = grad_output.try_div(&c_t)?;
                    let numerator = grad_output.try_mul(&a_t)?;
                    let denom = c_t.sq();
                    let quotient = numerator.try_div(&denom)?;
                    (grad_a, -&quotient)
                }
                _ => unreachable!("comparisons filtered above"),
            };
            let grad_a = reduce_grad_to_shape(&grad_a_full, a_t.shape().dims())?;
            let grad_c = reduce_grad_to_shape(&grad_c_full, c_t.shape().dims())?;
            Ok(vec![(*a, grad_a), (*c, grad_c)])
        }

        Op::Reduce { op: rop, input, dims: _ } => {
            let input_t = Tensor { ctx: ctx.clone(), id: *input };
            let grad_input = match rop {
                ReduceOp::Sum => {
                    let ones = Context::ones(ctx, input_t.dtype(), input_t.shape().dims());
                    grad_output.try_mul(&ones)?
                }
                // Ties all receive the full upstream gradient rather than splitting
                // it, since the execution engine does not thread argmax buffers
                // back through the graph.
                ReduceOp::Max => {
                    let mask = input_t.eq(&output)?;
                    grad_output.try_mul(&mask)?
                }
            };
            Ok(vec![(*input, grad_input)])
        }

        Op::Reshape { input, .. } => {
            let input_t = Tensor { ctx: ctx.clone(), id: *input };
            let grad_input = grad_output.reshape(input_t.shape().dims())?;
            Ok(vec![(*input, grad_input)])
        }

        Op::Permute { input, order } => {
            let mut inverse = vec![0usize; order.len()];
            for (i, &axis) in order.iter().enumerate() {
                inverse[axis] = i;
            }
            let grad_input = grad_output.permute(&inverse)?;
            Ok(vec![(*input, grad_input)])
        }

        Op::Slice { input, ranges } => {
            let input_t = Tensor { ctx: ctx.clone(), id: *input };
            let grad_input = grad_output.scatter_into(ranges, input_t.shape().dims());
            Ok(vec![(*input, grad_input)])
        }

        Op::SliceScatter { input, ranges, .. } => {
            let grad_input = grad_output.slice(ranges)?;
            Ok(vec![(*input, grad_input)])
        }

        Op::AsContiguous { input } => Ok(vec![(*input, grad_output.clone())]),

        Op::MatMul(a, b) => {
            let a_t = Tensor { ctx: ctx.clone(), id: *a };
            let b_t = Tensor { ctx: ctx.clone(), id: *b };
            let b_transposed = b_t.transpose()?;
            let a_transposed = a_t.transpose()?;
            let grad_a_full = grad_output.matmul(&b_transposed)?;
            let grad_b_full = a_transposed.matmul(grad_output)?;
            let grad_a = reduce_grad_to_shape(&grad_a_full, a_t.shape().dims())?;
            let grad_b = reduce_grad_to_shape(&grad_b_full, b_t.shape().dims())?;
            Ok(vec![(*a, grad_a), (*b, grad_b)])
        }
    }
}
