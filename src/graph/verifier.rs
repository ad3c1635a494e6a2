//! Static verifier for the tensor arena. Re-derives each node's expected
//! shape from its operands and flags anything the lazy builders should
//! already have rejected — a defensive second pass, not the primary shape
//! check (that happens in `tensor.rs` at construction time). Adapted from
//! the teacher's `graph::verifier::Verifier`, keeping its `anyhow::Result`
//! style.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::context::Context;
use crate::tensor::{Op, TensorId};

pub struct Verifier;

impl Verifier {
    pub fn verify(ctx: &Rc<RefCell<Context>>) -> Result<()> {
        let c = ctx.borrow();
        let n = c.len();
        debug!(nodes = n, "starting static verification");

        for i in 0..n {
            let id = TensorId(i);
            let op = &c.node(id).op;
            for operand in op.operands() {
                if operand.0 >= i {
                    return Err(anyhow!(
                        "node {i} references operand {} which has not been constructed yet",
                        operand.0
                    ));
                }
            }
            Self::check_shape(&c, id, op)?;
        }

        debug!("static verification passed");
        Ok(())
    }

    fn check_shape(c: &Context, id: TensorId, op: &Op) -> Result<()> {
        match op {
            Op::Binary(b, a, rhs) => {
                let a_shape = c.node(*a).shape.clone();
                let rhs_dims = c.node(*rhs).shape.dims().to_vec();
                let expected = a_shape
                    .broadcast(&rhs_dims)
                    .map_err(|e| anyhow!("node {} ({:?}): {e}", id.0, b))?;
                let out_dims = c.node(id).shape.dims();
                if expected.dims() != out_dims {
                    return Err(anyhow!(
                        "node {} ({:?}): output shape {:?} does not match broadcast of {:?} and {:?}",
                        id.0,
                        b,
                        out_dims,
                        a_shape.dims(),
                        rhs_dims
                    ));
                }
                Ok(())
            }
            Op::MatMul(a, b) => {
                let a_shape = c.node(*a).shape.clone();
                let b_dims = c.node(*b).shape.dims().to_vec();
                let expected = a_shape
                    .matmul_broadcast(&b_dims)
                    .map_err(|e| anyhow!("node {} (MatMul): {e}", id.0))?;
                let out_dims = c.node(id).shape.dims();
                if expected.dims() != out_dims {
                    return Err(anyhow!(
                        "node {} (MatMul): output shape {:?} does not match expected {:?}",
                        id.0,
                        out_dims,
                        expected.dims()
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
