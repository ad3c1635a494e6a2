//! Liveness-based buffer reuse analysis over the tensor arena. A diagnostic
//! pass, surfaced through `graph::debug` and available to callers that want
//! to presize a buffer pool; the execution engine allocates a fresh device
//! buffer per node and does not yet consult this plan (see DESIGN.md).
//! Adapted from the teacher's `graph::memory_planner::MemoryPlanner`,
//! keeping its `anyhow::Result` style and greedy last-use algorithm.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use tracing::debug;

use crate::context::Context;
use crate::tensor::TensorId;

pub struct MemoryPlan {
    /// Physical buffer slot assigned to each node index.
    pub buffer_of: Vec<Option<usize>>,
    pub buffer_count: usize,
}

impl MemoryPlan {
    pub fn compute(ctx: &Rc<RefCell<Context>>) -> Result<Self> {
        let c = ctx.borrow();
        let node_count = c.len();

        let mut liveness = vec![0usize; node_count];
        for i in 0..node_count {
            for operand in c.node(TensorId(i)).op.operands() {
                liveness[operand.0] = i;
            }
        }

        let mut plan = vec![None; node_count];
        let mut free_buffers: Vec<usize> = Vec::new();
        let mut active_buffers: HashMap<usize, usize> = HashMap::new();
        let mut buffer_count = 0;

        for i in 0..node_count {
            let buf_idx = free_buffers.pop().unwrap_or_else(|| {
                let idx = buffer_count;
                buffer_count += 1;
                idx
            });
            plan[i] = Some(buf_idx);
            active_buffers.insert(buf_idx, i);

            let mut to_remove = Vec::new();
            for (&bi, &ni) in &active_buffers {
                if liveness[ni] <= i {
                    to_remove.push(bi);
                }
            }
            for bi in to_remove {
                active_buffers.remove(&bi);
                free_buffers.push(bi);
            }
        }

        debug!(nodes = node_count, buffers = buffer_count, "computed memory reuse plan");
        Ok(Self { buffer_of: plan, buffer_count })
    }
}
