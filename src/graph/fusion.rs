//! Fusion compiler: walks the DAG from a root and emits one kernel per
//! maximal fusable subgraph. Grounded line-for-line on
//! `original_source/python/metal/compile.py`'s `MTLCompiler`
//! (`_recur_fusable`/`_fuse`/`_recur_compile`), generalized from Metal
//! shading language to CUDA C text.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, instrument};

use crate::backend::{FusedKernelSpec, FusedStep, KernelKey};
use crate::context::Context;
use crate::errors::GPResult;
use crate::tensor::{BinaryOp, Op, TensorId, UnaryOp};

pub struct FusionCompiler;

impl FusionCompiler {
    /// Registers a fused kernel for every maximal fusable subgraph reachable
    /// from `root`. Returns `(fusion root id, compiled spec)` pairs, in
    /// discovery order, so the caller can dispatch each fusion root as a
    /// single kernel launch instead of walking its inlined operands again.
    #[instrument(skip(ctx))]
    pub fn compile(ctx: &Rc<RefCell<Context>>, root: TensorId) -> GPResult<Vec<(TensorId, FusedKernelSpec)>> {
        let mut registered = Vec::new();
        let mut visited = HashSet::new();
        Self::recur_compile(ctx, root, &mut visited, &mut registered)?;
        Ok(registered)
    }

    fn recur_compile(
        ctx: &Rc<RefCell<Context>>,
        id: TensorId,
        visited: &mut HashSet<TensorId>,
        registered: &mut Vec<(TensorId, FusedKernelSpec)>,
    ) -> GPResult<()> {
        if !visited.insert(id) {
            return Ok(());
        }
        let op = clone_op(ctx, id);
        if op.is_fusable() && !op.is_initializer() && Self::fusable_chain(ctx, id) {
            let spec = Self::fuse(ctx, id)?;
            debug!(node = id.0, kernel = %spec.key.name, "registered fused kernel");
            registered.push((id, spec));
            return Ok(());
        }
        for operand in op.operands() {
            Self::recur_compile(ctx, operand, visited, registered)?;
        }
        Ok(())
    }

    /// Recomputed fresh for every candidate (never shared across calls),
    /// matching `_fusable`'s `self._terminals.clear()` re-derivation: a
    /// node is part of a fusable chain iff every transitive operand,
    /// stopping at initializers, is itself fusable.
    fn fusable_chain(ctx: &Rc<RefCell<Context>>, id: TensorId) -> bool {
        let mut cache = HashMap::new();
        Self::fusable_chain_rec(ctx, id, &mut cache)
    }

    fn fusable_chain_rec(ctx: &Rc<RefCell<Context>>, id: TensorId, cache: &mut HashMap<TensorId, bool>) -> bool {
        if let Some(&v) = cache.get(&id) {
            return v;
        }
        let op = clone_op(ctx, id);
        let result = if op.is_initializer() {
            true
        } else if !op.is_fusable() {
            false
        } else {
            op.operands().iter().all(|&operand| Self::fusable_chain_rec(ctx, operand, cache))
        };
        cache.insert(id, result);
        result
    }

    /// Builds the symbol table for the fusion rooted at `root_id`: distinct
    /// initializer nodes become terminal input buffers (tie-break:
    /// initializers are never fused into a kernel that doesn't need them,
    /// since only the ones actually reached become terminals), other
    /// fusable nodes are inlined as one step each.
    fn fuse(ctx: &Rc<RefCell<Context>>, root_id: TensorId) -> GPResult<FusedKernelSpec> {
        let dtype = ctx.borrow().node(root_id).dtype;
        let mut terminals: Vec<TensorId> = Vec::new();
        let mut steps: Vec<FusedStep> = Vec::new();
        let mut memo: HashMap<TensorId, usize> = HashMap::new();
        Self::build_steps(ctx, root_id, &mut terminals, &mut steps, &mut memo);

        let key = KernelKey::fused(root_id.0, dtype);
        let cuda_source = emit_cuda_source(&key, dtype, terminals.len(), &steps);
        let spec = FusedKernelSpec {
            key,
            dtype,
            terminals,
            steps,
            cuda_source,
        };
        ctx.borrow_mut().register_fused(spec.clone())?;
        Ok(spec)
    }

    fn build_steps(
        ctx: &Rc<RefCell<Context>>,
        id: TensorId,
        terminals: &mut Vec<TensorId>,
        steps: &mut Vec<FusedStep>,
        memo: &mut HashMap<TensorId, usize>,
    ) -> usize {
        if let Some(&idx) = memo.get(&id) {
            return idx;
        }
        let op = clone_op(ctx, id);
        let idx = if op.is_initializer() {
            let terminal_idx = terminals.iter().position(|&t| t == id).unwrap_or_else(|| {
                terminals.push(id);
                terminals.len() - 1
            });
            steps.push(FusedStep::Terminal(terminal_idx));
            steps.len() - 1
        } else {
            match op {
                Op::Unary(u, a) => {
                    let ai = Self::build_steps(ctx, a, terminals, steps, memo);
                    steps.push(FusedStep::Unary(u, ai));
                    steps.len() - 1
                }
                Op::Binary(b, a, c) => {
                    let ai = Self::build_steps(ctx, a, terminals, steps, memo);
                    let ci = Self::build_steps(ctx, c, terminals, steps, memo);
                    steps.push(FusedStep::Binary(b, ai, ci));
                    steps.len() - 1
                }
                _ => unreachable!("fuse() is only invoked on a verified fusable chain"),
            }
        };
        memo.insert(id, idx);
        idx
    }
}

fn clone_op(ctx: &Rc<RefCell<Context>>, id: TensorId) -> Op {
    ctx.borrow().node(id).op.clone()
}

fn unary_c_expr(op: UnaryOp, x: &str) -> String {
    match op {
        UnaryOp::Exp => format!("expf({x})"),
        UnaryOp::Log => format!("logf({x})"),
        UnaryOp::Neg => format!("-{x}"),
        UnaryOp::Recip => format!("1.0f / {x}"),
        UnaryOp::Sqrt => format!("sqrtf({x})"),
        UnaryOp::Sq => format!("({x} * {x})"),
    }
}

fn binary_c_expr(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("({a} + {b})"),
        BinaryOp::Sub => format!("({a} - {b})"),
        BinaryOp::Mul => format!("({a} * {b})"),
        BinaryOp::Div => format!("({a} / {b})"),
        BinaryOp::Eq => format!("({a} == {b})"),
        BinaryOp::Neq => format!("({a} != {b})"),
        BinaryOp::Lt => format!("({a} < {b})"),
        BinaryOp::Gt => format!("({a} > {b})"),
        BinaryOp::Leq => format!("({a} <= {b})"),
        BinaryOp::Geq => format!("({a} >= {b})"),
    }
}

/// Templated function with input buffers at `[0..k-1]`, output buffer at
/// `k`, body assignments one per interior node (spec §6's fused kernel
/// source layout).
fn emit_cuda_source(key: &KernelKey, dtype: crate::dtype::Dtype, n_terminals: usize, steps: &[FusedStep]) -> String {
    let t = dtype.c_type();
    let mut params = String::new();
    for i in 0..n_terminals {
        params.push_str(&format!("{t}* input{i}, "));
    }
    params.push_str(&format!("{t}* out, int n"));

    let mut body = String::new();
    for (i, step) in steps.iter().enumerate() {
        let expr = match step {
            FusedStep::Terminal(t) => format!("input{t}[idx]"),
            FusedStep::Unary(op, a) => unary_c_expr(*op, &format!("t{a}")),
            FusedStep::Binary(op, a, b) => binary_c_expr(*op, &format!("t{a}"), &format!("t{b}")),
        };
        body.push_str(&format!("    {t} t{i} = {expr};\n"));
    }
    let last = steps.len() - 1;

    format!(
        "extern \"C\" __global__ void {name}({params}) {{\n    int idx = blockIdx.x * blockDim.x + threadIdx.x;\n    if (idx >= n) return;\n{body}    out[idx] = t{last};\n}}\n",
        name = key.name,
    )
}
