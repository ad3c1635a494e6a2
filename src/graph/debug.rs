//! Textual graph dump for debugging: one line per node, in arena order.
//! Grounded on `impl Display for Graph` in AlphaZero's `nn-graph/src/graph.rs`
//! (a `{id} = {op summary}` listing rather than an image/graphviz render).

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::context::Context;
use crate::tensor::{Op, TensorId};

pub fn format_graph(ctx: &Rc<RefCell<Context>>) -> String {
    let c = ctx.borrow();
    let mut out = String::new();
    let _ = writeln!(out, "Graph {{");
    for i in 0..c.len() {
        let id = TensorId(i);
        let node = c.node(id);
        let _ = writeln!(
            out,
            "  %{i} : {}{:?} = {}  [storage={}]",
            node.dtype,
            node.shape.dims(),
            format_op(&node.op),
            if node.storage.is_some() { "materialized" } else { "pending" },
        );
    }
    let _ = writeln!(out, "}}");
    out
}

fn format_op(op: &Op) -> String {
    match op {
        Op::Constant(v) => format!("constant({v})"),
        Op::Arange { start, step } => format!("arange(start={start}, step={step})"),
        Op::FromHostBuffer => "from_host_buffer".to_string(),
        Op::Unary(u, a) => format!("{}(%{})", u.name(), a.0),
        Op::Binary(b, a, c) => format!("{}(%{}, %{})", b.name(), a.0, c.0),
        Op::Reduce { op, input, dims } => format!("{:?}(%{}, dims={:?})", op, input.0, dims),
        Op::Reshape { input, requires_copy } => format!("reshape(%{}, copy={requires_copy})", input.0),
        Op::Permute { input, order } => format!("permute(%{}, order={:?})", input.0, order),
        Op::Slice { input, ranges } => format!("slice(%{}, ranges={})", input.0, ranges.len()),
        Op::AsContiguous { input } => format!("as_contiguous(%{})", input.0),
        Op::MatMul(a, b) => format!("matmul(%{}, %{})", a.0, b.0),
        Op::SliceScatter { input, full_dims, .. } => format!("slice_scatter(%{}, full_dims={:?})", input.0, full_dims),
    }
}
