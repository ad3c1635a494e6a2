//! Kernel fusion: a fused elementwise chain must produce the same values as
//! the unfused per-op evaluation of the identical expression, and a single
//! elementwise chain rooted at one output should compile to exactly one
//! fused kernel.

use std::collections::HashMap;

use tensorgraph_core::backend::FusedKernelSpec;
use tensorgraph_core::graph::exec::ExecEngine;
use tensorgraph_core::tensor::TensorId;
use tensorgraph_core::{Context, Dtype, Graph};

fn build_expr(ctx: &std::rc::Rc<std::cell::RefCell<Context>>) -> tensorgraph_core::Tensor {
    let a = Context::full(ctx, Dtype::F32, &[4], 2.0);
    let b = Context::full(ctx, Dtype::F32, &[4], 3.0);
    let prod = a.try_mul(&b).unwrap();
    let shifted = prod.try_add(&a).unwrap();
    shifted.exp()
}

#[test]
fn elementwise_chain_compiles_to_a_single_fused_kernel() {
    let ctx = Context::new_cpu();
    let root = build_expr(&ctx);
    let root_id = root.id;

    let mut graph = Graph::new(root);
    graph.compile().unwrap();
    assert_eq!(graph.fused_kernel_count(), 1);

    let keys = graph.fused_kernel_keys();
    assert_eq!(keys.len(), 1);
    assert!(ctx.borrow().is_fused(&keys[0]));

    let out = graph.forward().unwrap();
    assert!((out.to_vec_f64().unwrap()[0] - 8.0f64.exp()).abs() < 1e-3);
}

#[test]
fn fused_execution_matches_unfused_per_op_execution() {
    let fused_ctx = Context::new_cpu();
    let fused_root = build_expr(&fused_ctx);
    let mut graph = Graph::new(fused_root.clone());
    graph.compile().unwrap();
    assert_eq!(graph.fused_kernel_count(), 1, "expression must actually fuse for this check to be meaningful");
    graph.forward().unwrap();
    let fused_values = fused_root.to_vec_f64().unwrap();

    let unfused_ctx = Context::new_cpu();
    let unfused_root = build_expr(&unfused_ctx);
    let empty: HashMap<TensorId, FusedKernelSpec> = HashMap::new();
    ExecEngine::forward(&unfused_ctx, unfused_root.id, &empty).unwrap();
    let unfused_values = unfused_root.to_vec_f64().unwrap();

    assert_eq!(fused_values.len(), unfused_values.len());
    for (f, u) in fused_values.iter().zip(&unfused_values) {
        assert!((f - u).abs() < 1e-3, "{fused_values:?} != {unfused_values:?}");
    }
}

#[test]
fn comparison_ops_are_never_folded_into_a_fused_kernel() {
    let ctx = Context::new_cpu();
    let a = Context::full(&ctx, Dtype::F32, &[4], 1.0);
    let b = Context::full(&ctx, Dtype::F32, &[4], 2.0);
    let mask = a.lt(&b).unwrap();
    let widened = mask.as_contiguous();

    let mut graph = Graph::new(widened);
    graph.compile().unwrap();
    assert_eq!(graph.fused_kernel_count(), 0);
}
