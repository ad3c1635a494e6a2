//! End-to-end forward evaluation: literal scenarios, determinism, and
//! round-tripping through the host buffer and view machinery.

use tensorgraph_core::{Context, Dtype, Graph, HostBuffer, SliceRange};

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
    }
}

#[test]
fn literal_add_of_full_and_arange() {
    let ctx = Context::new_cpu();
    let x1 = Context::full(&ctx, Dtype::F32, &[2, 3], 7.0);
    let x2 = Context::arange(&ctx, Dtype::F32, &[2, 3], 0.0, 1.0);
    let x3 = x1.try_add(&x2).unwrap();

    let mut graph = Graph::new(x3);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
}

#[test]
fn forward_is_deterministic_across_repeated_calls() {
    let ctx = Context::new_cpu();
    let a = Context::arange(&ctx, Dtype::F32, &[5], 1.0, 1.0);
    let b = a.exp();
    let mut graph = Graph::new(b);

    let first = graph.forward().unwrap().to_vec_f64().unwrap();
    let second = graph.forward().unwrap().to_vec_f64().unwrap();
    assert_eq!(first, second);
}

#[test]
fn from_host_buffer_round_trips_for_contiguous_input() {
    let ctx = Context::new_cpu();
    let host = HostBuffer::F32(vec![1.0, 2.0, 3.0, 4.0]);
    let t = Context::from_host_buffer(&ctx, &[2, 2], host).unwrap();

    let mut graph = Graph::new(t);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn as_contiguous_materializes_a_permuted_view_in_logical_order() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[2, 3], 0.0, 1.0);
    let transposed = x.transpose().unwrap();
    let dense = transposed.as_contiguous();

    let mut graph = Graph::new(dense);
    let out = graph.forward().unwrap();
    assert_eq!(out.shape().dims(), &[3, 2]);
    assert_close(&out.to_vec_f64().unwrap(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn slice_with_negative_step_reverses_values() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[5], 0.0, 1.0);
    let reversed = x.slice(&[SliceRange::new(4, -1, -1)]).unwrap();

    let mut graph = Graph::new(reversed);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[4.0, 3.0, 2.0, 1.0, 0.0]);
}

#[test]
fn slice_of_length_zero_is_a_valid_empty_tensor() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[5], 0.0, 1.0);
    let empty = x.slice(&[SliceRange::new(2, 2, 1)]).unwrap();
    assert_eq!(empty.numel(), 0);

    let mut graph = Graph::new(empty);
    let out = graph.forward().unwrap();
    assert!(out.to_vec_f64().unwrap().is_empty());
}

#[test]
fn reduction_over_all_dims_has_numel_one() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[2, 3], 1.0, 1.0);
    let total = x.sum(&[0, 1]).unwrap();
    assert_eq!(total.numel(), 1);

    let mut graph = Graph::new(total);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[21.0]);
}

#[test]
fn broadcast_scalar_against_matrix_has_zero_strides_on_the_scalar_side() {
    let ctx = Context::new_cpu();
    let scalar = Context::full(&ctx, Dtype::F32, &[1], 2.0);
    let matrix = Context::arange(&ctx, Dtype::F32, &[2, 2], 0.0, 1.0);
    let scaled = matrix.try_mul(&scalar).unwrap();

    let mut graph = Graph::new(scaled);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[0.0, 2.0, 4.0, 6.0]);
}
