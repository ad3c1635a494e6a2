//! Reverse-mode gradient checks: elementwise chain rule, matmul, reductions,
//! and gradient flow back through strided slicing.

use tensorgraph_core::{Context, Dtype, GPError, Graph, HostBuffer, SliceRange};

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-3, "{actual:?} != {expected:?}");
    }
}

#[test]
fn gradient_of_sum_is_ones_like_input() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[4], 0.0, 1.0);
    let y = x.sum(&[0]).unwrap();

    let mut graph = Graph::new(y);
    let grad = graph.backward(&x).unwrap().expect("x participates in the sum");
    assert_close(&grad.to_vec_f64().unwrap(), &[1.0, 1.0, 1.0, 1.0]);
}

#[test]
fn matmul_backward_matches_transposed_products() {
    let ctx = Context::new_cpu();
    let a = Context::from_host_buffer(&ctx, &[2, 2], HostBuffer::F32(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
    let b = Context::from_host_buffer(&ctx, &[2, 2], HostBuffer::F32(vec![5.0, 6.0, 7.0, 8.0])).unwrap();
    let c = a.matmul(&b).unwrap();
    let loss = c.sum(&[0, 1]).unwrap();

    let mut graph = Graph::new(loss);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[88.0]);

    let grad_a = graph.backward(&a).unwrap().unwrap();
    assert_close(&grad_a.to_vec_f64().unwrap(), &[11.0, 15.0, 11.0, 15.0]);

    let grad_b = graph.backward(&b).unwrap().unwrap();
    assert_close(&grad_b.to_vec_f64().unwrap(), &[4.0, 4.0, 6.0, 6.0]);
}

#[test]
fn chain_rule_through_mixed_add_mul_matches_hand_derivative() {
    let ctx = Context::new_cpu();
    let x1 = Context::from_host_buffer(&ctx, &[3], HostBuffer::F32(vec![1.0, 2.0, 3.0])).unwrap();
    let x2 = Context::from_host_buffer(&ctx, &[3], HostBuffer::F32(vec![4.0, 5.0, 6.0])).unwrap();

    let sum = x1.try_add(&x2).unwrap();
    let prod = x1.try_mul(&x2).unwrap();
    let f = sum.try_mul(&prod).unwrap();
    let loss = f.sum(&[0]).unwrap();

    let mut graph = Graph::new(loss);
    let out = graph.forward().unwrap();
    assert_close(&out.to_vec_f64().unwrap(), &[20.0 + 70.0 + 162.0]);

    let grad1 = graph.backward(&x1).unwrap().unwrap();
    assert_close(&grad1.to_vec_f64().unwrap(), &[8.0, 19.0, 36.0]);

    let grad2 = graph.backward(&x2).unwrap().unwrap();
    assert_close(&grad2.to_vec_f64().unwrap(), &[2.0, 11.0, 30.0]);
}

#[test]
fn backward_through_a_strided_slice_produces_an_indicator_tensor() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[3, 4, 5], 0.0, 1.0);
    let y = x
        .slice(&[SliceRange::new(1, 3, 1), SliceRange::new(0, 4, 2), SliceRange::new(0, 5, 3)])
        .unwrap();
    assert_eq!(y.shape().dims(), &[2, 2, 2]);

    let loss = y.sum(&[0, 1, 2]).unwrap();
    let mut graph = Graph::new(loss);
    let grad = graph.backward(&x).unwrap().expect("x participates in the slice");
    let values = grad.to_vec_f64().unwrap();

    assert_eq!(values.len(), 60);
    assert_eq!(values.iter().sum::<f64>(), 8.0);

    // sliced positions: axis0 in {1,2}, axis1 in {0,2}, axis2 in {0,3}
    for a0 in 0..3usize {
        for a1 in 0..4usize {
            for a2 in 0..5usize {
                let flat = a0 * 20 + a1 * 5 + a2;
                let expected = if (1..3).contains(&a0) && [0, 2].contains(&a1) && [0, 3].contains(&a2) {
                    1.0
                } else {
                    0.0
                };
                assert_eq!(values[flat], expected, "mismatch at ({a0},{a1},{a2})");
            }
        }
    }
}

#[test]
fn repeated_backward_on_the_same_target_accumulates() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[4], 0.0, 1.0);
    let y = x.sum(&[0]).unwrap();

    let mut graph = Graph::new(y);
    let first = graph.backward(&x).unwrap().unwrap();
    assert_close(&first.to_vec_f64().unwrap(), &[1.0, 1.0, 1.0, 1.0]);

    let second = graph.backward(&x).unwrap().unwrap();
    assert_close(&second.to_vec_f64().unwrap(), &[2.0, 2.0, 2.0, 2.0]);
}

#[test]
fn backward_on_non_scalar_root_is_rejected() {
    let ctx = Context::new_cpu();
    let x = Context::arange(&ctx, Dtype::F32, &[3], 0.0, 1.0);
    let y = x.exp();

    let mut graph = Graph::new(y);
    let err = graph.backward(&x).unwrap_err();
    assert!(matches!(err, GPError::Gradient { numel: 3 }));
}
