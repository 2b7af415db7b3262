use monza::util::rng;
use monza::{MzError, Tensor};

#[test]
fn broadcast_follows_numpy_alignment() {
    let a = Tensor::ones(&[2, 1, 3]);
    let b = Tensor::ones(&[4, 1]);
    let c = a.add_t(&b).unwrap();
    assert_eq!(c.shape(), &[2, 4, 3]);
    assert_eq!(c.get(&[1, 2, 0]).unwrap(), 2.0);
}

#[test]
fn incompatible_shapes_name_both_operands() {
    let a = Tensor::ones(&[2, 3]);
    let b = Tensor::ones(&[2, 4]);
    match a.mul_t(&b) {
        Err(MzError::ShapeMismatch { lhs, rhs, .. }) => {
            assert_eq!(lhs, vec![2, 3]);
            assert_eq!(rhs, vec![2, 4]);
        }
        other => panic!("expected shape mismatch, got {:?}", other.map(|t| t.shape().to_vec())),
    }
}

#[test]
fn log_softmax_equals_x_minus_logsumexp() {
    rng::set_seed(3);
    let x = Tensor::rand_uniform(&[4, 7], -2.0, 2.0);
    let ls = x.log_softmax(-1).unwrap();
    for row in 0..4 {
        let mut max = f32::NEG_INFINITY;
        for col in 0..7 {
            max = max.max(x.get(&[row, col]).unwrap());
        }
        let lse = max
            + (0..7)
                .map(|col| (x.get(&[row, col]).unwrap() - max).exp())
                .sum::<f32>()
                .ln();
        for col in 0..7 {
            let expected = x.get(&[row, col]).unwrap() - lse;
            assert!((ls.get(&[row, col]).unwrap() - expected).abs() < 1e-5);
        }
    }
}

#[test]
fn softmax_rows_sum_to_one_and_masked_rows_are_zero() {
    let x = Tensor::from_vec(
        vec![
            1.0,
            2.0,
            3.0,
            f32::NEG_INFINITY,
            f32::NEG_INFINITY,
            f32::NEG_INFINITY,
        ],
        &[2, 3],
    )
    .unwrap();
    let y = x.softmax(-1).unwrap();
    let live: f32 = (0..3).map(|c| y.get(&[0, c]).unwrap()).sum();
    assert!((live - 1.0).abs() < 1e-6);
    for c in 0..3 {
        assert_eq!(y.get(&[1, c]).unwrap(), 0.0);
    }
    assert!(y.all_finite());
}

#[test]
fn sigmoid_saturates_without_overflow() {
    let x = Tensor::from_vec(vec![-20.0, 0.0, 20.0], &[3]).unwrap();
    let y = x.sigmoid();
    assert!(y.all_finite());
    assert!(y.get(&[0]).unwrap() < 1e-8);
    assert!((y.get(&[1]).unwrap() - 0.5).abs() < 1e-6);
    assert!(y.get(&[2]).unwrap() > 1.0 - 1e-8);
}

#[test]
fn reductions_support_negative_axes_and_keep_dims() {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let s = x.sum(Some(-1), true).unwrap();
    assert_eq!(s.shape(), &[2, 1]);
    assert_eq!(s.get(&[0, 0]).unwrap(), 6.0);
    assert_eq!(s.get(&[1, 0]).unwrap(), 15.0);

    let m = x.mean(Some(0), false).unwrap();
    assert_eq!(m.shape(), &[3]);
    assert_eq!(m.get(&[1]).unwrap(), 3.5);

    let v = x.variance(-1, false).unwrap();
    assert!((v.get(&[0]).unwrap() - 2.0 / 3.0).abs() < 1e-6);

    let mx = x.max_reduce(1, false).unwrap();
    assert_eq!(mx.to_vec(), vec![3.0, 6.0]);
    let mn = x.min_reduce(0, false).unwrap();
    assert_eq!(mn.to_vec(), vec![1.0, 2.0, 3.0]);

    let r = Tensor::arange(4);
    assert_eq!(r.to_vec(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn tril_offsets_shift_the_diagonal() {
    let t0 = Tensor::tril(3, 3, 0);
    assert_eq!(
        t0.to_vec(),
        vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0]
    );
    let t1 = Tensor::tril(2, 4, 1);
    assert_eq!(t1.to_vec(), vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0]);
}

#[test]
fn masked_fill_replaces_truthy_positions() {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let mask = Tensor::from_vec(vec![0.0, 1.0], &[2]).unwrap();
    let y = x.masked_fill(&mask, -9.0).unwrap();
    assert_eq!(y.to_vec(), vec![1.0, -9.0, 3.0, -9.0]);
}

#[test]
fn repeat_tiles_each_axis() {
    let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
    let y = x.repeat(&[2, 3]).unwrap();
    assert_eq!(y.shape(), &[2, 6]);
    assert_eq!(
        y.to_vec(),
        vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0]
    );
}

#[test]
fn index_select_rejects_out_of_range() {
    let x = Tensor::ones(&[3, 2]);
    match x.index_select(0, &[0, 5]) {
        Err(MzError::IndexOutOfRange { index: 5, size: 3, .. }) => {}
        other => panic!("expected index error, got {:?}", other.map(|t| t.shape().to_vec())),
    }
}

#[test]
fn reshape_rejects_size_mismatch() {
    let x = Tensor::ones(&[2, 3]);
    assert!(matches!(
        x.reshape(&[4, 2]),
        Err(MzError::ShapeMismatch { .. })
    ));
}

#[test]
fn permute_is_its_own_inverse_through_the_reverse_axes() {
    rng::set_seed(5);
    let x = Tensor::rand_uniform(&[2, 3, 4], -1.0, 1.0);
    let p = x.permute(&[2, 0, 1]).unwrap();
    assert_eq!(p.shape(), &[4, 2, 3]);
    let back = p.permute(&[1, 2, 0]).unwrap();
    assert_eq!(back.to_vec(), x.to_vec());
}

#[test]
fn randn_is_reproducible_under_a_pinned_seed() {
    rng::set_seed(42);
    let a = Tensor::randn(&[8]);
    rng::set_seed(42);
    let b = Tensor::randn(&[8]);
    assert_eq!(a.to_vec(), b.to_vec());
}

#[test]
fn serde_round_trip_preserves_shape_and_data() {
    let x = Tensor::from_vec(vec![1.5, -2.0, 0.25, 8.0], &[2, 2]).unwrap();
    let json = serde_json::to_string(&x).unwrap();
    let back: Tensor = serde_json::from_str(&json).unwrap();
    assert_eq!(back, x);
}
