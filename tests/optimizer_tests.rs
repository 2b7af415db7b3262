use monza::autograd::ops;
use monza::nn::Parameter;
use monza::optim::{clip_global_norm, Adam, DecayKind, LrSchedule, Optimizer, Sgd};
use monza::{MzError, Tensor, Variable};

fn scalar_param(v: f32) -> Parameter {
    Parameter::new("w", Tensor::from_vec(vec![v], &[1]).unwrap())
}

#[test]
fn adam_first_step_matches_hand_computation() {
    let p = scalar_param(1.0);
    // loss = w, so grad = 1.
    let loss = ops::sum(p.var(), None, false).unwrap();
    loss.backward().unwrap();

    let mut adam = Adam::new(vec![p.clone()], 0.1).unwrap();
    adam.step().unwrap();
    // m_hat = 1, v_hat = 1 => w - lr * 1 / (1 + eps) ~ 0.9
    assert!((p.value().get(&[0]).unwrap() - 0.9).abs() < 1e-5);
}

#[test]
fn sgd_moves_against_the_gradient() {
    let p = scalar_param(2.0);
    let loss = ops::sum(&ops::mul(p.var(), p.var()).unwrap(), None, false).unwrap();
    loss.backward().unwrap(); // grad = 2w = 4
    let mut sgd = Sgd::new(vec![p.clone()], 0.25).unwrap();
    sgd.step().unwrap();
    assert!((p.value().get(&[0]).unwrap() - 1.0).abs() < 1e-6);
}

#[test]
fn parameters_without_grads_are_skipped() {
    let p = scalar_param(1.5);
    let mut adam = Adam::new(vec![p.clone()], 0.1).unwrap();
    adam.step().unwrap();
    assert_eq!(p.value().get(&[0]).unwrap(), 1.5);
}

#[test]
fn non_positive_learning_rate_is_rejected() {
    assert!(matches!(
        Sgd::new(vec![], 0.0),
        Err(MzError::InvalidArgument(_))
    ));
    assert!(matches!(
        Adam::new(vec![], -1.0),
        Err(MzError::InvalidArgument(_))
    ));
}

#[test]
fn global_norm_clipping_rescales_all_grads() {
    let a = Parameter::new("a", Tensor::from_vec(vec![0.0, 0.0], &[2]).unwrap());
    let b = Parameter::new("b", Tensor::from_vec(vec![0.0], &[1]).unwrap());
    // Hand-build grads of norm 5: [3, 0] and [4].
    let la = ops::sum(&ops::mul(a.var(), &Variable::new(Tensor::from_vec(vec![3.0, 0.0], &[2]).unwrap())).unwrap(), None, false).unwrap();
    la.backward().unwrap();
    let lb = ops::sum(&ops::mul(b.var(), &Variable::new(Tensor::from_vec(vec![4.0], &[1]).unwrap())).unwrap(), None, false).unwrap();
    lb.backward().unwrap();

    let params = vec![a.clone(), b.clone()];
    let norm = clip_global_norm(&params, 1.0).unwrap();
    assert!((norm - 5.0).abs() < 1e-5);

    let ga = a.grad().unwrap();
    let gb = b.grad().unwrap();
    let clipped = (ga.get(&[0]).unwrap().powi(2)
        + ga.get(&[1]).unwrap().powi(2)
        + gb.get(&[0]).unwrap().powi(2))
    .sqrt();
    assert!((clipped - 1.0).abs() < 1e-4);
}

#[test]
fn clipping_below_threshold_leaves_grads_alone() {
    let p = scalar_param(0.0);
    let l = ops::sum(&ops::mul(p.var(), &Variable::new(Tensor::from_vec(vec![0.5], &[1]).unwrap())).unwrap(), None, false).unwrap();
    l.backward().unwrap();
    let norm = clip_global_norm(&[p.clone()], 1.0).unwrap();
    assert!((norm - 0.5).abs() < 1e-6);
    assert!((p.grad().unwrap().get(&[0]).unwrap() - 0.5).abs() < 1e-6);
}

#[test]
fn nan_gradients_surface_as_a_non_finite_norm() {
    let p = scalar_param(0.0);
    let l = ops::sum(
        &ops::mul(p.var(), &Variable::new(Tensor::from_vec(vec![f32::NAN], &[1]).unwrap())).unwrap(),
        None,
        false,
    )
    .unwrap();
    l.backward().unwrap();
    let norm = clip_global_norm(&[p.clone()], 1.0).unwrap();
    assert!(norm.is_nan());
    // Grads are left untouched for the caller to inspect or clear.
    assert!(p.grad().unwrap().get(&[0]).unwrap().is_nan());
}

#[test]
fn schedule_warms_up_then_decays() {
    let s = LrSchedule::new(1.0, 10, 110, DecayKind::Linear).unwrap();
    assert!((s.lr_at(0) - 0.1).abs() < 1e-6);
    assert!((s.lr_at(9) - 1.0).abs() < 1e-6);
    assert!((s.lr_at(60) - 0.5).abs() < 1e-6);
    assert!(s.lr_at(109) < 0.02);

    let c = LrSchedule::new(1.0, 0, 100, DecayKind::Cosine).unwrap();
    assert!((c.lr_at(0) - 1.0).abs() < 1e-6);
    assert!((c.lr_at(50) - 0.5).abs() < 1e-6);
    assert!(c.lr_at(100) < 1e-6);

    let n = LrSchedule::new(0.3, 5, 50, DecayKind::None).unwrap();
    assert!((n.lr_at(40) - 0.3).abs() < 1e-6);
}

#[test]
fn schedule_drives_optimizer_lr() {
    let p = scalar_param(0.0);
    let mut adam = Adam::new(vec![p], 1.0).unwrap();
    let s = LrSchedule::new(0.01, 2, 10, DecayKind::Linear).unwrap();
    adam.set_lr(s.lr_at(0));
    assert!((adam.lr() - 0.005).abs() < 1e-7);
    adam.set_lr(s.lr_at(1));
    assert!((adam.lr() - 0.01).abs() < 1e-7);
}
