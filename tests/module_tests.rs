use monza::models::{self, DecoderModel, ModelConfig};
use monza::nn::{self, Linear, Module, ParamSet};
use monza::util::rng;
use monza::{MzError, Tensor, Variable};

#[test]
fn named_parameters_walk_is_depth_first_and_insertion_ordered() {
    let cfg = ModelConfig::new(16, 8, 2, 2);
    let model = DecoderModel::new(cfg).unwrap();
    let names: Vec<String> = nn::named_parameters(&model)
        .into_iter()
        .map(|(n, _)| n)
        .collect();

    assert_eq!(names[0], "embedding.token_table");
    assert_eq!(names[1], "block0.attn_norm.weight");
    assert_eq!(names[2], "block0.attn.q_proj.weight");
    assert!(names.contains(&"block1.mlp.down.weight".to_string()));
    assert_eq!(names.last().unwrap(), "lm_head.weight");

    // Stable across repeated walks.
    let again: Vec<String> = nn::named_parameters(&model)
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(names, again);
}

#[test]
fn duplicate_parameter_names_are_rejected() {
    let mut params = ParamSet::new();
    params.register("weight", Tensor::zeros(&[2])).unwrap();
    match params.register("weight", Tensor::zeros(&[2])) {
        Err(MzError::InvalidArgument(msg)) => assert!(msg.contains("weight")),
        other => panic!("expected duplicate rejection, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn train_and_eval_recurse_and_are_idempotent() {
    let cfg = ModelConfig::new(16, 8, 2, 2);
    let mut model = DecoderModel::new(cfg).unwrap();

    nn::eval(&mut model);
    nn::eval(&mut model);
    assert!(!model.is_training());
    for (name, sub) in nn::named_submodules(&model) {
        assert!(!sub.is_training(), "{} still in train mode", name);
    }

    nn::train(&mut model);
    assert!(model.is_training());
    for (_, sub) in nn::named_submodules(&model) {
        assert!(sub.is_training());
    }
}

#[test]
fn clear_grads_drops_every_gradient() {
    rng::set_seed(1);
    let linear = Linear::new(3, 2, true).unwrap();
    let x = Variable::new(Tensor::rand_uniform(&[4, 3], -1.0, 1.0));
    let y = linear.forward(&x).unwrap();
    let loss = monza::autograd::ops::sum(&y, None, false).unwrap();
    loss.backward().unwrap();
    assert!(linear.weight().grad().is_some());
    assert!(linear.bias().unwrap().grad().is_some());

    nn::clear_grads(&linear);
    assert!(linear.weight().grad().is_none());
    assert!(linear.bias().unwrap().grad().is_none());
}

#[test]
fn apply_visits_every_submodule() {
    let cfg = ModelConfig::new(16, 8, 2, 2);
    let mut model = DecoderModel::new(cfg).unwrap();
    let expected = nn::named_submodules(&model).len() + 1;
    let mut visits = 0usize;
    nn::apply(&mut model, &mut |_m| visits += 1);
    assert_eq!(visits, expected);
}

#[test]
fn copy_parameters_and_freeze_build_a_reference_policy() {
    rng::set_seed(2);
    let cfg = ModelConfig::new(16, 8, 1, 2);
    let policy = DecoderModel::new(cfg.clone()).unwrap();
    let reference = DecoderModel::new(cfg).unwrap();

    nn::copy_parameters(&reference, &policy).unwrap();
    nn::freeze(&reference);

    for ((_, p), (_, r)) in nn::named_parameters(&policy)
        .iter()
        .zip(nn::named_parameters(&reference).iter())
    {
        assert_eq!(p.value().to_vec(), r.value().to_vec());
        assert!(r.is_frozen());
        assert!(!p.is_frozen());
    }
}

#[test]
fn frozen_parameters_accumulate_no_gradient() {
    let linear = Linear::new(2, 2, false).unwrap();
    linear.weight().freeze();
    let x = Variable::new(Tensor::ones(&[1, 2]));
    let y = linear.forward(&x).unwrap();
    // The whole graph is grad-free, so backward has nothing to do.
    assert!(!y.requires_grad());
    assert!(linear.weight().grad().is_none());
}

#[test]
fn parameter_handles_share_storage() {
    let linear = Linear::new(2, 2, false).unwrap();
    let from_walk = nn::parameters(&linear).remove(0);
    assert!(from_walk.same_as(linear.weight()));
    from_walk.update_value(|t| t.scale_inplace(0.0));
    assert_eq!(linear.weight().value().sum_all(), 0.0);
}

#[test]
fn kaiming_bound_matches_fan_in() {
    rng::set_seed(9);
    let w = nn::init::kaiming_uniform(&[50, 20], 50);
    let bound = (6.0f32 / 50.0).sqrt();
    for &v in w.to_vec().iter() {
        assert!(v.abs() <= bound + 1e-6);
    }
}

#[test]
fn checkpoint_round_trip_restores_weights() {
    rng::set_seed(77);
    let cfg = ModelConfig::new(12, 8, 1, 2);
    let model = DecoderModel::new(cfg.clone()).unwrap();
    let path = std::env::temp_dir().join(format!("monza-ckpt-{}.json", std::process::id()));

    models::save_weights(&model, &path).unwrap();
    let restored = DecoderModel::new(cfg).unwrap();
    models::load_weights(&restored, &path).unwrap();
    std::fs::remove_file(&path).ok();

    for ((_, a), (_, b)) in nn::named_parameters(&model)
        .iter()
        .zip(nn::named_parameters(&restored).iter())
    {
        assert_eq!(a.value().to_vec(), b.value().to_vec());
    }
}

#[test]
fn config_validation_rejects_bad_head_split() {
    let mut cfg = ModelConfig::new(16, 10, 1, 4);
    cfg.intermediate_size = 32;
    match DecoderModel::new(cfg) {
        Err(MzError::ConfigValidation(msg)) => assert!(msg.contains("num_heads")),
        other => panic!("expected config error, got {:?}", other.err()),
    }
}
