use monza::autograd::ops;
use monza::data::LmDataset;
use monza::loss::{self, accuracy, causal_lm_loss, mse, softmax_cross_entropy};
use monza::models::{DecoderModel, ModelConfig};
use monza::nn::{self, Linear};
use monza::optim::{Adam, Optimizer, Sgd};
use monza::util::{logging, rng};
use monza::{Tensor, Variable};
use ndarray::Array2;

/// Linear regression on y = 2x + 1: a single Linear(1 -> 1) trained with
/// MSE and Adam converges to the generating coefficients.
#[test]
fn linear_regression_recovers_slope_and_intercept() {
    logging::init();
    rng::set_seed(13);
    let linear = Linear::new(1, 1, true).unwrap();
    let mut adam = Adam::new(nn::parameters(&linear), 0.05).unwrap();

    for _ in 0..200 {
        let x = Tensor::rand_uniform(&[32, 1], -1.0, 1.0);
        let y = x.map(|v| 2.0 * v + 1.0);
        let pred = linear.forward(&Variable::new(x)).unwrap();
        let loss = mse(&pred, &Variable::new(y)).unwrap();
        adam.zero_grads();
        loss.backward().unwrap();
        adam.step().unwrap();
    }

    let w = linear.weight().value().get(&[0, 0]).unwrap();
    let b = linear.bias().unwrap().value().get(&[0]).unwrap();
    assert!((w - 2.0).abs() < 0.05, "w = {}", w);
    assert!((b - 1.0).abs() < 0.05, "b = {}", b);
}

fn spiral_dataset(points_per_class: usize) -> (Vec<f32>, Vec<usize>) {
    // Deterministic 3-class spiral with mild radial noise.
    let mut xs = Vec::with_capacity(points_per_class * 3 * 2);
    let mut ys = Vec::with_capacity(points_per_class * 3);
    rng::set_seed(99);
    let noise = Tensor::randn(&[points_per_class * 3]);
    for class in 0..3usize {
        for i in 0..points_per_class {
            let r = i as f32 / points_per_class as f32;
            let idx = class * points_per_class + i;
            let theta = class as f32 * 4.0 + 4.0 * r + noise.get(&[idx]).unwrap() * 0.05;
            xs.push(r * theta.sin());
            xs.push(r * theta.cos());
            ys.push(class);
        }
    }
    (xs, ys)
}

/// A 3-layer ReLU MLP separates the spiral with plain SGD.
#[test]
fn spiral_classification_reaches_training_accuracy() {
    logging::init();
    rng::set_seed(14);
    let (xs, ys) = spiral_dataset(100);
    let n = ys.len();
    let l1 = Linear::new(2, 30, true).unwrap();
    let l2 = Linear::new(30, 30, true).unwrap();
    let l3 = Linear::new(30, 3, true).unwrap();
    let mut params = nn::parameters(&l1);
    params.extend(nn::parameters(&l2));
    params.extend(nn::parameters(&l3));
    let mut sgd = Sgd::new(params.clone(), 0.1).unwrap();

    let forward = |x: &Variable| {
        let h = ops::relu(&l1.forward(x).unwrap()).unwrap();
        let h = ops::relu(&l2.forward(&h).unwrap()).unwrap();
        l3.forward(&h).unwrap()
    };

    let batch = 30usize;
    let mut order: Vec<usize> = (0..n).collect();
    for _epoch in 0..300 {
        rng::with_rng(|r| {
            use rand::seq::SliceRandom;
            order.shuffle(r);
        });
        for chunk in order.chunks(batch) {
            let mut bx = Vec::with_capacity(chunk.len() * 2);
            let mut by = Vec::with_capacity(chunk.len());
            for &i in chunk {
                bx.push(xs[2 * i]);
                bx.push(xs[2 * i + 1]);
                by.push(ys[i]);
            }
            let x = Variable::new(Tensor::from_vec(bx, &[chunk.len(), 2]).unwrap());
            let logits = forward(&x);
            let loss = softmax_cross_entropy(&logits, &by).unwrap();
            for p in &params {
                p.clear_grad();
            }
            loss.backward().unwrap();
            sgd.step().unwrap();
        }
    }

    let all = Variable::new(Tensor::from_vec(xs, &[n, 2]).unwrap());
    let logits = forward(&all);
    let acc = accuracy(&logits.value(), &ys).unwrap();
    assert!(acc >= 0.95, "training accuracy {}", acc);
}

/// A small decoder memorizes a deterministic cyclic sequence down to
/// perplexity < 5.
#[test]
fn mini_lm_perplexity_drops_below_five() {
    logging::init();
    rng::set_seed(15);
    let vocab = 32usize;
    let mut cfg = ModelConfig::new(vocab, 32, 2, 4);
    cfg.intermediate_size = 64;
    cfg.max_seq_len = 64;
    let model = DecoderModel::new(cfg).unwrap();
    let mut adam = Adam::new(nn::parameters(&model), 1e-3).unwrap();

    // The sequence 1, 2, ..., 31, 0 repeated: every token determines the
    // next one exactly.
    let seq: Vec<usize> = (1..vocab).chain([0]).collect();
    let inputs = Array2::from_shape_vec((1, vocab - 1), seq[..vocab - 1].to_vec()).unwrap();
    let targets = Array2::from_shape_vec((1, vocab - 1), seq[1..].to_vec()).unwrap();

    let mut last_loss = f32::INFINITY;
    for _ in 0..400 {
        let out = model.forward(&inputs).unwrap();
        let loss = causal_lm_loss(&out.logits, &targets, None).unwrap();
        last_loss = loss.item().unwrap();
        adam.zero_grads();
        loss.backward().unwrap();
        adam.step().unwrap();
    }

    let perplexity = last_loss.exp();
    assert!(perplexity < 5.0, "perplexity {}", perplexity);
}

/// The supervised driver wires dataset, schedule, clipping and the MoE aux
/// loss together; a few epochs on a toy corpus must push the loss down.
#[test]
fn supervised_trainer_runs_a_moe_model_end_to_end() {
    use monza::nn::MoeConfig;
    use monza::optim::{DecayKind, LrSchedule};
    use monza::train::supervised::SupervisedTrainer;

    logging::init();
    rng::set_seed(18);
    let mut cfg = ModelConfig::new(16, 16, 1, 2);
    cfg.intermediate_size = 32;
    cfg.max_seq_len = 16;
    cfg.moe = Some(MoeConfig {
        num_experts: 4,
        top_k: 2,
        hidden_dim: 16,
        noise_std: 0.05,
        aux_loss_coef: 0.01,
    });
    let model = DecoderModel::new(cfg).unwrap();
    let mut adam = Adam::new(nn::parameters(&model), 3e-3).unwrap();

    let sequences: Vec<Vec<usize>> = (0..8)
        .map(|i| (0..9).map(|t| (i + 2 * t) % 16).collect())
        .collect();
    let mut dataset = monza::data::LmDataset::new(sequences, 4, 8, true).unwrap();

    let schedule = LrSchedule::new(3e-3, 4, 40, DecayKind::Cosine).unwrap();
    let trainer = SupervisedTrainer::new(Some(1.0), Some(schedule));

    let first = trainer.run(&model, &mut adam, &mut dataset, 1).unwrap();
    let report = trainer.run(&model, &mut adam, &mut dataset, 14).unwrap();

    assert_eq!(first.steps, 2);
    assert_eq!(report.skipped_steps, 0);
    assert!(report.final_loss.is_finite());
    assert!(
        report.final_loss < first.mean_loss,
        "loss did not improve: {} -> {}",
        first.mean_loss,
        report.final_loss
    );
}

#[test]
fn masked_positions_contribute_no_loss() {
    rng::set_seed(16);
    let logits = Variable::with_grad(Tensor::rand_uniform(&[1, 4, 8], -1.0, 1.0));
    let targets = Array2::from_shape_vec((1, 4), vec![1usize, 2, 3, 4]).unwrap();
    let mask = Tensor::from_vec(vec![1.0, 1.0, 0.0, 0.0], &[1, 4]).unwrap();

    let loss = causal_lm_loss(&logits, &targets, Some(&mask)).unwrap();
    loss.backward().unwrap();
    let grad = logits.grad().unwrap();
    for t in 2..4 {
        for v in 0..8 {
            assert_eq!(grad.get(&[0, t, v]).unwrap(), 0.0);
        }
    }

    // Denominator is the unmasked count: doubling the mask halves nothing.
    let full_mask = Tensor::ones(&[1, 4]);
    let l2 = causal_lm_loss(&logits, &targets, Some(&full_mask)).unwrap();
    assert!(l2.item().unwrap() > 0.0);
}

#[test]
fn all_masked_loss_is_rejected() {
    let logits = Variable::new(Tensor::zeros(&[1, 2, 4]));
    let targets = Array2::from_shape_vec((1, 2), vec![0usize, 1]).unwrap();
    let mask = Tensor::zeros(&[1, 2]);
    assert!(causal_lm_loss(&logits, &targets, Some(&mask)).is_err());
}

#[test]
fn entropy_is_maximal_for_uniform_logits() {
    let logits = Variable::new(Tensor::zeros(&[1, 2, 8]));
    let h = loss::entropy(&logits, None).unwrap().item().unwrap();
    assert!((h - (8.0f32).ln()).abs() < 1e-5);
}

#[test]
fn lm_dataset_iterates_shuffled_full_batches() {
    rng::set_seed(17);
    let sequences: Vec<Vec<usize>> = (0..10).map(|i| vec![i + 1; 6]).collect();
    let mut ds = LmDataset::new(sequences, 4, 5, true).unwrap();
    assert_eq!(ds.num_batches(), 2);

    let mut seen = 0;
    while ds.has_next() {
        let batch = ds.next_batch().unwrap();
        assert_eq!(batch.inputs.dim(), (4, 5));
        assert_eq!(batch.targets.dim(), (4, 5));
        assert_eq!(batch.mask.shape(), &[4, 5]);
        seen += 1;
    }
    assert_eq!(seen, 2);
    assert!(ds.next_batch().is_none());

    ds.reset();
    assert!(ds.has_next());
}

#[test]
fn lm_dataset_masks_padding_past_sequence_end() {
    let sequences = vec![vec![7usize, 8, 9], vec![1, 2, 3, 4, 5, 6]];
    let mut ds = LmDataset::new(sequences, 2, 5, false).unwrap();
    let batch = ds.next_batch().unwrap();
    // First row holds a 3-token sequence: two next-token pairs, then pad.
    assert_eq!(batch.inputs[[0, 0]], 7);
    assert_eq!(batch.targets[[0, 1]], 9);
    assert_eq!(batch.mask.get(&[0, 1]).unwrap(), 1.0);
    assert_eq!(batch.mask.get(&[0, 2]).unwrap(), 0.0);
    assert_eq!(batch.inputs[[0, 3]], 0);
    // Second row fills the window.
    assert_eq!(batch.mask.get(&[1, 4]).unwrap(), 1.0);
}
