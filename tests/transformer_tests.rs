use monza::models::{DecoderModel, ModelConfig};
use monza::nn::{self, Embedding, KvCache, LayerNorm, MultiHeadAttention, RmsNorm, RotaryEmbedding};
use monza::util::rng;
use monza::{MzError, Tensor, Variable};
use ndarray::Array2;

#[test]
fn rope_preserves_vector_norm() {
    rng::set_seed(21);
    let rope = RotaryEmbedding::new(8, 10_000.0).unwrap();
    for pos in [0usize, 3, 17, 101] {
        let x = Variable::new(Tensor::rand_uniform(&[2, 2, 4, 8], -1.0, 1.0));
        let y = rope.apply(&x, pos).unwrap();
        let xn = x.value().map(|v| v * v).sum_all().sqrt();
        let yn = y.value().map(|v| v * v).sum_all().sqrt();
        assert!((xn - yn).abs() < 1e-5, "pos {}: {} vs {}", pos, xn, yn);
    }
}

#[test]
fn rope_at_position_zero_is_identity() {
    let rope = RotaryEmbedding::new(4, 10_000.0).unwrap();
    let x = Variable::new(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 1, 4]).unwrap());
    let y = rope.apply(&x, 0).unwrap();
    for (a, b) in x.value().to_vec().iter().zip(y.value().to_vec().iter()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn rope_rejects_odd_head_dim() {
    assert!(matches!(
        RotaryEmbedding::new(7, 10_000.0),
        Err(MzError::ConfigValidation(_))
    ));
}

#[test]
fn single_token_attention_with_identity_projections_returns_value() {
    // With T=1 there is exactly one key, so softmax collapses to weight 1
    // and the output is V[0]; identity projections make that the input row.
    let attn = MultiHeadAttention::new(4, 1, 10_000.0, 0.0).unwrap();
    let eye = Tensor::from_vec(
        vec![
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ],
        &[4, 4],
    )
    .unwrap();
    for (_, p) in nn::named_parameters(&attn) {
        p.set_value(eye.clone()).unwrap();
    }
    let x = Variable::new(Tensor::from_vec(vec![0.3, -1.2, 0.8, 0.1], &[1, 1, 4]).unwrap());
    let y = attn.forward(&x, 0, None).unwrap();
    for (a, b) in x.value().to_vec().iter().zip(y.value().to_vec().iter()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn causal_mask_blocks_future_positions() {
    rng::set_seed(33);
    let mut attn = MultiHeadAttention::new(8, 2, 10_000.0, 0.0).unwrap();
    nn::eval(&mut attn);

    // Changing a future token must not change the current position's output.
    let base = Tensor::rand_uniform(&[1, 3, 8], -1.0, 1.0);
    let mut bumped = base.clone();
    for d in 0..8 {
        let old = bumped.get(&[0, 2, d]).unwrap();
        bumped.set(&[0, 2, d], old + 5.0).unwrap();
    }
    let y0 = attn.forward(&Variable::new(base), 0, None).unwrap();
    let y1 = attn.forward(&Variable::new(bumped), 0, None).unwrap();
    for d in 0..8 {
        let a = y0.value().get(&[0, 1, d]).unwrap();
        let b = y1.value().get(&[0, 1, d]).unwrap();
        assert!((a - b).abs() < 1e-6, "position 1 saw the future at dim {}", d);
    }
}

#[test]
fn rmsnorm_matches_reference_formula() {
    let norm = RmsNorm::new(3, 1e-6).unwrap();
    let x = Variable::new(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[1, 3]).unwrap());
    let y = norm.forward(&x).unwrap();
    let ms = (1.0f32 + 4.0 + 9.0) / 3.0;
    let rms = (ms + 1e-6).sqrt();
    for (i, &v) in [1.0f32, 2.0, 3.0].iter().enumerate() {
        assert!((y.value().get(&[0, i]).unwrap() - v / rms).abs() < 1e-6);
    }
}

#[test]
fn layernorm_standardizes_the_feature_axis() {
    rng::set_seed(6);
    let norm = LayerNorm::new(8, LayerNorm::DEFAULT_EPS).unwrap();
    let x = Variable::with_grad(Tensor::rand_uniform(&[2, 3, 8], -2.0, 2.0));
    let y = norm.forward(&x).unwrap();

    // With gamma = 1, beta = 0 each feature row has mean ~0 and variance ~1.
    for b in 0..2 {
        for t in 0..3 {
            let row: Vec<f32> = (0..8).map(|d| y.value().get(&[b, t, d]).unwrap()).collect();
            let mean: f32 = row.iter().sum::<f32>() / 8.0;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 8.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    // Gradients reach both the input and the affine parameters.
    let loss = monza::autograd::ops::sum(&y, None, false).unwrap();
    loss.backward().unwrap();
    assert!(x.grad().is_some());
    for (_, p) in nn::named_parameters(&norm) {
        assert!(p.grad().is_some());
    }
}

#[test]
fn embedding_adds_learned_positions_and_checks_bounds() {
    rng::set_seed(4);
    let emb = Embedding::new(10, 6, Some(8), 0.0, 0.02).unwrap();
    let ids = Array2::from_shape_vec((2, 3), vec![1usize, 2, 3, 4, 5, 6]).unwrap();
    let h = emb.forward(&ids, 0).unwrap();
    assert_eq!(h.shape(), vec![2, 3, 6]);

    // start_pos pushing past max_positions is an error.
    assert!(matches!(
        emb.forward(&ids, 7),
        Err(MzError::IndexOutOfRange { .. })
    ));

    // Token id outside the vocabulary is an error too.
    let bad = Array2::from_shape_vec((1, 2), vec![3usize, 99]).unwrap();
    assert!(matches!(
        emb.forward(&bad, 0),
        Err(MzError::IndexOutOfRange { .. })
    ));
}

#[test]
fn kv_cache_append_respects_capacity() {
    let mut cache = KvCache::new(1, 2, 4, 8);
    let chunk = Tensor::zeros(&[1, 2, 3, 8]);
    cache.append(&chunk, &chunk).unwrap();
    assert_eq!(cache.len(), 3);

    let two = Tensor::zeros(&[1, 2, 2, 8]);
    match cache.append(&two, &two) {
        Err(MzError::CacheOverflow {
            len: 3,
            append: 2,
            capacity: 4,
        }) => {}
        other => panic!("expected overflow, got {:?}", other.err()),
    }

    cache.reset();
    assert_eq!(cache.len(), 0);
    cache.append(&two, &two).unwrap();
    assert_eq!(cache.len(), 2);
}

#[test]
fn incremental_decode_matches_full_forward() {
    rng::set_seed(55);
    let mut cfg = ModelConfig::new(32, 16, 2, 2);
    cfg.intermediate_size = 32;
    cfg.max_seq_len = 32;
    let mut model = DecoderModel::new(cfg).unwrap();
    nn::eval(&mut model);

    let tokens: Vec<usize> = vec![5, 12, 7, 31, 2, 9, 14, 1, 28, 17];
    let full_ids = Array2::from_shape_vec((1, 10), tokens.clone()).unwrap();
    let full = model.forward(&full_ids).unwrap().logits;

    let mut state = model.new_state(1, 16);
    for (t, &tok) in tokens.iter().enumerate() {
        let step = Array2::from_shape_vec((1, 1), vec![tok]).unwrap();
        let logits = model.forward_cached(&step, &mut state).unwrap();
        assert_eq!(logits.shape(), vec![1, 1, 32]);
        for v in 0..32 {
            let a = full.value().get(&[0, t, v]).unwrap();
            let b = logits.value().get(&[0, 0, v]).unwrap();
            assert!(
                (a - b).abs() < 1e-5,
                "logit mismatch at t={} v={}: {} vs {}",
                t,
                v,
                a,
                b
            );
        }
    }
    assert_eq!(state.position(), 10);
}

#[test]
fn greedy_generation_runs_through_the_cache() {
    rng::set_seed(8);
    let mut cfg = ModelConfig::new(16, 8, 1, 2);
    cfg.intermediate_size = 16;
    let mut model = DecoderModel::new(cfg).unwrap();
    nn::eval(&mut model);
    let out = model.greedy_generate(&[1, 2, 3], 5).unwrap();
    assert_eq!(out.len(), 8);
    assert!(out.iter().all(|&t| t < 16));
}
