use monza::data::{DpoDataset, DpoPair, GrpoBatch, VerifierKind};
use monza::util::rng;
use monza::{MzError, Tensor};
use ndarray::Array2;

fn pairs() -> Vec<DpoPair> {
    (0..4)
        .map(|i| DpoPair {
            prompt: vec![1, 2],
            chosen: vec![3 + i, 4],
            rejected: vec![7, 8 + i],
        })
        .collect()
}

#[test]
fn dpo_batches_share_one_prompt_mask() {
    rng::set_seed(23);
    let mut ds = DpoDataset::new(pairs(), 2, 6, false).unwrap();
    let batch = ds.next_batch().unwrap();

    assert_eq!(batch.chosen.dim(), (2, 6));
    assert_eq!(batch.rejected.dim(), (2, 6));
    // Prompt positions are masked out, response positions are live.
    assert_eq!(batch.prompt_mask.get(&[0, 0]).unwrap(), 0.0);
    assert_eq!(batch.prompt_mask.get(&[0, 1]).unwrap(), 0.0);
    assert_eq!(batch.prompt_mask.get(&[0, 2]).unwrap(), 1.0);
    assert_eq!(batch.prompt_mask.get(&[0, 3]).unwrap(), 1.0);
    // Beyond both responses the mask stays zero.
    assert_eq!(batch.prompt_mask.get(&[0, 5]).unwrap(), 0.0);
    // Prompt tokens are identical across the pair.
    assert_eq!(batch.chosen[[0, 0]], batch.rejected[[0, 0]]);
    assert_eq!(batch.chosen[[0, 1]], batch.rejected[[0, 1]]);
}

#[test]
fn dpo_dataset_rejects_prompts_that_fill_the_window() {
    let bad = vec![DpoPair {
        prompt: vec![1, 2, 3, 4, 5, 6],
        chosen: vec![7],
        rejected: vec![8],
    }];
    assert!(matches!(
        DpoDataset::new(bad, 1, 6, false),
        Err(MzError::InvalidArgument(_))
    ));
}

#[test]
fn grpo_flatten_keeps_candidate_groups_contiguous() {
    let c0 = Array2::from_shape_vec((2, 3), vec![1, 2, 3, 4, 5, 6]).unwrap();
    let c1 = Array2::from_shape_vec((2, 3), vec![7, 8, 9, 10, 11, 12]).unwrap();
    let batch = GrpoBatch {
        candidates: vec![c0, c1],
        prompt_mask: Tensor::ones(&[2, 3]),
        rewards: Array2::from_shape_vec((2, 2), vec![0.5, 0.1, 0.9, 0.2]).unwrap(),
        verifier: VerifierKind::Math,
    };
    let (ids, mask, rewards) = batch.flattened().unwrap();
    assert_eq!(ids.dim(), (4, 3));
    assert_eq!(mask.shape(), &[4, 3]);
    // Sample 0's candidates first, then sample 1's.
    assert_eq!(ids[[0, 0]], 1);
    assert_eq!(ids[[1, 0]], 7);
    assert_eq!(ids[[2, 0]], 4);
    assert_eq!(ids[[3, 0]], 10);
    assert_eq!(rewards, vec![0.5, 0.1, 0.9, 0.2]);
}

#[test]
fn grpo_batch_validates_reward_shape() {
    let c0 = Array2::from_shape_vec((2, 3), vec![1, 2, 3, 4, 5, 6]).unwrap();
    let batch = GrpoBatch {
        candidates: vec![c0],
        prompt_mask: Tensor::ones(&[2, 3]),
        rewards: Array2::from_shape_vec((2, 2), vec![0.5, 0.1, 0.9, 0.2]).unwrap(),
        verifier: VerifierKind::General,
    };
    assert!(matches!(
        batch.validate(),
        Err(MzError::ShapeMismatch { .. })
    ));
}
