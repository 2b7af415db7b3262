//! Batch assembly from pre-tokenized integer sequences: shuffled LM
//! batches, DPO preference pairs with prompt masks, and GRPO K-candidate
//! groups with rewards.

use crate::tensor::Tensor;
use crate::util::rng;
use crate::{MzError, MzResult};
use ndarray::Array2;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

pub const PAD_TOKEN: usize = 0;

/// One supervised LM batch: next-token inputs/targets plus a loss mask
/// where 1 means "contribute".
pub struct LmBatch {
    pub inputs: Array2<usize>,
    pub targets: Array2<usize>,
    pub mask: Tensor,
}

/// Cursor-driven iteration over tokenized sequences. Each sequence yields
/// `inputs = seq[..T]`, `targets = seq[1..=T]`, padded with `PAD_TOKEN` and
/// masked out past its real length. Trailing sequences that cannot fill a
/// batch are dropped for the epoch.
pub struct LmDataset {
    sequences: Vec<Vec<usize>>,
    batch_size: usize,
    seq_len: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
}

impl LmDataset {
    pub fn new(
        sequences: Vec<Vec<usize>>,
        batch_size: usize,
        seq_len: usize,
        shuffle: bool,
    ) -> MzResult<Self> {
        if batch_size == 0 || seq_len == 0 {
            return Err(MzError::InvalidArgument(format!(
                "dataset: batch_size {} seq_len {}",
                batch_size, seq_len
            )));
        }
        if sequences.len() < batch_size {
            return Err(MzError::InvalidArgument(format!(
                "dataset: {} sequences cannot fill a batch of {}",
                sequences.len(),
                batch_size
            )));
        }
        let mut ds = Self {
            order: (0..sequences.len()).collect(),
            sequences,
            batch_size,
            seq_len,
            shuffle,
            cursor: 0,
        };
        ds.reset();
        Ok(ds)
    }

    /// Rewinds the cursor; reshuffles when shuffling is on.
    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            rng::with_rng(|r| self.order.shuffle(r));
        }
    }

    pub fn has_next(&self) -> bool {
        self.cursor + self.batch_size <= self.order.len()
    }

    pub fn num_batches(&self) -> usize {
        self.order.len() / self.batch_size
    }

    pub fn next_batch(&mut self) -> Option<LmBatch> {
        if !self.has_next() {
            return None;
        }
        let (b, t) = (self.batch_size, self.seq_len);
        let mut inputs = Array2::from_elem((b, t), PAD_TOKEN);
        let mut targets = Array2::from_elem((b, t), PAD_TOKEN);
        let mut mask = Tensor::zeros(&[b, t]);
        for row in 0..b {
            let seq = &self.sequences[self.order[self.cursor + row]];
            for col in 0..t {
                if col + 1 < seq.len() {
                    inputs[[row, col]] = seq[col];
                    targets[[row, col]] = seq[col + 1];
                    mask.set(&[row, col], 1.0).expect("mask index");
                }
            }
        }
        self.cursor += b;
        Some(LmBatch {
            inputs,
            targets,
            mask,
        })
    }
}

/// One preference pair before batching.
#[derive(Clone, Debug)]
pub struct DpoPair {
    pub prompt: Vec<usize>,
    pub chosen: Vec<usize>,
    pub rejected: Vec<usize>,
}

/// Chosen/rejected token batches of equal shape plus a single `[B, T]`
/// prompt mask: 0 over the prompt (and padding), 1 over response positions.
pub struct DpoBatch {
    pub chosen: Array2<usize>,
    pub rejected: Array2<usize>,
    pub prompt_mask: Tensor,
}

pub struct DpoDataset {
    pairs: Vec<DpoPair>,
    batch_size: usize,
    seq_len: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
}

impl DpoDataset {
    pub fn new(
        pairs: Vec<DpoPair>,
        batch_size: usize,
        seq_len: usize,
        shuffle: bool,
    ) -> MzResult<Self> {
        if batch_size == 0 || seq_len == 0 {
            return Err(MzError::InvalidArgument(format!(
                "dpo dataset: batch_size {} seq_len {}",
                batch_size, seq_len
            )));
        }
        if pairs.len() < batch_size {
            return Err(MzError::InvalidArgument(format!(
                "dpo dataset: {} pairs cannot fill a batch of {}",
                pairs.len(),
                batch_size
            )));
        }
        for (i, pair) in pairs.iter().enumerate() {
            if pair.prompt.len() >= seq_len {
                return Err(MzError::InvalidArgument(format!(
                    "dpo dataset: pair {} prompt length {} leaves no response room in {}",
                    i,
                    pair.prompt.len(),
                    seq_len
                )));
            }
        }
        let mut ds = Self {
            order: (0..pairs.len()).collect(),
            pairs,
            batch_size,
            seq_len,
            shuffle,
            cursor: 0,
        };
        ds.reset();
        Ok(ds)
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            rng::with_rng(|r| self.order.shuffle(r));
        }
    }

    pub fn has_next(&self) -> bool {
        self.cursor + self.batch_size <= self.order.len()
    }

    pub fn next_batch(&mut self) -> Option<DpoBatch> {
        if !self.has_next() {
            return None;
        }
        let (b, t) = (self.batch_size, self.seq_len);
        let mut chosen = Array2::from_elem((b, t), PAD_TOKEN);
        let mut rejected = Array2::from_elem((b, t), PAD_TOKEN);
        let mut prompt_mask = Tensor::zeros(&[b, t]);
        for row in 0..b {
            let pair = &self.pairs[self.order[self.cursor + row]];
            fill_row(&mut chosen, row, &pair.prompt, &pair.chosen, t);
            fill_row(&mut rejected, row, &pair.prompt, &pair.rejected, t);
            // The shared mask covers the longer response; the shorter one is
            // scored over padding there, which keeps the pair symmetric.
            let response_end = (pair.prompt.len() + pair.chosen.len().max(pair.rejected.len())).min(t);
            for col in pair.prompt.len()..response_end {
                prompt_mask.set(&[row, col], 1.0).expect("mask index");
            }
        }
        self.cursor += b;
        Some(DpoBatch {
            chosen,
            rejected,
            prompt_mask,
        })
    }
}

fn fill_row(out: &mut Array2<usize>, row: usize, prompt: &[usize], response: &[usize], t: usize) {
    for (col, &tok) in prompt.iter().chain(response.iter()).take(t).enumerate() {
        out[[row, col]] = tok;
    }
}

/// Selects the reward-normalization policy for a GRPO batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifierKind {
    Math,
    Logic,
    General,
}

/// `K` candidate batches for the same prompts, a `[B, K]` reward matrix and
/// the verifier tag. The prompt mask is shared by all candidates.
pub struct GrpoBatch {
    pub candidates: Vec<Array2<usize>>,
    pub prompt_mask: Tensor,
    pub rewards: Array2<f32>,
    pub verifier: VerifierKind,
}

impl GrpoBatch {
    pub fn validate(&self) -> MzResult<()> {
        let k = self.candidates.len();
        if k == 0 {
            return Err(MzError::InvalidArgument("grpo batch: no candidates".into()));
        }
        let dim = self.candidates[0].dim();
        if dim.0 == 0 {
            return Err(MzError::InvalidArgument("grpo batch: empty batch".into()));
        }
        for c in &self.candidates {
            if c.dim() != dim {
                return Err(MzError::shapes(
                    "grpo_batch",
                    &[c.dim().0, c.dim().1],
                    &[dim.0, dim.1],
                ));
            }
        }
        if self.prompt_mask.shape() != [dim.0, dim.1] {
            return Err(MzError::shapes(
                "grpo_batch",
                self.prompt_mask.shape(),
                &[dim.0, dim.1],
            ));
        }
        if self.rewards.dim() != (dim.0, k) {
            return Err(MzError::shapes(
                "grpo_batch",
                &[self.rewards.dim().0, self.rewards.dim().1],
                &[dim.0, k],
            ));
        }
        Ok(())
    }

    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Flattens to `[B*K, T]` rows with each sample's K candidates
    /// contiguous, the matching mask rows, and rewards in the same order.
    pub fn flattened(&self) -> MzResult<(Array2<usize>, Tensor, Vec<f32>)> {
        self.validate()?;
        let k = self.candidates.len();
        let (b, t) = self.candidates[0].dim();
        let mut ids = Array2::from_elem((b * k, t), PAD_TOKEN);
        let mut mask = Tensor::zeros(&[b * k, t]);
        let mut rewards = Vec::with_capacity(b * k);
        for sample in 0..b {
            for cand in 0..k {
                let row = sample * k + cand;
                for col in 0..t {
                    ids[[row, col]] = self.candidates[cand][[sample, col]];
                    mask.set(&[row, col], self.prompt_mask.get(&[sample, col])?)?;
                }
                rewards.push(self.rewards[[sample, cand]]);
            }
        }
        Ok((ids, mask, rewards))
    }
}
