//! Direct Preference Optimization: the policy under training is contrasted
//! against a frozen reference copy on chosen/rejected response pairs.

use crate::autograd::{no_grad, ops as F, Variable};
use crate::data::DpoBatch;
use crate::loss::sequence_log_probs;
use crate::models::DecoderModel;
use crate::nn;
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use anyhow::Context;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DpoConfig {
    pub beta: f32,
    pub label_smoothing: f32,
}

impl Default for DpoConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            label_smoothing: 0.0,
        }
    }
}

impl DpoConfig {
    pub fn validate(&self) -> MzResult<()> {
        if self.beta <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "dpo beta {} must be positive",
                self.beta
            )));
        }
        if !(0.0..0.5).contains(&self.label_smoothing) {
            return Err(MzError::InvalidArgument(format!(
                "dpo label smoothing {} outside [0, 0.5)",
                self.label_smoothing
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DpoStats {
    pub loss: f32,
    /// Fraction of pairs where the policy already prefers the chosen
    /// response.
    pub accuracy: f32,
    /// Mean `log p(chosen) - log p(rejected)` under the policy.
    pub margin: f32,
}

/// The DPO objective over per-sequence response log-probabilities `[B]`:
///
/// `delta = beta * ((pc - rc) - (pr - rr))`, `L = -log sigmoid(delta)`,
/// optionally label-smoothed.
pub fn dpo_loss(
    policy_chosen: &Variable,
    policy_rejected: &Variable,
    ref_chosen: &Variable,
    ref_rejected: &Variable,
    cfg: &DpoConfig,
) -> MzResult<(Variable, DpoStats)> {
    cfg.validate()?;
    let shape = policy_chosen.shape();
    for other in [policy_rejected, ref_chosen, ref_rejected] {
        if other.shape() != shape {
            return Err(MzError::shapes("dpo_loss", &shape, &other.shape()));
        }
    }

    let chosen_gain = F::sub(policy_chosen, ref_chosen)?;
    let rejected_gain = F::sub(policy_rejected, ref_rejected)?;
    let delta = F::mul_scalar(&F::sub(&chosen_gain, &rejected_gain)?, cfg.beta)?;

    let eps = cfg.label_smoothing;
    let per_pair = if eps > 0.0 {
        let pos = F::log_sigmoid(&delta)?;
        let neg = F::log_sigmoid(&F::neg(&delta)?)?;
        F::add(
            &F::mul_scalar(&pos, -(1.0 - eps))?,
            &F::mul_scalar(&neg, -eps)?,
        )?
    } else {
        F::neg(&F::log_sigmoid(&delta)?)?
    };
    let loss = F::mean(&per_pair, None, false)?;

    let (pc, pr) = (policy_chosen.value().to_vec(), policy_rejected.value().to_vec());
    let pairs = pc.len().max(1);
    let wins = pc.iter().zip(&pr).filter(|(c, r)| c > r).count();
    let margin = pc
        .iter()
        .zip(&pr)
        .map(|(c, r)| c - r)
        .sum::<f32>()
        / pairs as f32;
    let stats = DpoStats {
        loss: loss.item()?,
        accuracy: wins as f32 / pairs as f32,
        margin,
    };
    tracing::debug!(
        loss = stats.loss,
        accuracy = stats.accuracy,
        margin = stats.margin,
        "dpo loss"
    );
    Ok((loss, stats))
}

/// Owns the frozen reference policy: a weight copy of the policy taken at
/// construction, gradient-disabled and kept in eval mode.
pub struct DpoTrainer {
    cfg: DpoConfig,
    reference: DecoderModel,
}

impl DpoTrainer {
    pub fn new(policy: &DecoderModel, cfg: DpoConfig) -> MzResult<Self> {
        cfg.validate()?;
        let mut reference = DecoderModel::new(policy.config().clone())?;
        nn::copy_parameters(&reference, policy)?;
        nn::freeze(&reference);
        nn::eval(&mut reference);
        Ok(Self { cfg, reference })
    }

    pub fn config(&self) -> &DpoConfig {
        &self.cfg
    }

    pub fn reference(&self) -> &DecoderModel {
        &self.reference
    }

    /// Response log-probs for a `[B, T]` id batch under one model, scored
    /// over shifted targets with the prompt masked out.
    fn score(
        model: &DecoderModel,
        ids: &Array2<usize>,
        prompt_mask: &Tensor,
    ) -> MzResult<(Variable, Option<Variable>)> {
        let (inputs, targets) = super::shift_targets(ids)?;
        let mask = super::shift_mask(prompt_mask)?;
        let out = model.forward(&inputs)?;
        Ok((sequence_log_probs(&out.logits, &targets, &mask)?, out.aux_loss))
    }

    /// One loss evaluation: the caller runs backward, clipping and the
    /// optimizer. MoE aux losses from the policy passes ride along.
    pub fn step(
        &self,
        policy: &DecoderModel,
        batch: &DpoBatch,
    ) -> anyhow::Result<(Variable, DpoStats)> {
        let (pc, aux_chosen) = Self::score(policy, &batch.chosen, &batch.prompt_mask)
            .context("scoring chosen batch with policy")?;
        let (pr, aux_rejected) = Self::score(policy, &batch.rejected, &batch.prompt_mask)
            .context("scoring rejected batch with policy")?;
        let (rc, rr) = no_grad(|| -> MzResult<(Variable, Variable)> {
            let (rc, _) = Self::score(&self.reference, &batch.chosen, &batch.prompt_mask)?;
            let (rr, _) = Self::score(&self.reference, &batch.rejected, &batch.prompt_mask)?;
            Ok((rc, rr))
        })
        .context("scoring with frozen reference")?;

        let (mut loss, stats) = dpo_loss(&pc, &pr, &rc, &rr, &self.cfg)?;
        for aux in [aux_chosen, aux_rejected].into_iter().flatten() {
            loss = F::add(&loss, &aux)?;
        }
        Ok((loss, stats))
    }
}
