//! Group Relative Policy Optimization: K candidates per prompt, rewards
//! centered inside their group, PPO-style clipped surrogate against the
//! old-policy log-probs plus an entropy bonus.

use crate::autograd::{no_grad, ops as F, Variable};
use crate::data::{GrpoBatch, VerifierKind};
use crate::loss::{entropy, sequence_log_probs};
use crate::models::DecoderModel;
use crate::optim::{clip_global_norm, Optimizer};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use anyhow::Context;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Reward rescaling applied inside each group before mean-centering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardNorm {
    None,
    Standardize,
    MinMax,
    /// Standardize, then clip to +-3.
    StdClip,
}

impl VerifierKind {
    /// The normalization policy each verifier family uses.
    pub fn reward_norm(self) -> RewardNorm {
        match self {
            VerifierKind::Math => RewardNorm::StdClip,
            VerifierKind::Logic => RewardNorm::Standardize,
            VerifierKind::General => RewardNorm::None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrpoConfig {
    pub clip_eps: f32,
    pub entropy_coef: f32,
    pub group_size: usize,
    /// Update passes over the same batch while clipping preserves
    /// proximity to the collected old policy.
    pub epochs: usize,
    /// Rescale advantages to unit variance across the whole batch.
    pub normalize_advantages: bool,
}

impl Default for GrpoConfig {
    fn default() -> Self {
        Self {
            clip_eps: 0.2,
            entropy_coef: 0.01,
            group_size: 4,
            epochs: 2,
            normalize_advantages: false,
        }
    }
}

impl GrpoConfig {
    pub fn validate(&self) -> MzResult<()> {
        if !(0.0..1.0).contains(&self.clip_eps) || self.clip_eps == 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "grpo clip_eps {} outside (0, 1)",
                self.clip_eps
            )));
        }
        if self.entropy_coef < 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "grpo entropy_coef {} negative",
                self.entropy_coef
            )));
        }
        if self.group_size == 0 || self.epochs == 0 {
            return Err(MzError::InvalidArgument(format!(
                "grpo group_size {} epochs {}",
                self.group_size, self.epochs
            )));
        }
        Ok(())
    }
}

fn normalize_group(chunk: &[f32], norm: RewardNorm) -> Vec<f32> {
    match norm {
        RewardNorm::None => chunk.to_vec(),
        RewardNorm::Standardize | RewardNorm::StdClip => {
            let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
            let var =
                chunk.iter().map(|&r| (r - mean) * (r - mean)).sum::<f32>() / chunk.len() as f32;
            let std = var.sqrt() + 1e-6;
            chunk
                .iter()
                .map(|&r| {
                    let z = (r - mean) / std;
                    if norm == RewardNorm::StdClip {
                        z.clamp(-3.0, 3.0)
                    } else {
                        z
                    }
                })
                .collect()
        }
        RewardNorm::MinMax => {
            let min = chunk.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let span = max - min + 1e-6;
            chunk.iter().map(|&r| (r - min) / span).collect()
        }
    }
}

/// Group-relative advantages: rewards are normalized inside each group of
/// `group_size`, then mean-centered there, so every group sums to zero.
pub fn group_advantages(rewards: &[f32], group_size: usize, norm: RewardNorm) -> MzResult<Vec<f32>> {
    if group_size == 0 || rewards.is_empty() || rewards.len() % group_size != 0 {
        return Err(MzError::InvalidArgument(format!(
            "group_advantages: {} rewards not divisible into groups of {}",
            rewards.len(),
            group_size
        )));
    }
    let mut out = Vec::with_capacity(rewards.len());
    for chunk in rewards.chunks(group_size) {
        let tilde = normalize_group(chunk, norm);
        let mean = tilde.iter().sum::<f32>() / group_size as f32;
        out.extend(tilde.iter().map(|r| r - mean));
    }
    Ok(out)
}

/// Rescales to unit variance across the whole batch; group means stay zero.
pub fn normalize_advantages(advantages: &mut [f32]) {
    if advantages.is_empty() {
        return;
    }
    let n = advantages.len() as f32;
    let mean = advantages.iter().sum::<f32>() / n;
    let var = advantages.iter().map(|&a| (a - mean) * (a - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    if std > 1e-6 {
        for a in advantages.iter_mut() {
            *a /= std;
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GrpoStats {
    pub loss: f32,
    pub surrogate: f32,
    pub entropy: f32,
    /// Fraction of candidates whose ratio left the trust region.
    pub clip_fraction: f32,
    pub mean_ratio: f32,
}

/// Old-policy response log-probs for the same batch, collected with the
/// graph disabled.
pub fn collect_old_logps(
    model: &DecoderModel,
    ids: &Array2<usize>,
    response_mask: &Tensor,
) -> MzResult<Vec<f32>> {
    no_grad(|| {
        let (inputs, targets) = super::shift_targets(ids)?;
        let mask = super::shift_mask(response_mask)?;
        let out = model.forward(&inputs)?;
        Ok(sequence_log_probs(&out.logits, &targets, &mask)?
            .value()
            .to_vec())
    })
}

/// PPO-style clipped surrogate over sequence-level ratios, minus the
/// entropy bonus. `logits` come from the live policy; `targets` and
/// `response_mask` are already shifted.
pub fn grpo_loss(
    logits: &Variable,
    targets: &Array2<usize>,
    response_mask: &Tensor,
    old_logps: &[f32],
    advantages: &[f32],
    cfg: &GrpoConfig,
) -> MzResult<(Variable, GrpoStats)> {
    cfg.validate()?;
    let new_logps = sequence_log_probs(logits, targets, response_mask)?;
    let n = new_logps.shape()[0];
    if old_logps.len() != n || advantages.len() != n {
        return Err(MzError::shapes(
            "grpo_loss",
            &[old_logps.len(), advantages.len()],
            &[n, n],
        ));
    }

    let old = Variable::new(Tensor::from_vec(old_logps.to_vec(), &[n])?);
    let adv = Variable::new(Tensor::from_vec(advantages.to_vec(), &[n])?);
    let ratio = F::exp(&F::sub(&new_logps, &old)?)?;

    let unclipped = F::mul(&ratio, &adv)?;
    let clipped = F::mul(
        &F::clamp(&ratio, 1.0 - cfg.clip_eps, 1.0 + cfg.clip_eps)?,
        &adv,
    )?;
    let surrogate = F::mul_scalar(
        &F::mean(&F::minimum(&unclipped, &clipped)?, None, false)?,
        -1.0,
    )?;

    let ent = entropy(logits, Some(response_mask))?;
    let loss = F::sub(&surrogate, &F::mul_scalar(&ent, cfg.entropy_coef)?)?;

    let ratios = ratio.value().to_vec();
    let clip_hits = ratios
        .iter()
        .filter(|r| (**r - 1.0).abs() > cfg.clip_eps)
        .count();
    let stats = GrpoStats {
        loss: loss.item()?,
        surrogate: surrogate.item()?,
        entropy: ent.item()?,
        clip_fraction: clip_hits as f32 / n as f32,
        mean_ratio: ratios.iter().sum::<f32>() / n as f32,
    };
    Ok((loss, stats))
}

/// Outer GRPO loop: freeze a snapshot of log-probs, then run `epochs`
/// clipped update passes over the same batch.
pub struct GrpoTrainer {
    cfg: GrpoConfig,
}

impl GrpoTrainer {
    pub fn new(cfg: GrpoConfig) -> MzResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &GrpoConfig {
        &self.cfg
    }

    pub fn train_batch(
        &self,
        policy: &DecoderModel,
        optimizer: &mut dyn Optimizer,
        max_grad_norm: Option<f32>,
        batch: &GrpoBatch,
    ) -> anyhow::Result<GrpoStats> {
        let (ids, mask, rewards) = batch.flattened().context("flattening grpo batch")?;
        let mut advantages =
            group_advantages(&rewards, self.cfg.group_size, batch.verifier.reward_norm())?;
        if self.cfg.normalize_advantages {
            normalize_advantages(&mut advantages);
        }

        let old_logps = collect_old_logps(policy, &ids, &mask).context("old-policy pass")?;
        let (inputs, targets) = super::shift_targets(&ids)?;
        let shifted_mask = super::shift_mask(&mask)?;

        let mut last_stats = None;
        for epoch in 0..self.cfg.epochs {
            let out = policy.forward(&inputs).context("grpo policy forward")?;
            let (mut loss, stats) = grpo_loss(
                &out.logits,
                &targets,
                &shifted_mask,
                &old_logps,
                &advantages,
                &self.cfg,
            )?;
            if let Some(aux) = out.aux_loss {
                loss = F::add(&loss, &aux)?;
            }

            optimizer.zero_grads();
            loss.backward()?;
            if let Some(max_norm) = max_grad_norm {
                let norm = clip_global_norm(optimizer.parameters(), max_norm)?;
                if !norm.is_finite() {
                    tracing::warn!(epoch, "skipping grpo step on non-finite gradient norm");
                    optimizer.zero_grads();
                    continue;
                }
            }
            optimizer.step()?;
            optimizer.zero_grads();
            tracing::debug!(
                epoch,
                loss = stats.loss,
                clip_fraction = stats.clip_fraction,
                "grpo epoch"
            );
            last_stats = Some(stats);
        }
        last_stats.ok_or_else(|| {
            anyhow::anyhow!("grpo: every epoch was skipped on non-finite gradients")
        })
    }
}
