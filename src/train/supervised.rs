//! Supervised pretraining / fine-tuning driver: batches from an
//! `LmDataset`, schedule-driven learning rate, global-norm clipping and
//! step-level telemetry.

use crate::autograd::ops as F;
use crate::data::LmDataset;
use crate::loss::causal_lm_loss;
use crate::models::DecoderModel;
use crate::optim::{clip_global_norm, LrSchedule, Optimizer};
use anyhow::Context;

#[derive(Clone, Copy, Debug)]
pub struct TrainReport {
    pub steps: usize,
    pub skipped_steps: usize,
    pub final_loss: f32,
    pub mean_loss: f32,
}

/// Owns the loop policy, not the model: clipping threshold and an optional
/// LR schedule queried before every optimizer step.
pub struct SupervisedTrainer {
    pub max_grad_norm: Option<f32>,
    pub schedule: Option<LrSchedule>,
}

impl SupervisedTrainer {
    pub fn new(max_grad_norm: Option<f32>, schedule: Option<LrSchedule>) -> Self {
        Self {
            max_grad_norm,
            schedule,
        }
    }

    pub fn run(
        &self,
        model: &DecoderModel,
        optimizer: &mut dyn Optimizer,
        dataset: &mut LmDataset,
        epochs: usize,
    ) -> anyhow::Result<TrainReport> {
        let mut step = 0usize;
        let mut skipped = 0usize;
        let mut total_loss = 0.0f32;
        let mut final_loss = f32::NAN;

        for epoch in 0..epochs {
            dataset.reset();
            while let Some(batch) = dataset.next_batch() {
                if let Some(schedule) = &self.schedule {
                    optimizer.set_lr(schedule.lr_at(step));
                }

                let out = model.forward(&batch.inputs).context("lm forward")?;
                let mut loss = causal_lm_loss(&out.logits, &batch.targets, Some(&batch.mask))?;
                if let Some(aux) = out.aux_loss {
                    loss = F::add(&loss, &aux)?;
                }

                optimizer.zero_grads();
                loss.backward()?;
                if let Some(max_norm) = self.max_grad_norm {
                    let norm = clip_global_norm(optimizer.parameters(), max_norm)?;
                    if !norm.is_finite() {
                        tracing::warn!(epoch, step, "skipping step on non-finite gradient norm");
                        optimizer.zero_grads();
                        skipped += 1;
                        step += 1;
                        continue;
                    }
                }
                optimizer.step()?;
                optimizer.zero_grads();

                final_loss = loss.item()?;
                total_loss += final_loss;
                step += 1;
                tracing::debug!(epoch, step, loss = final_loss, lr = optimizer.lr(), "lm step");
            }
        }

        let applied = step - skipped;
        Ok(TrainReport {
            steps: step,
            skipped_steps: skipped,
            final_loss,
            mean_loss: if applied > 0 {
                total_loss / applied as f32
            } else {
                f32::NAN
            },
        })
    }
}
