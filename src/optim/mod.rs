//! Optimizers, global-norm gradient clipping and LR schedules. NaN or Inf
//! in gradients is never fatal here: it surfaces as a `tracing` warning and
//! a non-finite norm so the training driver can decide to skip the step.

use crate::nn::Parameter;
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use serde::{Deserialize, Serialize};

pub trait Optimizer {
    /// Applies one update to every parameter that accumulated a gradient.
    fn step(&mut self) -> MzResult<()>;

    fn set_lr(&mut self, lr: f32);

    fn lr(&self) -> f32;

    fn parameters(&self) -> &[Parameter];

    fn zero_grads(&self) {
        for p in self.parameters() {
            p.clear_grad();
        }
    }
}

/// Plain stochastic gradient descent.
pub struct Sgd {
    params: Vec<Parameter>,
    lr: f32,
}

impl Sgd {
    pub fn new(params: Vec<Parameter>, lr: f32) -> MzResult<Self> {
        if lr <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "learning rate {} must be positive",
                lr
            )));
        }
        Ok(Self { params, lr })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> MzResult<()> {
        for p in &self.params {
            let Some(g) = p.grad() else { continue };
            let mut result = Ok(());
            p.update_value(|v| result = v.add_scaled_inplace(&g, -self.lr));
            result?;
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    pub fn validate(&self) -> MzResult<()> {
        if self.lr <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "learning rate {} must be positive",
                self.lr
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(MzError::InvalidArgument(format!(
                "adam betas ({}, {}) must lie in [0, 1)",
                self.beta1, self.beta2
            )));
        }
        if self.eps <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "adam eps {} must be positive",
                self.eps
            )));
        }
        Ok(())
    }
}

struct AdamState {
    m: Tensor,
    v: Tensor,
}

/// Adam with bias-corrected first and second moments.
pub struct Adam {
    params: Vec<Parameter>,
    cfg: AdamConfig,
    state: Vec<AdamState>,
    t: u32,
}

impl Adam {
    pub fn new(params: Vec<Parameter>, lr: f32) -> MzResult<Self> {
        Self::with_config(
            params,
            AdamConfig {
                lr,
                ..AdamConfig::default()
            },
        )
    }

    pub fn with_config(params: Vec<Parameter>, cfg: AdamConfig) -> MzResult<Self> {
        cfg.validate()?;
        let state = params
            .iter()
            .map(|p| AdamState {
                m: Tensor::zeros(&p.shape()),
                v: Tensor::zeros(&p.shape()),
            })
            .collect();
        Ok(Self {
            params,
            cfg,
            state,
            t: 0,
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self) -> MzResult<()> {
        self.t += 1;
        let bc1 = 1.0 - self.cfg.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.cfg.beta2.powi(self.t as i32);
        for (p, s) in self.params.iter().zip(self.state.iter_mut()) {
            let Some(g) = p.grad() else { continue };
            if !g.all_finite() {
                tracing::warn!(param = %p.name(), "non-finite gradient entering adam update");
            }
            s.m.scale_inplace(self.cfg.beta1);
            s.m.add_scaled_inplace(&g, 1.0 - self.cfg.beta1)?;
            s.v.scale_inplace(self.cfg.beta2);
            s.v.add_scaled_inplace(&g.mul_t(&g)?, 1.0 - self.cfg.beta2)?;

            let m_hat = s.m.mul_scalar(1.0 / bc1);
            let v_hat = s.v.mul_scalar(1.0 / bc2);
            let update = m_hat
                .div_t(&v_hat.sqrt().add_scalar(self.cfg.eps))?
                .mul_scalar(self.cfg.lr);
            let mut result = Ok(());
            p.update_value(|v| result = v.sub_assign_t(&update));
            result?;
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f32) {
        self.cfg.lr = lr;
    }

    fn lr(&self) -> f32 {
        self.cfg.lr
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }
}

/// Rescales all gradients so their combined L2 norm is at most `max_norm`;
/// returns the pre-clip norm. A non-finite norm leaves the gradients
/// untouched and is reported through `tracing::warn!`; the caller inspects
/// the returned value and decides whether to skip the step.
pub fn clip_global_norm(params: &[Parameter], max_norm: f32) -> MzResult<f32> {
    if max_norm <= 0.0 {
        return Err(MzError::InvalidArgument(format!(
            "max_norm {} must be positive",
            max_norm
        )));
    }
    let mut total_sq = 0.0f32;
    for p in params {
        if let Some(g) = p.grad() {
            total_sq += g.iter().map(|&v| v * v).sum::<f32>();
        }
    }
    let total = total_sq.sqrt();
    if !total.is_finite() {
        tracing::warn!(total_norm = total, "non-finite gradient norm; clip skipped");
        return Ok(total);
    }
    if total > max_norm {
        let scale = max_norm / (total + 1e-6);
        for p in params {
            p.scale_grad(scale);
        }
    }
    Ok(total)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum DecayKind {
    None,
    Linear,
    Cosine,
}

/// Linear warmup to `base_lr`, then optional decay to zero over the
/// remaining steps. Queried per optimizer step and written back via
/// `Optimizer::set_lr`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub decay: DecayKind,
}

impl LrSchedule {
    pub fn new(
        base_lr: f32,
        warmup_steps: usize,
        total_steps: usize,
        decay: DecayKind,
    ) -> MzResult<Self> {
        if base_lr <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "base_lr {} must be positive",
                base_lr
            )));
        }
        if total_steps == 0 || warmup_steps > total_steps {
            return Err(MzError::InvalidArgument(format!(
                "schedule: warmup {} vs total {}",
                warmup_steps, total_steps
            )));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            total_steps,
            decay,
        })
    }

    /// Learning rate for a 0-based step index.
    pub fn lr_at(&self, step: usize) -> f32 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * (step + 1) as f32 / self.warmup_steps as f32;
        }
        let span = (self.total_steps - self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f32 / span as f32).clamp(0.0, 1.0);
        match self.decay {
            DecayKind::None => self.base_lr,
            DecayKind::Linear => self.base_lr * (1.0 - progress),
            DecayKind::Cosine => {
                self.base_lr * 0.5 * (1.0 + (std::f32::consts::PI * progress).cos())
            }
        }
    }
}
