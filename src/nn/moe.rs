//! Mixture-of-experts feed-forward: a noisy top-k router gates a pool of
//! narrow GELU experts. Dispatch is batch-parallel with weight masks, so
//! the whole computation stays on the autograd graph and gradients reach
//! both the router and every selected expert.

use super::{Linear, Module, ParamSet, Parameter};
use crate::autograd::{ops as F, Variable};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoeConfig {
    pub num_experts: usize,
    pub top_k: usize,
    /// Expert intermediate width, narrower than the dense feed-forward.
    pub hidden_dim: usize,
    /// Gaussian routing-noise factor applied to logits during training.
    pub noise_std: f32,
    pub aux_loss_coef: f32,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_experts: 4,
            top_k: 2,
            hidden_dim: 128,
            noise_std: 0.1,
            aux_loss_coef: 0.01,
        }
    }
}

impl MoeConfig {
    pub fn validate(&self) -> MzResult<()> {
        if self.num_experts == 0 || self.hidden_dim == 0 {
            return Err(MzError::ConfigValidation(format!(
                "moe: num_experts {} hidden_dim {}",
                self.num_experts, self.hidden_dim
            )));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(MzError::InvalidArgument(format!(
                "moe: top_k {} outside 1..={}",
                self.top_k, self.num_experts
            )));
        }
        if self.noise_std < 0.0 || self.aux_loss_coef < 0.0 {
            return Err(MzError::ConfigValidation(format!(
                "moe: negative noise_std {} or aux_loss_coef {}",
                self.noise_std, self.aux_loss_coef
            )));
        }
        Ok(())
    }
}

/// Bias-free two-layer GELU MLP, one per expert.
pub struct Expert {
    w1: Linear,
    w2: Linear,
    params: ParamSet,
    training: bool,
}

impl Expert {
    fn new(input_dim: usize, hidden_dim: usize, output_dim: usize) -> MzResult<Self> {
        Ok(Self {
            w1: Linear::new(input_dim, hidden_dim, false)?,
            w2: Linear::new(hidden_dim, output_dim, false)?,
            params: ParamSet::new(),
            training: true,
        })
    }

    fn forward(&self, x: &Variable) -> MzResult<Variable> {
        self.w2.forward(&F::gelu(&self.w1.forward(x)?)?)
    }
}

impl Module for Expert {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("w1".to_string(), &self.w1 as &dyn Module),
            ("w2".to_string(), &self.w2 as &dyn Module),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        vec![
            ("w1".to_string(), &mut self.w1 as &mut dyn Module),
            ("w2".to_string(), &mut self.w2 as &mut dyn Module),
        ]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Load-balance telemetry for one forward pass. Importance sums post-top-k
/// gate weights per expert; load counts routed tokens. Tokens later zeroed
/// by dropout still count toward both.
#[derive(Clone, Debug)]
pub struct MoeStats {
    pub importance: Vec<f32>,
    pub load: Vec<usize>,
}

pub struct MoeOutput {
    pub hidden: Variable,
    /// `coef * (CV(importance)^2 + CV(load)^2)`; present in training only.
    pub aux_loss: Option<Variable>,
    pub stats: MoeStats,
    /// Post-top-k gate weights `[B, T, E]`; each token's selected weights
    /// sum to 1.
    pub gates: Tensor,
}

pub struct MoeLayer {
    router: Linear,
    experts: Vec<Expert>,
    cfg: MoeConfig,
    input_dim: usize,
    params: ParamSet,
    training: bool,
}

impl MoeLayer {
    pub fn new(input_dim: usize, output_dim: usize, cfg: MoeConfig) -> MzResult<Self> {
        cfg.validate()?;
        let router = Linear::new(input_dim, cfg.num_experts, false)?;
        let experts = (0..cfg.num_experts)
            .map(|_| Expert::new(input_dim, cfg.hidden_dim, output_dim))
            .collect::<MzResult<Vec<_>>>()?;
        Ok(Self {
            router,
            experts,
            cfg,
            input_dim,
            params: ParamSet::new(),
            training: true,
        })
    }

    /// Top-k indices per token by descending logit, ties to the lower index.
    fn select_top_k(&self, logits: &Tensor) -> MzResult<(Tensor, Vec<usize>)> {
        let shape = logits.shape().to_vec();
        let experts = self.cfg.num_experts;
        let tokens = logits.len() / experts;
        let flat = logits.reshape(&[tokens, experts])?;
        let mut selected = Tensor::zeros(&[tokens, experts]);
        let mut load = vec![0usize; experts];
        for row in 0..tokens {
            let mut order: Vec<usize> = (0..experts).collect();
            order.sort_by(|&i, &j| {
                let (a, b) = (
                    flat.get(&[row, i]).unwrap_or(f32::NEG_INFINITY),
                    flat.get(&[row, j]).unwrap_or(f32::NEG_INFINITY),
                );
                b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
            });
            for &e in order.iter().take(self.cfg.top_k) {
                selected.set(&[row, e], 1.0)?;
                load[e] += 1;
            }
        }
        Ok((selected.reshape(&shape)?, load))
    }

    pub fn forward(&self, x: &Variable) -> MzResult<MoeOutput> {
        let shape = x.shape();
        if shape.len() != 3 || shape[2] != self.input_dim {
            return Err(MzError::shapes("moe", &shape, &[0, 0, self.input_dim]));
        }
        let (batch, len) = (shape[0], shape[1]);
        let experts = self.cfg.num_experts;

        let mut logits = self.router.forward(x)?;
        if self.training && self.cfg.noise_std > 0.0 {
            let mut noise = Tensor::randn(&[batch, len, experts]);
            noise.scale_inplace(self.cfg.noise_std);
            logits = F::add(&logits, &Variable::new(noise))?;
        }

        // Routing decisions are made on values; the gate weights stay
        // differentiable through the masked softmax over selected logits.
        let (selected, load) = self.select_top_k(&logits.value())?;
        let unselected = selected.map(|s| 1.0 - s);
        let gates = F::softmax(&F::masked_fill(&logits, &unselected, f32::NEG_INFINITY)?, -1)?;

        let mut combined: Option<Variable> = None;
        for (e, expert) in self.experts.iter().enumerate() {
            if load[e] == 0 {
                // All-zero mask: this expert contributes nothing this step.
                continue;
            }
            let gate_e = F::narrow(&gates, -1, e, 1)?;
            let term = F::mul(&gate_e, &expert.forward(x)?)?;
            combined = Some(match combined {
                Some(acc) => F::add(&acc, &term)?,
                None => term,
            });
        }
        let hidden = combined.ok_or_else(|| {
            MzError::InvalidArgument("moe: no expert received any token".into())
        })?;

        let gates_flat = F::reshape(&gates, &[batch * len, experts])?;
        let importance = F::sum(&gates_flat, Some(0), false)?;
        let stats = MoeStats {
            importance: importance.value().to_vec(),
            load: load.clone(),
        };

        let aux_loss = if self.training {
            let mean = F::mean(&importance, None, false)?;
            let centered = F::sub(&importance, &mean)?;
            let var = F::mean(&F::mul(&centered, &centered)?, None, false)?;
            let cv2 = F::div(&var, &F::add_scalar(&F::mul(&mean, &mean)?, 1e-6)?)?;
            let load_f32: Vec<f32> = load.iter().map(|&c| c as f32).collect();
            let load_cv2 = cv_squared(&load_f32);
            Some(F::mul_scalar(&F::add_scalar(&cv2, load_cv2)?, self.cfg.aux_loss_coef)?)
        } else {
            None
        };

        let gates_snapshot = gates.value().clone();
        Ok(MoeOutput {
            hidden,
            aux_loss,
            stats,
            gates: gates_snapshot,
        })
    }

    pub fn config(&self) -> &MoeConfig {
        &self.cfg
    }
}

/// Squared coefficient of variation over a slice.
fn cv_squared(xs: &[f32]) -> f32 {
    if xs.is_empty() {
        return 0.0;
    }
    let mean = xs.iter().sum::<f32>() / xs.len() as f32;
    if mean.abs() < 1e-6 {
        return 0.0;
    }
    let var = xs.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / xs.len() as f32;
    var / (mean * mean)
}

impl Module for MoeLayer {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        let mut out: Vec<(String, &dyn Module)> =
            vec![("router".to_string(), &self.router as &dyn Module)];
        for (i, e) in self.experts.iter().enumerate() {
            out.push((format!("expert{}", i), e as &dyn Module));
        }
        out
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        let mut out: Vec<(String, &mut dyn Module)> =
            vec![("router".to_string(), &mut self.router as &mut dyn Module)];
        for (i, e) in self.experts.iter_mut().enumerate() {
            out.push((format!("expert{}", i), e as &mut dyn Module));
        }
        out
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
