use super::{Module, ParamSet, Parameter};
use crate::autograd::{ops as F, Variable};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};

/// RMS normalization along the feature axis:
/// `y = x / sqrt(mean(x^2) + eps) * weight`.
pub struct RmsNorm {
    weight: Parameter,
    eps: f32,
    params: ParamSet,
    training: bool,
}

impl RmsNorm {
    pub const DEFAULT_EPS: f32 = 1e-6;

    pub fn new(dim: usize, eps: f32) -> MzResult<Self> {
        if dim == 0 || eps <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "rmsnorm: dim {} eps {}",
                dim, eps
            )));
        }
        let mut params = ParamSet::new();
        let weight = params.register("weight", Tensor::ones(&[dim]))?;
        Ok(Self {
            weight,
            eps,
            params,
            training: true,
        })
    }

    pub fn forward(&self, x: &Variable) -> MzResult<Variable> {
        let x2 = F::mul(x, x)?;
        let ms = F::mean(&x2, Some(-1), true)?;
        let rms = F::sqrt(&F::add_scalar(&ms, self.eps)?)?;
        F::mul(&F::div(x, &rms)?, self.weight.var())
    }
}

impl Module for RmsNorm {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Standard mean/variance normalization with learned gamma and beta.
pub struct LayerNorm {
    gamma: Parameter,
    beta: Parameter,
    eps: f32,
    params: ParamSet,
    training: bool,
}

impl LayerNorm {
    pub const DEFAULT_EPS: f32 = 1e-5;

    pub fn new(dim: usize, eps: f32) -> MzResult<Self> {
        if dim == 0 || eps <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "layernorm: dim {} eps {}",
                dim, eps
            )));
        }
        let mut params = ParamSet::new();
        let gamma = params.register("gamma", Tensor::ones(&[dim]))?;
        let beta = params.register("beta", Tensor::zeros(&[dim]))?;
        Ok(Self {
            gamma,
            beta,
            eps,
            params,
            training: true,
        })
    }

    pub fn forward(&self, x: &Variable) -> MzResult<Variable> {
        let mu = F::mean(x, Some(-1), true)?;
        let centered = F::sub(x, &mu)?;
        let var = F::mean(&F::mul(&centered, &centered)?, Some(-1), true)?;
        let std = F::sqrt(&F::add_scalar(&var, self.eps)?)?;
        let normed = F::div(&centered, &std)?;
        F::add(&F::mul(&normed, self.gamma.var())?, self.beta.var())
    }
}

impl Module for LayerNorm {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
