use super::{init, Module, ParamSet, Parameter};
use crate::autograd::{ops as F, Variable};
use crate::{MzError, MzResult};

/// Affine projection `y = x W (+ b)` with weight `[in, out]`; the matmul
/// broadcasts over any leading batch/time dims of `x`.
pub struct Linear {
    weight: Parameter,
    bias: Option<Parameter>,
    params: ParamSet,
    training: bool,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> MzResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(MzError::InvalidArgument(format!(
                "linear: zero-sized dimensions ({} -> {})",
                in_features, out_features
            )));
        }
        let mut params = ParamSet::new();
        let weight = params.register(
            "weight",
            init::kaiming_uniform(&[in_features, out_features], in_features),
        )?;
        let bias = if bias {
            Some(params.register("bias", init::zeros(&[out_features]))?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            params,
            training: true,
            in_features,
            out_features,
        })
    }

    pub fn forward(&self, x: &Variable) -> MzResult<Variable> {
        let mut y = F::matmul(x, self.weight.var())?;
        if let Some(b) = &self.bias {
            y = F::add(&y, b.var())?;
        }
        Ok(y)
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for Linear {
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
