use super::{Linear, Module, ParamSet, Parameter};
use crate::autograd::{ops as F, Variable};
use crate::MzResult;

/// Gated feed-forward `down(swish(gate(x)) * up(x))`; all three projections
/// are bias-free.
pub struct SwiGluFeedForward {
    gate: Linear,
    up: Linear,
    down: Linear,
    params: ParamSet,
    training: bool,
}

impl SwiGluFeedForward {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> MzResult<Self> {
        Ok(Self {
            gate: Linear::new(hidden_size, intermediate_size, false)?,
            up: Linear::new(hidden_size, intermediate_size, false)?,
            down: Linear::new(intermediate_size, hidden_size, false)?,
            params: ParamSet::new(),
            training: true,
        })
    }

    pub fn forward(&self, x: &Variable) -> MzResult<Variable> {
        let gated = F::swish(&self.gate.forward(x)?)?;
        let lifted = self.up.forward(x)?;
        self.down.forward(&F::mul(&gated, &lifted)?)
    }
}

impl Module for SwiGluFeedForward {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("gate".to_string(), &self.gate as &dyn Module),
            ("up".to_string(), &self.up as &dyn Module),
            ("down".to_string(), &self.down as &dyn Module),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        vec![
            ("gate".to_string(), &mut self.gate as &mut dyn Module),
            ("up".to_string(), &mut self.up as &mut dyn Module),
            ("down".to_string(), &mut self.down as &mut dyn Module),
        ]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
