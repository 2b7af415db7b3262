//! Module system: trainable `Parameter` leaves, explicit registration with
//! duplicate rejection, and depth-first traversal over composed layers.

pub mod attention;
pub mod block;
pub mod embedding;
pub mod feedforward;
pub mod linear;
pub mod moe;
pub mod norm;
pub mod rope;

pub use attention::{KvCache, MultiHeadAttention};
pub use block::{DecoderBlock, FeedForwardKind};
pub use embedding::Embedding;
pub use feedforward::SwiGluFeedForward;
pub use linear::Linear;
pub use moe::{MoeConfig, MoeLayer, MoeStats};
pub use norm::{LayerNorm, RmsNorm};
pub use rope::RotaryEmbedding;

use crate::autograd::{ops as F, Variable};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use std::cell::{Cell, Ref};

/// Trainable leaf: a named variable with `requires_grad` on by default.
/// Clones share storage, so a handle registered in a `ParamSet` and kept as
/// a typed field update together.
#[derive(Clone)]
pub struct Parameter {
    var: Variable,
}

impl Parameter {
    pub fn new(name: &str, value: Tensor) -> Self {
        let var = Variable::with_grad(value);
        var.set_name(name);
        Self { var }
    }

    pub fn var(&self) -> &Variable {
        &self.var
    }

    pub fn value(&self) -> Ref<'_, Tensor> {
        self.var.value()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.var.shape()
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.var.grad()
    }

    pub fn clear_grad(&self) {
        self.var.clear_grad();
    }

    pub fn set_value(&self, value: Tensor) -> MzResult<()> {
        self.var.set_value(value)
    }

    pub fn update_value(&self, f: impl FnOnce(&mut Tensor)) {
        self.var.update_value(f);
    }

    /// Rescales the stored gradient in place (global-norm clipping).
    pub fn scale_grad(&self, factor: f32) {
        self.var.scale_grad(factor);
    }

    /// Disables gradient accumulation; the backward driver skips frozen
    /// leaves entirely.
    pub fn freeze(&self) {
        self.var.set_requires_grad(false);
    }

    pub fn unfreeze(&self) {
        self.var.set_requires_grad(true);
    }

    pub fn is_frozen(&self) -> bool {
        !self.var.requires_grad()
    }

    pub fn name(&self) -> String {
        self.var.name().unwrap_or_default()
    }

    pub fn same_as(&self, other: &Parameter) -> bool {
        self.var.same_as(&other.var)
    }
}

/// Ordered local registry: one entry per parameter, registration order
/// preserved, duplicate local names rejected.
#[derive(Default)]
pub struct ParamSet {
    entries: Vec<(String, Parameter)>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a parameter, returning a shared handle.
    pub fn register(&mut self, name: &str, value: Tensor) -> MzResult<Parameter> {
        self.register_param(name, Parameter::new(name, value))
    }

    pub fn register_param(&mut self, name: &str, param: Parameter) -> MzResult<Parameter> {
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(MzError::InvalidArgument(format!(
                "duplicate parameter name: {}",
                name
            )));
        }
        self.entries.push((name.to_string(), param.clone()));
        Ok(param)
    }

    pub fn entries(&self) -> &[(String, Parameter)] {
        &self.entries
    }
}

/// Composable unit: ordered local parameters plus ordered children and a
/// per-module training flag. Forward passes are inherent methods with each
/// layer's natural signature; this trait carries the uniform traversal
/// surface.
pub trait Module {
    fn local_parameters(&self) -> &[(String, Parameter)];

    fn children(&self) -> Vec<(String, &dyn Module)> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        Vec::new()
    }

    fn is_training(&self) -> bool;

    fn set_local_training(&mut self, training: bool);
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Depth-first, insertion-ordered walk yielding `(qualified_name, param)`.
/// Local parameters come before children at every level.
pub fn named_parameters(root: &dyn Module) -> Vec<(String, Parameter)> {
    fn walk(m: &dyn Module, prefix: &str, out: &mut Vec<(String, Parameter)>) {
        for (name, param) in m.local_parameters() {
            out.push((qualify(prefix, name), param.clone()));
        }
        for (name, child) in m.children() {
            walk(child, &qualify(prefix, &name), out);
        }
    }
    let mut out = Vec::new();
    walk(root, "", &mut out);
    out
}

pub fn parameters(root: &dyn Module) -> Vec<Parameter> {
    named_parameters(root).into_iter().map(|(_, p)| p).collect()
}

/// Same walk for submodules, `(qualified_name, module)` pairs.
pub fn named_submodules<'a>(root: &'a dyn Module) -> Vec<(String, &'a dyn Module)> {
    fn walk<'a>(m: &'a dyn Module, prefix: &str, out: &mut Vec<(String, &'a dyn Module)>) {
        for (name, child) in m.children() {
            let qualified = qualify(prefix, &name);
            out.push((qualified.clone(), child));
            walk(child, &qualified, out);
        }
    }
    let mut out = Vec::new();
    walk(root, "", &mut out);
    out
}

pub fn set_training(root: &mut dyn Module, training: bool) {
    root.set_local_training(training);
    for (_, child) in root.children_mut() {
        set_training(child, training);
    }
}

pub fn train(root: &mut dyn Module) {
    set_training(root, true);
}

pub fn eval(root: &mut dyn Module) {
    set_training(root, false);
}

/// Recursively clears every parameter gradient.
pub fn clear_grads(root: &dyn Module) {
    for (_, param) in named_parameters(root) {
        param.clear_grad();
    }
}

/// Traverses the tree, invoking `f` for this module and every submodule.
pub fn apply(root: &mut dyn Module, f: &mut dyn FnMut(&mut dyn Module)) {
    f(root);
    for (_, child) in root.children_mut() {
        apply(child, f);
    }
}

pub fn freeze(root: &dyn Module) {
    for (_, param) in named_parameters(root) {
        param.freeze();
    }
}

/// Copies every parameter value from `src` into `dst`. The two trees must
/// have identical qualified names and shapes (reference-policy setup).
pub fn copy_parameters(dst: &dyn Module, src: &dyn Module) -> MzResult<()> {
    let dst_params = named_parameters(dst);
    let src_params = named_parameters(src);
    if dst_params.len() != src_params.len() {
        return Err(MzError::InvalidArgument(format!(
            "copy_parameters: {} destination parameters vs {} source",
            dst_params.len(),
            src_params.len()
        )));
    }
    for ((dn, dp), (sn, sp)) in dst_params.iter().zip(src_params.iter()) {
        if dn != sn {
            return Err(MzError::InvalidArgument(format!(
                "copy_parameters: name mismatch {} vs {}",
                dn, sn
            )));
        }
        dp.set_value(sp.value().clone())?;
    }
    Ok(())
}

// --- initialization policies ---

pub mod init {
    use crate::tensor::Tensor;

    /// Kaiming-uniform: uniform in `[-b, b]` with `b = sqrt(6 / fan_in)`.
    /// Default for linear weights.
    pub fn kaiming_uniform(dims: &[usize], fan_in: usize) -> Tensor {
        let bound = (6.0 / fan_in as f32).sqrt();
        Tensor::rand_uniform(dims, -bound, bound)
    }

    /// Default for biases.
    pub fn zeros(dims: &[usize]) -> Tensor {
        Tensor::zeros(dims)
    }

    /// Normal(0, std); embeddings use the config's `initializer_range`.
    pub fn normal(dims: &[usize], std: f32) -> Tensor {
        let mut t = Tensor::randn(dims);
        t.scale_inplace(std);
        t
    }
}

// --- dropout ---

thread_local! {
    static DROPOUT_ENABLED: Cell<bool> = Cell::new(true);
}

/// Global determinism knob: disables dropout everywhere regardless of
/// per-module training mode.
pub fn set_dropout_enabled(enabled: bool) {
    DROPOUT_ENABLED.with(|d| d.set(enabled));
}

pub fn dropout_enabled() -> bool {
    DROPOUT_ENABLED.with(|d| d.get())
}

/// Inverted dropout layer; identity in eval mode.
pub struct Dropout {
    p: f32,
    training: bool,
}

impl Dropout {
    pub fn new(p: f32) -> MzResult<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(MzError::InvalidArgument(format!(
                "dropout probability {} outside [0, 1)",
                p
            )));
        }
        Ok(Self { p, training: true })
    }

    pub fn forward(&self, x: &Variable) -> MzResult<Variable> {
        F::dropout(x, self.p, self.training && dropout_enabled())
    }
}

impl Module for Dropout {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        &[]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
