use super::{
    KvCache, Module, MoeLayer, MoeStats, MultiHeadAttention, ParamSet, Parameter, RmsNorm,
    SwiGluFeedForward,
};
use crate::autograd::{ops as F, Variable};
use crate::MzResult;

/// The feed-forward half of a block: dense SwiGLU or a routed expert pool.
pub enum FeedForwardKind {
    Dense(SwiGluFeedForward),
    Moe(MoeLayer),
}

impl Module for FeedForwardKind {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        match self {
            FeedForwardKind::Dense(ff) => ff.local_parameters(),
            FeedForwardKind::Moe(moe) => moe.local_parameters(),
        }
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        match self {
            FeedForwardKind::Dense(ff) => ff.children(),
            FeedForwardKind::Moe(moe) => moe.children(),
        }
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        match self {
            FeedForwardKind::Dense(ff) => ff.children_mut(),
            FeedForwardKind::Moe(moe) => moe.children_mut(),
        }
    }

    fn is_training(&self) -> bool {
        match self {
            FeedForwardKind::Dense(ff) => ff.is_training(),
            FeedForwardKind::Moe(moe) => moe.is_training(),
        }
    }

    fn set_local_training(&mut self, training: bool) {
        match self {
            FeedForwardKind::Dense(ff) => ff.set_local_training(training),
            FeedForwardKind::Moe(moe) => moe.set_local_training(training),
        }
    }
}

pub struct BlockOutput {
    pub hidden: Variable,
    pub aux_loss: Option<Variable>,
    pub moe_stats: Option<MoeStats>,
}

/// Pre-Norm decoder block:
/// `x := x + attn(norm(x)); x := x + mlp(norm(x))`.
pub struct DecoderBlock {
    attn_norm: RmsNorm,
    attn: MultiHeadAttention,
    mlp_norm: RmsNorm,
    mlp: FeedForwardKind,
    params: ParamSet,
    training: bool,
}

impl DecoderBlock {
    pub fn new(
        attn: MultiHeadAttention,
        mlp: FeedForwardKind,
        hidden_size: usize,
        norm_eps: f32,
    ) -> MzResult<Self> {
        Ok(Self {
            attn_norm: RmsNorm::new(hidden_size, norm_eps)?,
            attn,
            mlp_norm: RmsNorm::new(hidden_size, norm_eps)?,
            mlp,
            params: ParamSet::new(),
            training: true,
        })
    }

    pub fn forward(
        &self,
        x: &Variable,
        start_pos: usize,
        cache: Option<&mut KvCache>,
    ) -> MzResult<BlockOutput> {
        let attn_out = self.attn.forward(&self.attn_norm.forward(x)?, start_pos, cache)?;
        let h = F::add(x, &attn_out)?;

        let normed = self.mlp_norm.forward(&h)?;
        let (mlp_out, aux_loss, moe_stats) = match &self.mlp {
            FeedForwardKind::Dense(ff) => (ff.forward(&normed)?, None, None),
            FeedForwardKind::Moe(moe) => {
                let out = moe.forward(&normed)?;
                (out.hidden, out.aux_loss, Some(out.stats))
            }
        };

        Ok(BlockOutput {
            hidden: F::add(&h, &mlp_out)?,
            aux_loss,
            moe_stats,
        })
    }
}

impl Module for DecoderBlock {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("attn_norm".to_string(), &self.attn_norm as &dyn Module),
            ("attn".to_string(), &self.attn as &dyn Module),
            ("mlp_norm".to_string(), &self.mlp_norm as &dyn Module),
            ("mlp".to_string(), &self.mlp as &dyn Module),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        vec![
            ("attn_norm".to_string(), &mut self.attn_norm as &mut dyn Module),
            ("attn".to_string(), &mut self.attn as &mut dyn Module),
            ("mlp_norm".to_string(), &mut self.mlp_norm as &mut dyn Module),
            ("mlp".to_string(), &mut self.mlp as &mut dyn Module),
        ]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
