//! Decoder-only language model assembled from the transformer blocks, plus
//! weight checkpointing over the module tree.

use crate::autograd::{no_grad, ops as F, Variable};
use crate::nn::{
    self, DecoderBlock, Embedding, FeedForwardKind, KvCache, Linear, Module, MoeConfig,
    MultiHeadAttention, Parameter, RmsNorm, SwiGluFeedForward,
};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub max_seq_len: usize,
    pub rope_base: f32,
    pub rms_norm_eps: f32,
    pub dropout: f32,
    /// GPT-1 class models learn absolute positions in the embedding;
    /// LLaMA/Qwen-style decoders leave this off and rely on RoPE.
    pub learned_pos: bool,
    pub initializer_range: f32,
    pub moe: Option<MoeConfig>,
}

impl ModelConfig {
    pub fn new(vocab_size: usize, hidden_size: usize, num_layers: usize, num_heads: usize) -> Self {
        Self {
            vocab_size,
            hidden_size,
            num_layers,
            num_heads,
            intermediate_size: hidden_size * 4,
            max_seq_len: 512,
            rope_base: 10_000.0,
            rms_norm_eps: RmsNorm::DEFAULT_EPS,
            dropout: 0.0,
            learned_pos: false,
            initializer_range: 0.02,
            moe: None,
        }
    }

    pub fn validate(&self) -> MzResult<()> {
        if self.vocab_size == 0 {
            return Err(MzError::ConfigValidation("vocab_size is zero".into()));
        }
        if self.num_layers == 0 {
            return Err(MzError::ConfigValidation("num_layers is zero".into()));
        }
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(MzError::ConfigValidation(format!(
                "hidden_size {} % num_heads {} != 0",
                self.hidden_size, self.num_heads
            )));
        }
        if self.intermediate_size == 0 {
            return Err(MzError::ConfigValidation("intermediate_size is zero".into()));
        }
        if self.max_seq_len == 0 {
            return Err(MzError::ConfigValidation("max_seq_len is zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(MzError::ConfigValidation(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        if self.initializer_range <= 0.0 {
            return Err(MzError::ConfigValidation(format!(
                "initializer_range {} must be positive",
                self.initializer_range
            )));
        }
        if let Some(moe) = &self.moe {
            moe.validate()?;
        }
        Ok(())
    }
}

pub struct ModelOutput {
    pub logits: Variable,
    /// Summed MoE load-balance loss across layers; absent for dense models
    /// and in eval mode.
    pub aux_loss: Option<Variable>,
}

/// Estado de decodificação incremental: one KV cache per layer plus the
/// absolute position cursor.
pub struct DecoderState {
    caches: Vec<KvCache>,
    pos: usize,
}

impl DecoderState {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        for cache in &mut self.caches {
            cache.reset();
        }
    }
}

/// Pre-Norm decoder stack: embedding, blocks, final norm, output projection.
pub struct DecoderModel {
    cfg: ModelConfig,
    embedding: Embedding,
    blocks: Vec<DecoderBlock>,
    norm: RmsNorm,
    lm_head: Linear,
    training: bool,
}

impl DecoderModel {
    pub fn new(cfg: ModelConfig) -> MzResult<Self> {
        cfg.validate()?;
        let embedding = Embedding::new(
            cfg.vocab_size,
            cfg.hidden_size,
            cfg.learned_pos.then_some(cfg.max_seq_len),
            cfg.dropout,
            cfg.initializer_range,
        )?;
        let mut blocks = Vec::with_capacity(cfg.num_layers);
        for _ in 0..cfg.num_layers {
            let attn =
                MultiHeadAttention::new(cfg.hidden_size, cfg.num_heads, cfg.rope_base, cfg.dropout)?;
            let mlp = match &cfg.moe {
                Some(moe_cfg) => FeedForwardKind::Moe(nn::MoeLayer::new(
                    cfg.hidden_size,
                    cfg.hidden_size,
                    moe_cfg.clone(),
                )?),
                None => {
                    FeedForwardKind::Dense(SwiGluFeedForward::new(cfg.hidden_size, cfg.intermediate_size)?)
                }
            };
            blocks.push(DecoderBlock::new(attn, mlp, cfg.hidden_size, cfg.rms_norm_eps)?);
        }
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps)?;
        let lm_head = Linear::new(cfg.hidden_size, cfg.vocab_size, false)?;
        Ok(Self {
            cfg,
            embedding,
            blocks,
            norm,
            lm_head,
            training: true,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Full-sequence training forward: `[B, T]` token IDs to `[B, T, vocab]`
    /// logits, with the per-layer MoE aux losses summed alongside.
    pub fn forward(&self, ids: &Array2<usize>) -> MzResult<ModelOutput> {
        let mut hidden = self.embedding.forward(ids, 0)?;
        let mut aux_loss: Option<Variable> = None;
        for block in &self.blocks {
            let out = block.forward(&hidden, 0, None)?;
            hidden = out.hidden;
            if let Some(a) = out.aux_loss {
                aux_loss = Some(match aux_loss {
                    Some(total) => F::add(&total, &a)?,
                    None => a,
                });
            }
        }
        let logits = self.lm_head.forward(&self.norm.forward(&hidden)?)?;
        Ok(ModelOutput { logits, aux_loss })
    }

    pub fn new_state(&self, batch: usize, capacity: usize) -> DecoderState {
        let head_dim = self.cfg.hidden_size / self.cfg.num_heads;
        DecoderState {
            caches: (0..self.cfg.num_layers)
                .map(|_| KvCache::new(batch, self.cfg.num_heads, capacity, head_dim))
                .collect(),
            pos: 0,
        }
    }

    /// Incremental forward: appends `ids` at the state's cursor, reading the
    /// accumulated K/V from the per-layer caches. Eval-only semantics.
    pub fn forward_cached(&self, ids: &Array2<usize>, state: &mut DecoderState) -> MzResult<Variable> {
        let start_pos = state.pos;
        let len = ids.dim().1;
        let mut hidden = self.embedding.forward(ids, start_pos)?;
        for (block, cache) in self.blocks.iter().zip(state.caches.iter_mut()) {
            hidden = block.forward(&hidden, start_pos, Some(cache))?.hidden;
        }
        state.pos += len;
        self.lm_head.forward(&self.norm.forward(&hidden)?)
    }

    /// Greedy decoding from a prompt, one token at a time through the cache.
    pub fn greedy_generate(&self, prompt: &[usize], max_new_tokens: usize) -> MzResult<Vec<usize>> {
        if prompt.is_empty() {
            return Err(MzError::InvalidArgument("generate: empty prompt".into()));
        }
        no_grad(|| {
            let mut state = self.new_state(1, prompt.len() + max_new_tokens);
            let mut out = prompt.to_vec();
            let prompt_ids =
                Array2::from_shape_vec((1, prompt.len()), prompt.to_vec()).expect("prompt shape");
            let mut logits = self.forward_cached(&prompt_ids, &mut state)?;
            for _ in 0..max_new_tokens {
                let last = logits.value().narrow(1, logits.shape()[1] - 1, 1)?;
                let next = argmax_last(&last);
                out.push(next);
                let step = Array2::from_shape_vec((1, 1), vec![next]).expect("step shape");
                logits = self.forward_cached(&step, &mut state)?;
            }
            Ok(out)
        })
    }
}

fn argmax_last(logits: &Tensor) -> usize {
    let flat = logits.to_vec();
    let mut best = 0usize;
    for (i, &v) in flat.iter().enumerate() {
        if v > flat[best] {
            best = i;
        }
    }
    best % logits.shape()[logits.ndim() - 1]
}

impl Module for DecoderModel {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        &[]
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        let mut out: Vec<(String, &dyn Module)> =
            vec![("embedding".to_string(), &self.embedding as &dyn Module)];
        for (i, block) in self.blocks.iter().enumerate() {
            out.push((format!("block{}", i), block as &dyn Module));
        }
        out.push(("norm".to_string(), &self.norm as &dyn Module));
        out.push(("lm_head".to_string(), &self.lm_head as &dyn Module));
        out
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        let mut out: Vec<(String, &mut dyn Module)> =
            vec![("embedding".to_string(), &mut self.embedding as &mut dyn Module)];
        for (i, block) in self.blocks.iter_mut().enumerate() {
            out.push((format!("block{}", i), block as &mut dyn Module));
        }
        out.push(("norm".to_string(), &mut self.norm as &mut dyn Module));
        out.push(("lm_head".to_string(), &mut self.lm_head as &mut dyn Module));
        out
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}

// --- weight checkpointing ---

#[derive(Serialize, Deserialize)]
struct WeightRecord {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Writes every named parameter to a JSON map. The on-disk layout is a
/// convenience, not a stability contract.
pub fn save_weights(module: &dyn Module, path: &Path) -> MzResult<()> {
    let map: BTreeMap<String, WeightRecord> = nn::named_parameters(module)
        .into_iter()
        .map(|(name, p)| {
            let value = p.value();
            (
                name,
                WeightRecord {
                    shape: value.shape().to_vec(),
                    data: value.to_vec(),
                },
            )
        })
        .collect();
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &map)?;
    Ok(())
}

/// Loads parameter values by qualified name; every parameter in the tree
/// must be present with a matching shape.
pub fn load_weights(module: &dyn Module, path: &Path) -> MzResult<()> {
    let file = File::open(path)?;
    let map: BTreeMap<String, WeightRecord> = serde_json::from_reader(BufReader::new(file))?;
    for (name, param) in nn::named_parameters(module) {
        let record = map.get(&name).ok_or_else(|| {
            MzError::InvalidArgument(format!("checkpoint missing parameter {}", name))
        })?;
        param.set_value(Tensor::from_vec(record.data.clone(), &record.shape)?)?;
    }
    Ok(())
}
