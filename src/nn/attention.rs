use super::{Dropout, Linear, Module, ParamSet, Parameter, RotaryEmbedding};
use crate::autograd::{ops as F, Variable};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use ndarray::{Axis, Slice};

/// Per-layer append-only K/V buffers shaped `[batch, heads, capacity,
/// head_dim]` with a length cursor. Contents are valid for eval/inference
/// only; reset on sequence boundaries.
pub struct KvCache {
    k: Tensor,
    v: Tensor,
    len: usize,
    capacity: usize,
}

impl KvCache {
    pub fn new(batch: usize, num_heads: usize, capacity: usize, head_dim: usize) -> Self {
        Self {
            k: Tensor::zeros(&[batch, num_heads, capacity, head_dim]),
            v: Tensor::zeros(&[batch, num_heads, capacity, head_dim]),
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `[B, H, T, d]` projections along the time axis. Overflowing
    /// the capacity is an error; the caller may reset and retry.
    pub fn append(&mut self, k_new: &Tensor, v_new: &Tensor) -> MzResult<()> {
        if k_new.shape() != v_new.shape() || k_new.ndim() != 4 {
            return Err(MzError::shapes("kv_append", k_new.shape(), v_new.shape()));
        }
        let t = k_new.shape()[2];
        let expect = [self.k.shape()[0], self.k.shape()[1], t, self.k.shape()[3]];
        if k_new.shape() != expect {
            return Err(MzError::shapes("kv_append", k_new.shape(), &expect));
        }
        if self.len + t > self.capacity {
            return Err(MzError::CacheOverflow {
                len: self.len,
                append: t,
                capacity: self.capacity,
            });
        }
        let span = Slice::from(self.len..self.len + t);
        self.k
            .as_array_mut()
            .slice_axis_mut(Axis(2), span)
            .assign(k_new.as_array());
        self.v
            .as_array_mut()
            .slice_axis_mut(Axis(2), span)
            .assign(v_new.as_array());
        self.len += t;
        Ok(())
    }

    /// Accumulated keys `[B, H, len, d]`.
    pub fn keys(&self) -> MzResult<Tensor> {
        self.k.narrow(2, 0, self.len)
    }

    pub fn values(&self) -> MzResult<Tensor> {
        self.v.narrow(2, 0, self.len)
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }
}

/// Multi-head causal self-attention with rotary position encoding and an
/// optional KV cache for incremental decoding.
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rope: RotaryEmbedding,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,
    params: ParamSet,
    training: bool,
}

impl MultiHeadAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        rope_base: f32,
        dropout_p: f32,
    ) -> MzResult<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(MzError::ConfigValidation(format!(
                "hidden_size {} not divisible by num_heads {}",
                hidden_size, num_heads
            )));
        }
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj: Linear::new(hidden_size, hidden_size, false)?,
            k_proj: Linear::new(hidden_size, hidden_size, false)?,
            v_proj: Linear::new(hidden_size, hidden_size, false)?,
            o_proj: Linear::new(hidden_size, hidden_size, false)?,
            rope: RotaryEmbedding::new(head_dim, rope_base)?,
            dropout: Dropout::new(dropout_p)?,
            num_heads,
            head_dim,
            hidden_size,
            params: ParamSet::new(),
            training: true,
        })
    }

    /// `[B, T, D] -> [B, H, T, d_h]`.
    fn split_heads(&self, x: &Variable, batch: usize, len: usize) -> MzResult<Variable> {
        let reshaped = F::reshape(x, &[batch, len, self.num_heads, self.head_dim])?;
        F::permute(&reshaped, &[0, 2, 1, 3])
    }

    /// Causal mask `[T, S]` with 1 marking disallowed keys: query `i` sits
    /// at absolute position `start_pos + i` and may attend keys `j <= start_pos + i`.
    fn causal_mask(query_len: usize, key_len: usize, start_pos: usize) -> Tensor {
        Tensor::tril(query_len, key_len, start_pos as isize).map(|allowed| 1.0 - allowed)
    }

    pub fn forward(
        &self,
        x: &Variable,
        start_pos: usize,
        cache: Option<&mut KvCache>,
    ) -> MzResult<Variable> {
        let shape = x.shape();
        if shape.len() != 3 || shape[2] != self.hidden_size {
            return Err(MzError::shapes("attention", &shape, &[0, 0, self.hidden_size]));
        }
        let (batch, len) = (shape[0], shape[1]);

        let q = self.split_heads(&self.q_proj.forward(x)?, batch, len)?;
        let k = self.split_heads(&self.k_proj.forward(x)?, batch, len)?;
        let v = self.split_heads(&self.v_proj.forward(x)?, batch, len)?;

        let q = self.rope.apply(&q, start_pos)?;
        let k = self.rope.apply(&k, start_pos)?;

        // With a cache the full accumulated K/V become constants; gradients
        // never flow into cached history.
        let (k_all, v_all, key_len) = match cache {
            Some(c) => {
                c.append(&k.value(), &v.value())?;
                (
                    Variable::new(c.keys()?),
                    Variable::new(c.values()?),
                    c.len(),
                )
            }
            None => (k, v, len),
        };

        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let scores = F::mul_scalar(&F::matmul(&q, &F::transpose_last(&k_all)?)?, scale)?;
        let mask = Self::causal_mask(len, key_len, start_pos);
        let scores = F::masked_fill(&scores, &mask, f32::NEG_INFINITY)?;

        let attn = F::softmax(&scores, -1)?;
        let attn = self.dropout.forward(&attn)?;

        let ctx = F::matmul(&attn, &v_all)?;
        let merged = F::reshape(&F::permute(&ctx, &[0, 2, 1, 3])?, &[batch, len, self.hidden_size])?;
        self.o_proj.forward(&merged)
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

impl Module for MultiHeadAttention {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![
            ("q_proj".to_string(), &self.q_proj as &dyn Module),
            ("k_proj".to_string(), &self.k_proj as &dyn Module),
            ("v_proj".to_string(), &self.v_proj as &dyn Module),
            ("o_proj".to_string(), &self.o_proj as &dyn Module),
            ("dropout".to_string(), &self.dropout as &dyn Module),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        vec![
            ("q_proj".to_string(), &mut self.q_proj as &mut dyn Module),
            ("k_proj".to_string(), &mut self.k_proj as &mut dyn Module),
            ("v_proj".to_string(), &mut self.v_proj as &mut dyn Module),
            ("o_proj".to_string(), &mut self.o_proj as &mut dyn Module),
            ("dropout".to_string(), &mut self.dropout as &mut dyn Module),
        ]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
