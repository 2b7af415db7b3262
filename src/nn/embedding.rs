use super::{init, Dropout, Module, ParamSet, Parameter};
use crate::autograd::{ops as F, Variable};
use crate::{MzError, MzResult};
use ndarray::Array2;

/// Token embedding table, optionally combined with a learned positional
/// table. GPT-1 class models keep the positional table; rotary-embedding
/// decoders construct this without one and encode position inside
/// attention instead.
pub struct Embedding {
    token_table: Parameter,
    pos_table: Option<Parameter>,
    dropout: Dropout,
    params: ParamSet,
    training: bool,
    vocab_size: usize,
    dim: usize,
    max_positions: usize,
}

impl Embedding {
    pub fn new(
        vocab_size: usize,
        dim: usize,
        max_positions: Option<usize>,
        dropout_p: f32,
        initializer_range: f32,
    ) -> MzResult<Self> {
        if vocab_size == 0 || dim == 0 {
            return Err(MzError::InvalidArgument(format!(
                "embedding: vocab {} dim {}",
                vocab_size, dim
            )));
        }
        if initializer_range <= 0.0 {
            return Err(MzError::InvalidArgument(format!(
                "embedding: initializer_range {}",
                initializer_range
            )));
        }
        let mut params = ParamSet::new();
        let token_table = params.register(
            "token_table",
            init::normal(&[vocab_size, dim], initializer_range),
        )?;
        let pos_table = match max_positions {
            Some(n) if n > 0 => {
                Some(params.register("pos_table", init::normal(&[n, dim], initializer_range))?)
            }
            Some(_) => {
                return Err(MzError::InvalidArgument(
                    "embedding: zero max_positions".into(),
                ))
            }
            None => None,
        };
        Ok(Self {
            token_table,
            pos_table,
            dropout: Dropout::new(dropout_p)?,
            params,
            training: true,
            vocab_size,
            dim,
            max_positions: max_positions.unwrap_or(0),
        })
    }

    /// Integer token IDs `[B, T]` to hidden states `[B, T, dim]`. IDs are
    /// constants; only the tables receive gradients.
    pub fn forward(&self, ids: &Array2<usize>, start_pos: usize) -> MzResult<Variable> {
        let (batch, len) = ids.dim();
        if batch == 0 || len == 0 {
            return Err(MzError::InvalidArgument("embedding: empty batch".into()));
        }
        let flat: Vec<usize> = ids.iter().copied().collect();
        let tokens = F::index_select(self.token_table.var(), 0, &flat)?;
        let mut hidden = F::reshape(&tokens, &[batch, len, self.dim])?;

        if let Some(pos_table) = &self.pos_table {
            if start_pos + len > self.max_positions {
                return Err(MzError::IndexOutOfRange {
                    index: start_pos + len - 1,
                    axis: 0,
                    size: self.max_positions,
                });
            }
            let positions: Vec<usize> = (start_pos..start_pos + len).collect();
            let pos = F::index_select(pos_table.var(), 0, &positions)?;
            hidden = F::add(&hidden, &F::unsqueeze(&pos, 0)?)?;
        }
        self.dropout.forward(&hidden)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Module for Embedding {
    fn local_parameters(&self) -> &[(String, Parameter)] {
        self.params.entries()
    }

    fn children(&self) -> Vec<(String, &dyn Module)> {
        vec![("dropout".to_string(), &self.dropout as &dyn Module)]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module)> {
        vec![("dropout".to_string(), &mut self.dropout as &mut dyn Module)]
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_local_training(&mut self, training: bool) {
        self.training = training;
    }
}
