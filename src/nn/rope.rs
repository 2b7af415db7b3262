use crate::autograd::{ops as F, Variable};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};

/// Rotary positional embedding. Precomputes inverse frequencies
/// `1 / base^(2i/head_dim)` and rotates feature pairs of Q and K by a
/// position-dependent angle: `rotate(x) = x*cos + half_rotate(x)*sin` with
/// `half_rotate([a, b]) = [-b, a]` over the two halves of the feature axis.
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
    head_dim: usize,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, base: f32) -> MzResult<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(MzError::ConfigValidation(format!(
                "rotary embedding needs an even head_dim, got {}",
                head_dim
            )));
        }
        if base <= 1.0 {
            return Err(MzError::ConfigValidation(format!(
                "rotary base must exceed 1, got {}",
                base
            )));
        }
        let half = head_dim / 2;
        let inv_freq = (0..half)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / head_dim as f32))
            .collect();
        Ok(Self { inv_freq, head_dim })
    }

    /// Cos/sin tables `[len, head_dim]` for positions `start_pos..start_pos+len`,
    /// the half-frequency vector tiled over both halves.
    pub fn tables(&self, start_pos: usize, len: usize) -> (Tensor, Tensor) {
        let half = self.head_dim / 2;
        let mut cos = vec![0.0f32; len * self.head_dim];
        let mut sin = vec![0.0f32; len * self.head_dim];
        for t in 0..len {
            for i in 0..half {
                let angle = (start_pos + t) as f32 * self.inv_freq[i];
                let (s, c) = angle.sin_cos();
                cos[t * self.head_dim + i] = c;
                cos[t * self.head_dim + half + i] = c;
                sin[t * self.head_dim + i] = s;
                sin[t * self.head_dim + half + i] = s;
            }
        }
        (
            Tensor::from_vec(cos, &[len, self.head_dim]).unwrap(),
            Tensor::from_vec(sin, &[len, self.head_dim]).unwrap(),
        )
    }

    /// Applies the rotation to `[B, H, T, head_dim]` queries or keys for a
    /// sequence starting at `start_pos`.
    pub fn apply(&self, x: &Variable, start_pos: usize) -> MzResult<Variable> {
        let shape = x.shape();
        if shape.len() != 4 || shape[3] != self.head_dim {
            return Err(MzError::shapes("rope", &shape, &[0, 0, 0, self.head_dim]));
        }
        let len = shape[2];
        let (cos, sin) = self.tables(start_pos, len);
        let cos = Variable::new(cos.reshape(&[1, 1, len, self.head_dim])?);
        let sin = Variable::new(sin.reshape(&[1, 1, len, self.head_dim])?);

        let half = self.head_dim / 2;
        let lo = F::narrow(x, -1, 0, half)?;
        let hi = F::narrow(x, -1, half, half)?;
        let rotated = F::concat(&[&F::neg(&hi)?, &lo], -1)?;

        F::add(&F::mul(x, &cos)?, &F::mul(&rotated, &sin)?)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
