//! Loss functions: MSE, classification and causal-LM cross-entropy, masked
//! sequence log-probabilities and softmax entropy. All take Variables and
//! return scalar (or per-sequence) Variables on the graph.

use crate::autograd::{ops as F, Variable};
use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use ndarray::{Array2, ArrayD, IxDyn};

/// Mean squared error over all elements.
pub fn mse(pred: &Variable, target: &Variable) -> MzResult<Variable> {
    let diff = F::sub(pred, target)?;
    F::mean(&F::mul(&diff, &diff)?, None, false)
}

/// Softmax cross-entropy for flat classification: logits `[N, C]`, one
/// target class per row.
pub fn softmax_cross_entropy(logits: &Variable, targets: &[usize]) -> MzResult<Variable> {
    let shape = logits.shape();
    if shape.len() != 2 || shape[0] != targets.len() {
        return Err(MzError::shapes("cross_entropy", &shape, &[targets.len(), 0]));
    }
    let log_probs = F::log_softmax(logits, -1)?;
    let index = ArrayD::from_shape_vec(IxDyn(&[targets.len()]), targets.to_vec())
        .expect("target index shape");
    let picked = F::gather_last(&log_probs, &index)?;
    F::mul_scalar(&F::mean(&picked, None, false)?, -1.0)
}

/// Causal-LM cross-entropy: logits `[B, T, V]`, integer targets `[B, T]`,
/// optional `[B, T]` loss mask (1 contributes). Masked positions add zero
/// loss and zero gradient; the mean divides by the unmasked count, not
/// `B*T`.
pub fn causal_lm_loss(
    logits: &Variable,
    targets: &Array2<usize>,
    mask: Option<&Tensor>,
) -> MzResult<Variable> {
    let shape = logits.shape();
    let (batch, len) = targets.dim();
    if shape.len() != 3 || shape[0] != batch || shape[1] != len {
        return Err(MzError::shapes("causal_lm_loss", &shape, &[batch, len, 0]));
    }
    let log_probs = F::log_softmax(logits, -1)?;
    let index = targets.clone().into_dyn();
    let picked = F::gather_last(&log_probs, &index)?;
    let nll = F::neg(&picked)?;
    match mask {
        Some(m) => {
            if m.shape() != [batch, len] {
                return Err(MzError::shapes("causal_lm_loss", m.shape(), &[batch, len]));
            }
            let denom = m.sum_all();
            if denom <= 0.0 {
                return Err(MzError::InvalidArgument(
                    "causal_lm_loss: no unmasked positions".into(),
                ));
            }
            let masked = F::mul(&nll, &Variable::new(m.clone()))?;
            F::mul_scalar(&F::sum(&masked, None, false)?, 1.0 / denom)
        }
        None => F::mean(&nll, None, false),
    }
}

/// Per-sequence sum of target-token log-probabilities over masked (response)
/// positions: logits `[B, T, V]` to `[B]`.
pub fn sequence_log_probs(
    logits: &Variable,
    targets: &Array2<usize>,
    mask: &Tensor,
) -> MzResult<Variable> {
    let shape = logits.shape();
    let (batch, len) = targets.dim();
    if shape.len() != 3 || shape[0] != batch || shape[1] != len {
        return Err(MzError::shapes("sequence_log_probs", &shape, &[batch, len, 0]));
    }
    if mask.shape() != [batch, len] {
        return Err(MzError::shapes("sequence_log_probs", mask.shape(), &[batch, len]));
    }
    let log_probs = F::log_softmax(logits, -1)?;
    let picked = F::gather_last(&log_probs, &targets.clone().into_dyn())?;
    let masked = F::mul(&picked, &Variable::new(mask.clone()))?;
    F::sum(&masked, Some(1), false)
}

/// Mean softmax entropy of finite logits `[B, T, V]`, optionally restricted
/// to masked positions.
pub fn entropy(logits: &Variable, mask: Option<&Tensor>) -> MzResult<Variable> {
    let probs = F::softmax(logits, -1)?;
    let log_probs = F::log_softmax(logits, -1)?;
    let per_pos = F::neg(&F::sum(&F::mul(&probs, &log_probs)?, Some(-1), false)?)?;
    match mask {
        Some(m) => {
            let denom = m.sum_all();
            if denom <= 0.0 {
                return Err(MzError::InvalidArgument("entropy: empty mask".into()));
            }
            let masked = F::mul(&per_pos, &Variable::new(m.clone()))?;
            F::mul_scalar(&F::sum(&masked, None, false)?, 1.0 / denom)
        }
        None => F::mean(&per_pos, None, false),
    }
}

/// Classification accuracy diagnostic: argmax of `[N, C]` logits against
/// targets. Not differentiable, plain f32.
pub fn accuracy(logits: &Tensor, targets: &[usize]) -> MzResult<f32> {
    let shape = logits.shape().to_vec();
    if shape.len() != 2 || shape[0] != targets.len() {
        return Err(MzError::shapes("accuracy", &shape, &[targets.len(), 0]));
    }
    if targets.is_empty() {
        return Ok(0.0);
    }
    let classes = shape[1];
    let flat = logits.to_vec();
    let mut hits = 0usize;
    for (row, &target) in targets.iter().enumerate() {
        let lane = &flat[row * classes..(row + 1) * classes];
        let mut best = 0usize;
        for (i, &v) in lane.iter().enumerate() {
            if v > lane[best] {
                best = i;
            }
        }
        if best == target {
            hits += 1;
        }
    }
    Ok(hits as f32 / targets.len() as f32)
}
