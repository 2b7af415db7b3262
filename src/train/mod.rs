//! Training strategies over the decoder model: supervised shifting helpers
//! plus the DPO and GRPO alignment objectives.

pub mod dpo;
pub mod grpo;
pub mod supervised;

use crate::tensor::Tensor;
use crate::{MzError, MzResult};
use ndarray::{s, Array2};

/// Next-token split: `inputs = ids[:, :-1]`, `targets = ids[:, 1:]`.
pub fn shift_targets(ids: &Array2<usize>) -> MzResult<(Array2<usize>, Array2<usize>)> {
    let (_, t) = ids.dim();
    if t < 2 {
        return Err(MzError::InvalidArgument(format!(
            "shift_targets: sequence length {} too short",
            t
        )));
    }
    let inputs = ids.slice(s![.., ..t - 1]).to_owned();
    let targets = ids.slice(s![.., 1..]).to_owned();
    Ok((inputs, targets))
}

/// Aligns a `[B, T]` position mask with shifted targets: target `i` is the
/// token at `i + 1`, so the target mask is `mask[:, 1:]`.
pub fn shift_mask(mask: &Tensor) -> MzResult<Tensor> {
    let shape = mask.shape();
    if shape.len() != 2 || shape[1] < 2 {
        return Err(MzError::shapes("shift_mask", shape, &[0, 2]));
    }
    mask.narrow(1, 1, shape[1] - 1)
}
