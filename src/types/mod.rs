use crate::{MzError, MzResult};
use ndarray::{Dimension, IxDyn};
use serde::{Deserialize, Serialize};

/// Represents the shape of a tensor.
/// Wrapper around IxDyn to provide a more domain-specific API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub IxDyn);

impl Shape {
    pub fn from_slice(dims: &[usize]) -> Self {
        Self(IxDyn(dims))
    }

    pub fn as_slice(&self) -> &[usize] {
        self.0.slice()
    }

    pub fn ndim(&self) -> usize {
        self.0.ndim()
    }

    pub fn size(&self) -> usize {
        self.0.slice().iter().product()
    }

    /// Resolves a possibly-negative axis index against this shape.
    pub fn axis(&self, axis: isize) -> MzResult<usize> {
        normalize_axis(axis, self.ndim())
    }
}

impl From<IxDyn> for Shape {
    fn from(ix: IxDyn) -> Self {
        Self(ix)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(IxDyn(&dims))
    }
}

/// Resolves a possibly-negative axis against a rank. `-1` is the last axis.
pub fn normalize_axis(axis: isize, ndim: usize) -> MzResult<usize> {
    let n = ndim as isize;
    let resolved = if axis < 0 { axis + n } else { axis };
    if resolved < 0 || resolved >= n.max(1) {
        return Err(MzError::InvalidArgument(format!(
            "axis {} out of range for rank {}",
            axis, ndim
        )));
    }
    Ok(resolved as usize)
}

/// NumPy broadcast rule: align from the right, each dim pair must be equal
/// or one of them must be 1.
pub fn broadcast_shape(op: &'static str, a: &[usize], b: &[usize]) -> MzResult<Vec<usize>> {
    let n = a.len().max(b.len());
    let mut out = vec![0usize; n];
    for i in 0..n {
        let da = if i < n - a.len() { 1 } else { a[i - (n - a.len())] };
        let db = if i < n - b.len() { 1 } else { b[i - (n - b.len())] };
        if da == db || da == 1 || db == 1 {
            out[i] = da.max(db);
        } else {
            return Err(MzError::shapes(op, a, b));
        }
    }
    Ok(out)
}
