pub mod kernel;
pub mod ops;

use crate::types::Shape;
use crate::util::rng;
use crate::{MzError, MzResult};
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use serde::{Deserialize, Serialize};

/// Dense row-major f32 tensor. The single value type every kernel and every
/// autograd operator works on; gradients are plain `Tensor`s too.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Tensor {
    pub(crate) data: ArrayD<f32>,
}

impl Tensor {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data }
    }

    pub fn zeros(dims: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(dims)))
    }

    pub fn ones(dims: &[usize]) -> Self {
        Self::new(ArrayD::ones(IxDyn(dims)))
    }

    pub fn full(dims: &[usize], value: f32) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(dims), value))
    }

    /// 0-dimensional tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Builds a tensor from row-major flat data.
    pub fn from_vec(data: Vec<f32>, dims: &[usize]) -> MzResult<Self> {
        let size: usize = dims.iter().product();
        if data.len() != size {
            return Err(MzError::shapes("from_vec", &[data.len()], dims));
        }
        let arr = ArrayD::from_shape_vec(IxDyn(dims), data)
            .map_err(|e| MzError::InvalidArgument(format!("from_vec: {e}")))?;
        Ok(Self::new(arr))
    }

    /// Standard-normal samples drawn from the shared seedable stream.
    pub fn randn(dims: &[usize]) -> Self {
        rng::with_rng(|r| Self::new(ArrayD::random_using(IxDyn(dims), StandardNormal, r)))
    }

    /// Uniform samples in `[lo, hi)` from the shared seedable stream.
    pub fn rand_uniform(dims: &[usize], lo: f32, hi: f32) -> Self {
        rng::with_rng(|r| Self::new(ArrayD::random_using(IxDyn(dims), Uniform::new(lo, hi), r)))
    }

    /// `[0, 1, ..., n-1]` as a 1-D tensor.
    pub fn arange(n: usize) -> Self {
        Self::new(ArrayD::from_shape_vec(IxDyn(&[n]), (0..n).map(|i| i as f32).collect()).unwrap())
    }

    /// Lower-triangular `[rows, cols]` mask: 1 where `col <= row + k`.
    pub fn tril(rows: usize, cols: usize, k: isize) -> Self {
        let mut out = ArrayD::zeros(IxDyn(&[rows, cols]));
        for i in 0..rows {
            for j in 0..cols {
                if (j as isize) <= (i as isize) + k {
                    out[[i, j]] = 1.0;
                }
            }
        }
        Self::new(out)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn shape_of(&self) -> Shape {
        Shape::from_slice(self.data.shape())
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: &[usize]) -> MzResult<f32> {
        self.data
            .get(IxDyn(index))
            .copied()
            .ok_or_else(|| MzError::shapes("get", index, self.shape()))
    }

    pub fn set(&mut self, index: &[usize], value: f32) -> MzResult<()> {
        match self.data.get_mut(IxDyn(index)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(MzError::shapes("set", index, self.shape())),
        }
    }

    /// The single element of a 0-d or one-element tensor.
    pub fn item(&self) -> MzResult<f32> {
        if self.data.len() != 1 {
            return Err(MzError::InvalidArgument(format!(
                "item() requires exactly one element, shape is {:?}",
                self.shape()
            )));
        }
        Ok(*self.data.iter().next().unwrap())
    }

    pub fn as_array(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn as_array_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        self.data.view_mut()
    }

    pub fn iter(&self) -> ndarray::iter::Iter<'_, f32, IxDyn> {
        self.data.iter()
    }

    /// Row-major flat copy of the contents.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn scale_inplace(&mut self, factor: f32) {
        self.data.mapv_inplace(|v| v * factor);
    }

    /// `self += alpha * other`, exact shapes required (gradient/moment math).
    pub fn add_scaled_inplace(&mut self, other: &Tensor, alpha: f32) -> MzResult<()> {
        if self.shape() != other.shape() {
            return Err(MzError::shapes("add_scaled", self.shape(), other.shape()));
        }
        ndarray::Zip::from(&mut self.data)
            .and(&other.data)
            .for_each(|a, &b| *a += alpha * b);
        Ok(())
    }

    /// In-place accumulation with exact shape check.
    pub fn add_assign_t(&mut self, other: &Tensor) -> MzResult<()> {
        self.add_scaled_inplace(other, 1.0)
    }

    pub fn sub_assign_t(&mut self, other: &Tensor) -> MzResult<()> {
        self.add_scaled_inplace(other, -1.0)
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(data: ArrayD<f32>) -> Self {
        Self::new(data)
    }
}
