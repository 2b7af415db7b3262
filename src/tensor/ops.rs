//! Element-wise kernels and operator overloading. Every binary kernel either
//! requires identical shapes or performs NumPy broadcasting; mismatch is a
//! hard error naming both shapes.

use super::Tensor;
use crate::types::broadcast_shape;
use crate::MzResult;
use ndarray::{ArrayD, IxDyn, Zip};

impl Tensor {
    /// Core binary kernel: broadcast both operands to the joint shape and
    /// combine element-wise.
    pub(crate) fn broadcast_with<F>(&self, rhs: &Tensor, op: &'static str, f: F) -> MzResult<Tensor>
    where
        F: Fn(f32, f32) -> f32 + Sync + Send,
    {
        let out_shape = broadcast_shape(op, self.shape(), rhs.shape())?;
        let a = self
            .data
            .broadcast(IxDyn(&out_shape))
            .ok_or_else(|| crate::MzError::shapes(op, self.shape(), &out_shape))?;
        let b = rhs
            .data
            .broadcast(IxDyn(&out_shape))
            .ok_or_else(|| crate::MzError::shapes(op, rhs.shape(), &out_shape))?;
        let mut out = ArrayD::zeros(IxDyn(&out_shape));
        let zip = Zip::from(&mut out).and(&a).and(&b);
        #[cfg(feature = "rayon")]
        zip.par_for_each(|o, &x, &y| *o = f(x, y));
        #[cfg(not(feature = "rayon"))]
        zip.for_each(|o, &x, &y| *o = f(x, y));
        Ok(Tensor::new(out))
    }

    pub fn add_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "add", |a, b| a + b)
    }

    pub fn sub_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "sub", |a, b| a - b)
    }

    pub fn mul_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "mul", |a, b| a * b)
    }

    pub fn div_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "div", |a, b| a / b)
    }

    /// Element-wise map into a fresh tensor.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        Tensor::new(self.data.mapv(|v| f(v)))
    }

    pub fn neg_t(&self) -> Tensor {
        self.map(|v| -v)
    }

    pub fn exp(&self) -> Tensor {
        self.map(f32::exp)
    }

    pub fn ln(&self) -> Tensor {
        self.map(f32::ln)
    }

    pub fn sqrt(&self) -> Tensor {
        self.map(f32::sqrt)
    }

    pub fn tanh(&self) -> Tensor {
        self.map(f32::tanh)
    }

    /// Numerically stable logistic; both branches avoid exp overflow.
    pub fn sigmoid(&self) -> Tensor {
        self.map(|x| {
            if x >= 0.0 {
                1.0 / (1.0 + (-x).exp())
            } else {
                let e = x.exp();
                e / (1.0 + e)
            }
        })
    }

    pub fn abs_t(&self) -> Tensor {
        self.map(f32::abs)
    }

    pub fn powf(&self, p: f32) -> Tensor {
        self.map(|v| v.powf(p))
    }

    pub fn clamp_t(&self, min: f32, max: f32) -> Tensor {
        self.map(|v| v.clamp(min, max))
    }

    pub fn relu(&self) -> Tensor {
        self.map(|v| if v > 0.0 { v } else { 0.0 })
    }

    pub fn add_scalar(&self, s: f32) -> Tensor {
        self.map(|v| v + s)
    }

    pub fn mul_scalar(&self, s: f32) -> Tensor {
        self.map(|v| v * s)
    }

    // Comparisons produce 0/1 masks; they are never differentiable.

    pub fn lt_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "lt", |a, b| if a < b { 1.0 } else { 0.0 })
    }

    pub fn gt_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "gt", |a, b| if a > b { 1.0 } else { 0.0 })
    }

    pub fn eq_t(&self, rhs: &Tensor) -> MzResult<Tensor> {
        self.broadcast_with(rhs, "eq", |a, b| if a == b { 1.0 } else { 0.0 })
    }
}

// Operator overloading for exact-or-broadcast combinations. These panic on
// incompatible shapes; fallible call sites use the `*_t` methods instead.

impl std::ops::Add for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: Self) -> Tensor {
        self.add_t(rhs).expect("tensor add: incompatible shapes")
    }
}

impl std::ops::Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: Self) -> Tensor {
        self.sub_t(rhs).expect("tensor sub: incompatible shapes")
    }
}

impl std::ops::Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: Self) -> Tensor {
        self.mul_t(rhs).expect("tensor mul: incompatible shapes")
    }
}

impl std::ops::Mul<f32> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: f32) -> Tensor {
        self.mul_scalar(rhs)
    }
}

impl std::ops::Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        self.neg_t()
    }
}

impl std::ops::AddAssign<&Tensor> for Tensor {
    fn add_assign(&mut self, rhs: &Tensor) {
        self.add_assign_t(rhs)
            .expect("tensor add_assign: incompatible shapes");
    }
}

impl std::ops::SubAssign<&Tensor> for Tensor {
    fn sub_assign(&mut self, rhs: &Tensor) {
        self.sub_assign_t(rhs)
            .expect("tensor sub_assign: incompatible shapes");
    }
}
