//! Operator library. Every operator pairs a pure kernel forward with a
//! backward that returns one gradient per input; broadcasted binary ops
//! reduce their gradients back with `sum_to`.

use super::{build_output, Function, Variable};
use crate::tensor::Tensor;
use crate::types::normalize_axis;
use crate::util::rng;
use crate::{MzError, MzResult};
use ndarray::{ArrayD, Axis};
use rand::Rng;

// --- arithmetic ---

struct Add;
impl Function for Add {
    fn name(&self) -> &'static str {
        "add"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(gy.sum_to(inputs[0].shape())?),
            Some(gy.sum_to(inputs[1].shape())?),
        ])
    }
}

pub fn add(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.add_t(&bv)?
    };
    Ok(build_output(Box::new(Add), vec![a.clone(), b.clone()], v))
}

struct Sub;
impl Function for Sub {
    fn name(&self) -> &'static str {
        "sub"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![
            Some(gy.sum_to(inputs[0].shape())?),
            Some(gy.neg_t().sum_to(inputs[1].shape())?),
        ])
    }
}

pub fn sub(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.sub_t(&bv)?
    };
    Ok(build_output(Box::new(Sub), vec![a.clone(), b.clone()], v))
}

struct Mul;
impl Function for Mul {
    fn name(&self) -> &'static str {
        "mul"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let ga = gy.mul_t(&inputs[1])?.sum_to(inputs[0].shape())?;
        let gb = gy.mul_t(&inputs[0])?.sum_to(inputs[1].shape())?;
        Ok(vec![Some(ga), Some(gb)])
    }
}

pub fn mul(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.mul_t(&bv)?
    };
    Ok(build_output(Box::new(Mul), vec![a.clone(), b.clone()], v))
}

struct Div;
impl Function for Div {
    fn name(&self) -> &'static str {
        "div"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let (a, b) = (&inputs[0], &inputs[1]);
        let ga = gy.div_t(b)?.sum_to(a.shape())?;
        // d/db (a/b) = -a / b^2
        let gb = gy
            .mul_t(&a.neg_t().div_t(&b.mul_t(b)?)?)?
            .sum_to(b.shape())?;
        Ok(vec![Some(ga), Some(gb)])
    }
}

pub fn div(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.div_t(&bv)?
    };
    Ok(build_output(Box::new(Div), vec![a.clone(), b.clone()], v))
}

struct Neg;
impl Function for Neg {
    fn name(&self) -> &'static str {
        "neg"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.neg_t())])
    }
}

pub fn neg(x: &Variable) -> MzResult<Variable> {
    let v = x.value().neg_t();
    Ok(build_output(Box::new(Neg), vec![x.clone()], v))
}

struct AddScalar;
impl Function for AddScalar {
    fn name(&self) -> &'static str {
        "add_scalar"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.clone())])
    }
}

pub fn add_scalar(x: &Variable, s: f32) -> MzResult<Variable> {
    let v = x.value().add_scalar(s);
    Ok(build_output(Box::new(AddScalar), vec![x.clone()], v))
}

struct MulScalar {
    s: f32,
}
impl Function for MulScalar {
    fn name(&self) -> &'static str {
        "mul_scalar"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.mul_scalar(self.s))])
    }
}

pub fn mul_scalar(x: &Variable, s: f32) -> MzResult<Variable> {
    let v = x.value().mul_scalar(s);
    Ok(build_output(Box::new(MulScalar { s }), vec![x.clone()], v))
}

// --- transcendentals ---

struct Exp {
    y: Tensor,
}
impl Function for Exp {
    fn name(&self) -> &'static str {
        "exp"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.mul_t(&self.y)?)])
    }
}

pub fn exp(x: &Variable) -> MzResult<Variable> {
    let y = x.value().exp();
    Ok(build_output(Box::new(Exp { y: y.clone() }), vec![x.clone()], y))
}

struct Ln;
impl Function for Ln {
    fn name(&self) -> &'static str {
        "ln"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.div_t(&inputs[0])?)])
    }
}

pub fn ln(x: &Variable) -> MzResult<Variable> {
    let v = x.value().ln();
    Ok(build_output(Box::new(Ln), vec![x.clone()], v))
}

struct Sqrt {
    y: Tensor,
}
impl Function for Sqrt {
    fn name(&self) -> &'static str {
        "sqrt"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // d sqrt(x) = 0.5 / sqrt(x)
        Ok(vec![Some(gy.div_t(&self.y)?.mul_scalar(0.5))])
    }
}

pub fn sqrt(x: &Variable) -> MzResult<Variable> {
    let y = x.value().sqrt();
    Ok(build_output(Box::new(Sqrt { y: y.clone() }), vec![x.clone()], y))
}

struct Tanh {
    y: Tensor,
}
impl Function for Tanh {
    fn name(&self) -> &'static str {
        "tanh"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let one_minus_y2 = self.y.map(|v| 1.0 - v * v);
        Ok(vec![Some(gy.mul_t(&one_minus_y2)?)])
    }
}

pub fn tanh(x: &Variable) -> MzResult<Variable> {
    let y = x.value().tanh();
    Ok(build_output(Box::new(Tanh { y: y.clone() }), vec![x.clone()], y))
}

struct Sigmoid {
    y: Tensor,
}
impl Function for Sigmoid {
    fn name(&self) -> &'static str {
        "sigmoid"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let dydx = self.y.map(|v| v * (1.0 - v));
        Ok(vec![Some(gy.mul_t(&dydx)?)])
    }
}

pub fn sigmoid(x: &Variable) -> MzResult<Variable> {
    let y = x.value().sigmoid();
    Ok(build_output(Box::new(Sigmoid { y: y.clone() }), vec![x.clone()], y))
}

struct LogSigmoid;
impl Function for LogSigmoid {
    fn name(&self) -> &'static str {
        "log_sigmoid"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // d log sigmoid(x) = sigmoid(-x)
        let dydx = inputs[0].neg_t().sigmoid();
        Ok(vec![Some(gy.mul_t(&dydx)?)])
    }
}

/// `log(sigmoid(x))` in the stable softplus form `-(max(-x,0) + ln(1+e^{-|x|}))`.
pub fn log_sigmoid(x: &Variable) -> MzResult<Variable> {
    let v = x
        .value()
        .map(|t| -((-t).max(0.0) + (-t.abs()).exp().ln_1p()));
    Ok(build_output(Box::new(LogSigmoid), vec![x.clone()], v))
}

struct Relu;
impl Function for Relu {
    fn name(&self) -> &'static str {
        "relu"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let mask = inputs[0].map(|v| if v > 0.0 { 1.0 } else { 0.0 });
        Ok(vec![Some(gy.mul_t(&mask)?)])
    }
}

pub fn relu(x: &Variable) -> MzResult<Variable> {
    let v = x.value().relu();
    Ok(build_output(Box::new(Relu), vec![x.clone()], v))
}

struct PowScalar {
    p: f32,
}
impl Function for PowScalar {
    fn name(&self) -> &'static str {
        "powf"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let dydx = inputs[0].powf(self.p - 1.0).mul_scalar(self.p);
        Ok(vec![Some(gy.mul_t(&dydx)?)])
    }
}

pub fn powf(x: &Variable, p: f32) -> MzResult<Variable> {
    let v = x.value().powf(p);
    Ok(build_output(Box::new(PowScalar { p }), vec![x.clone()], v))
}

struct Abs;
impl Function for Abs {
    fn name(&self) -> &'static str {
        "abs"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let sign = inputs[0].map(|v| {
            if v > 0.0 {
                1.0
            } else if v < 0.0 {
                -1.0
            } else {
                0.0
            }
        });
        Ok(vec![Some(gy.mul_t(&sign)?)])
    }
}

pub fn abs(x: &Variable) -> MzResult<Variable> {
    let v = x.value().abs_t();
    Ok(build_output(Box::new(Abs), vec![x.clone()], v))
}

struct Clamp {
    min: f32,
    max: f32,
}
impl Function for Clamp {
    fn name(&self) -> &'static str {
        "clamp"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let (min, max) = (self.min, self.max);
        let mask = inputs[0].map(|v| if v >= min && v <= max { 1.0 } else { 0.0 });
        Ok(vec![Some(gy.mul_t(&mask)?)])
    }
}

pub fn clamp(x: &Variable, min: f32, max: f32) -> MzResult<Variable> {
    if min > max {
        return Err(MzError::InvalidArgument(format!(
            "clamp: min {} > max {}",
            min, max
        )));
    }
    let v = x.value().clamp_t(min, max);
    Ok(build_output(Box::new(Clamp { min, max }), vec![x.clone()], v))
}

// --- binary extremum ---

struct Minimum;
impl Function for Minimum {
    fn name(&self) -> &'static str {
        "minimum"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // Ties route to the first operand.
        let pick_a = inputs[0].broadcast_with(&inputs[1], "minimum", |a, b| {
            if a <= b {
                1.0
            } else {
                0.0
            }
        })?;
        let ga = gy.mul_t(&pick_a)?.sum_to(inputs[0].shape())?;
        let gb = gy
            .mul_t(&pick_a.map(|m| 1.0 - m))?
            .sum_to(inputs[1].shape())?;
        Ok(vec![Some(ga), Some(gb)])
    }
}

pub fn minimum(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.broadcast_with(&bv, "minimum", f32::min)?
    };
    Ok(build_output(Box::new(Minimum), vec![a.clone(), b.clone()], v))
}

struct Maximum;
impl Function for Maximum {
    fn name(&self) -> &'static str {
        "maximum"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let pick_a = inputs[0].broadcast_with(&inputs[1], "maximum", |a, b| {
            if a >= b {
                1.0
            } else {
                0.0
            }
        })?;
        let ga = gy.mul_t(&pick_a)?.sum_to(inputs[0].shape())?;
        let gb = gy
            .mul_t(&pick_a.map(|m| 1.0 - m))?
            .sum_to(inputs[1].shape())?;
        Ok(vec![Some(ga), Some(gb)])
    }
}

pub fn maximum(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.broadcast_with(&bv, "maximum", f32::max)?
    };
    Ok(build_output(Box::new(Maximum), vec![a.clone(), b.clone()], v))
}

// --- linear algebra ---

struct MatMul;
impl Function for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let (a, b) = (&inputs[0], &inputs[1]);
        // dA = dC . B^T, dB = A^T . dC; batched broadcast reduces via sum_to.
        let ga = gy.matmul(&b.transpose_last()?)?.sum_to(a.shape())?;
        let gb = a.transpose_last()?.matmul(gy)?.sum_to(b.shape())?;
        Ok(vec![Some(ga), Some(gb)])
    }
}

pub fn matmul(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let v = {
        let (av, bv) = (a.value(), b.value());
        av.matmul(&bv)?
    };
    Ok(build_output(Box::new(MatMul), vec![a.clone(), b.clone()], v))
}

// --- shape ---

struct Reshape;
impl Function for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.reshape(inputs[0].shape())?)])
    }
}

pub fn reshape(x: &Variable, dims: &[usize]) -> MzResult<Variable> {
    let v = x.value().reshape(dims)?;
    Ok(build_output(Box::new(Reshape), vec![x.clone()], v))
}

struct BroadcastTo;
impl Function for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.sum_to(inputs[0].shape())?)])
    }
}

pub fn broadcast_to(x: &Variable, dims: &[usize]) -> MzResult<Variable> {
    let v = x.value().broadcast_to(dims)?;
    Ok(build_output(Box::new(BroadcastTo), vec![x.clone()], v))
}

struct Permute {
    axes: Vec<usize>,
}
impl Function for Permute {
    fn name(&self) -> &'static str {
        "permute"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let mut inverse = vec![0usize; self.axes.len()];
        for (i, &a) in self.axes.iter().enumerate() {
            inverse[a] = i;
        }
        Ok(vec![Some(gy.permute(&inverse)?)])
    }
}

pub fn permute(x: &Variable, axes: &[usize]) -> MzResult<Variable> {
    let v = x.value().permute(axes)?;
    Ok(build_output(
        Box::new(Permute { axes: axes.to_vec() }),
        vec![x.clone()],
        v,
    ))
}

struct TransposeLast;
impl Function for TransposeLast {
    fn name(&self) -> &'static str {
        "transpose"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.transpose_last()?)])
    }
}

pub fn transpose_last(x: &Variable) -> MzResult<Variable> {
    let v = x.value().transpose_last()?;
    Ok(build_output(Box::new(TransposeLast), vec![x.clone()], v))
}

struct Unsqueeze {
    axis: usize,
}
impl Function for Unsqueeze {
    fn name(&self) -> &'static str {
        "unsqueeze"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.squeeze(self.axis as isize)?)])
    }
}

pub fn unsqueeze(x: &Variable, axis: isize) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim() + 1)?;
    let v = x.value().unsqueeze(ax as isize)?;
    Ok(build_output(Box::new(Unsqueeze { axis: ax }), vec![x.clone()], v))
}

struct Squeeze {
    axis: usize,
}
impl Function for Squeeze {
    fn name(&self) -> &'static str {
        "squeeze"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.unsqueeze(self.axis as isize)?)])
    }
}

pub fn squeeze(x: &Variable, axis: isize) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let v = x.value().squeeze(ax as isize)?;
    Ok(build_output(Box::new(Squeeze { axis: ax }), vec![x.clone()], v))
}

struct Repeat {
    factors: Vec<usize>,
}
impl Function for Repeat {
    fn name(&self) -> &'static str {
        "repeat"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // Fold the replicated blocks back by summation, one axis at a time.
        let in_shape = inputs[0].shape();
        let mut cur = gy.clone();
        for (ax, &f) in self.factors.iter().enumerate() {
            if f == 1 {
                continue;
            }
            let n = in_shape[ax];
            let mut acc = cur.narrow(ax as isize, 0, n)?;
            for c in 1..f {
                acc = acc.add_t(&cur.narrow(ax as isize, c * n, n)?)?;
            }
            cur = acc;
        }
        Ok(vec![Some(cur)])
    }
}

pub fn repeat(x: &Variable, factors: &[usize]) -> MzResult<Variable> {
    let v = x.value().repeat(factors)?;
    Ok(build_output(
        Box::new(Repeat {
            factors: factors.to_vec(),
        }),
        vec![x.clone()],
        v,
    ))
}

struct Narrow {
    axis: usize,
    start: usize,
}
impl Function for Narrow {
    fn name(&self) -> &'static str {
        "narrow"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let mut gx = Tensor::zeros(inputs[0].shape());
        let len = gy.shape()[self.axis];
        let indices: Vec<usize> = (self.start..self.start + len).collect();
        gx.index_add_inplace(self.axis as isize, &indices, gy)?;
        Ok(vec![Some(gx)])
    }
}

pub fn narrow(x: &Variable, axis: isize, start: usize, len: usize) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let v = x.value().narrow(ax as isize, start, len)?;
    Ok(build_output(Box::new(Narrow { axis: ax, start }), vec![x.clone()], v))
}

struct Concat {
    axis: usize,
}
impl Function for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let mut grads = Vec::with_capacity(inputs.len());
        let mut offset = 0;
        for input in inputs {
            let len = input.shape()[self.axis];
            grads.push(Some(gy.narrow(self.axis as isize, offset, len)?));
            offset += len;
        }
        Ok(grads)
    }
}

pub fn concat(xs: &[&Variable], axis: isize) -> MzResult<Variable> {
    let first = xs
        .first()
        .ok_or_else(|| MzError::InvalidArgument("concat: empty input list".into()))?;
    let ax = normalize_axis(axis, first.ndim())?;
    let values: Vec<Tensor> = xs.iter().map(|x| x.value().clone()).collect();
    let refs: Vec<&Tensor> = values.iter().collect();
    let v = Tensor::concat(&refs, ax as isize)?;
    Ok(build_output(
        Box::new(Concat { axis: ax }),
        xs.iter().map(|x| (*x).clone()).collect(),
        v,
    ))
}

// --- reductions ---

struct Sum {
    axis: Option<usize>,
    keep_dims: bool,
}
impl Function for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let in_shape = inputs[0].shape();
        let g = match self.axis {
            Some(ax) if !self.keep_dims => gy.unsqueeze(ax as isize)?,
            _ => gy.clone(),
        };
        Ok(vec![Some(g.broadcast_to(in_shape)?)])
    }
}

pub fn sum(x: &Variable, axis: Option<isize>, keep_dims: bool) -> MzResult<Variable> {
    let ax = match axis {
        Some(a) => Some(normalize_axis(a, x.ndim())?),
        None => None,
    };
    let v = x.value().sum(ax.map(|a| a as isize), keep_dims)?;
    Ok(build_output(
        Box::new(Sum {
            axis: ax,
            keep_dims,
        }),
        vec![x.clone()],
        v,
    ))
}

struct Mean {
    axis: Option<usize>,
    keep_dims: bool,
    count: usize,
}
impl Function for Mean {
    fn name(&self) -> &'static str {
        "mean"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let in_shape = inputs[0].shape();
        let g = match self.axis {
            Some(ax) if !self.keep_dims => gy.unsqueeze(ax as isize)?,
            _ => gy.clone(),
        };
        Ok(vec![Some(
            g.broadcast_to(in_shape)?.mul_scalar(1.0 / self.count as f32),
        )])
    }
}

pub fn mean(x: &Variable, axis: Option<isize>, keep_dims: bool) -> MzResult<Variable> {
    let ax = match axis {
        Some(a) => Some(normalize_axis(a, x.ndim())?),
        None => None,
    };
    let count = match ax {
        Some(a) => x.shape()[a],
        None => x.value().len(),
    };
    let v = x.value().mean(ax.map(|a| a as isize), keep_dims)?;
    Ok(build_output(
        Box::new(Mean {
            axis: ax,
            keep_dims,
            count,
        }),
        vec![x.clone()],
        v,
    ))
}

/// Routes 1.0 to the first extremum of each lane, ties broken by lowest
/// index.
fn extremum_mask(x: &Tensor, axis: usize, largest: bool) -> Tensor {
    let mut mask = ArrayD::<f32>::zeros(x.as_array().raw_dim());
    for (lane_x, mut lane_m) in x
        .as_array()
        .lanes(Axis(axis))
        .into_iter()
        .zip(mask.lanes_mut(Axis(axis)))
    {
        let mut best = 0usize;
        for (i, &v) in lane_x.iter().enumerate() {
            let better = if largest { v > lane_x[best] } else { v < lane_x[best] };
            if better {
                best = i;
            }
        }
        lane_m[best] = 1.0;
    }
    Tensor::new(mask)
}

struct MaxReduce {
    axis: usize,
    keep_dims: bool,
    largest: bool,
}
impl Function for MaxReduce {
    fn name(&self) -> &'static str {
        "max"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let mask = extremum_mask(&inputs[0], self.axis, self.largest);
        let g = if self.keep_dims {
            gy.clone()
        } else {
            gy.unsqueeze(self.axis as isize)?
        };
        Ok(vec![Some(mask.mul_t(&g)?)])
    }
}

pub fn max(x: &Variable, axis: isize, keep_dims: bool) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let v = x.value().max_reduce(ax as isize, keep_dims)?;
    Ok(build_output(
        Box::new(MaxReduce {
            axis: ax,
            keep_dims,
            largest: true,
        }),
        vec![x.clone()],
        v,
    ))
}

pub fn min(x: &Variable, axis: isize, keep_dims: bool) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let v = x.value().min_reduce(ax as isize, keep_dims)?;
    Ok(build_output(
        Box::new(MaxReduce {
            axis: ax,
            keep_dims,
            largest: false,
        }),
        vec![x.clone()],
        v,
    ))
}

// --- softmax family ---

struct Softmax {
    axis: usize,
    y: Tensor,
}
impl Function for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // dx = y * (dy - (dy * y).sum(axis, keepdims))
        let gyy = gy.mul_t(&self.y)?;
        let summed = gyy.sum(Some(self.axis as isize), true)?;
        Ok(vec![Some(self.y.mul_t(&gy.sub_t(&summed)?)?)])
    }
}

pub fn softmax(x: &Variable, axis: isize) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let y = x.value().softmax(ax as isize)?;
    Ok(build_output(
        Box::new(Softmax {
            axis: ax,
            y: y.clone(),
        }),
        vec![x.clone()],
        y,
    ))
}

struct LogSoftmax {
    axis: usize,
    softmax_y: Tensor,
}
impl Function for LogSoftmax {
    fn name(&self) -> &'static str {
        "log_softmax"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // dx = dy - softmax(x) * dy.sum(axis, keepdims)
        let summed = gy.sum(Some(self.axis as isize), true)?;
        Ok(vec![Some(gy.sub_t(&self.softmax_y.mul_t(&summed)?)?)])
    }
}

pub fn log_softmax(x: &Variable, axis: isize) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let (v, softmax_y) = {
        let xv = x.value();
        (xv.log_softmax(ax as isize)?, xv.softmax(ax as isize)?)
    };
    Ok(build_output(
        Box::new(LogSoftmax {
            axis: ax,
            softmax_y,
        }),
        vec![x.clone()],
        v,
    ))
}

// --- gather / mask ---

struct IndexSelect {
    axis: usize,
    indices: Vec<usize>,
}
impl Function for IndexSelect {
    fn name(&self) -> &'static str {
        "index_select"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        // Scatter-add the selected rows back into a zero tensor.
        let mut gx = Tensor::zeros(inputs[0].shape());
        gx.index_add_inplace(self.axis as isize, &self.indices, gy)?;
        Ok(vec![Some(gx)])
    }
}

pub fn index_select(x: &Variable, axis: isize, indices: &[usize]) -> MzResult<Variable> {
    let ax = normalize_axis(axis, x.ndim())?;
    let v = x.value().index_select(ax as isize, indices)?;
    Ok(build_output(
        Box::new(IndexSelect {
            axis: ax,
            indices: indices.to_vec(),
        }),
        vec![x.clone()],
        v,
    ))
}

struct GatherLast {
    index: ArrayD<usize>,
}
impl Function for GatherLast {
    fn name(&self) -> &'static str {
        "gather"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let mut gx = Tensor::zeros(inputs[0].shape());
        gx.scatter_add_last(&self.index, gy)?;
        Ok(vec![Some(gx)])
    }
}

/// Picks one scalar per position along the last axis; the integer index
/// tensor is constant state, never differentiated.
pub fn gather_last(x: &Variable, index: &ArrayD<usize>) -> MzResult<Variable> {
    let v = x.value().gather_last(index)?;
    Ok(build_output(
        Box::new(GatherLast {
            index: index.clone(),
        }),
        vec![x.clone()],
        v,
    ))
}

struct MaskedFill {
    mask: Tensor,
}
impl Function for MaskedFill {
    fn name(&self) -> &'static str {
        "masked_fill"
    }
    fn backward(&self, inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        let keep = self.mask.map(|m| if m != 0.0 { 0.0 } else { 1.0 });
        Ok(vec![Some(gy.mul_t(&keep)?.sum_to(inputs[0].shape())?)])
    }
}

/// Fills positions where `mask` is truthy with `value`; gradient is zeroed
/// there. The mask itself is constant state.
pub fn masked_fill(x: &Variable, mask: &Tensor, value: f32) -> MzResult<Variable> {
    let v = x.value().masked_fill(mask, value)?;
    Ok(build_output(
        Box::new(MaskedFill { mask: mask.clone() }),
        vec![x.clone()],
        v,
    ))
}

struct Dropout {
    mask: Tensor,
}
impl Function for Dropout {
    fn name(&self) -> &'static str {
        "dropout"
    }
    fn backward(&self, _inputs: &[Tensor], gy: &Tensor) -> MzResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(gy.mul_t(&self.mask)?)])
    }
}

/// Inverted dropout: keep probability `1-p`, survivors scaled by `1/(1-p)`.
/// Identity when not training.
pub fn dropout(x: &Variable, p: f32, training: bool) -> MzResult<Variable> {
    if !(0.0..1.0).contains(&p) {
        return Err(MzError::InvalidArgument(format!(
            "dropout probability {} outside [0, 1)",
            p
        )));
    }
    if !training || p == 0.0 {
        return Ok(x.clone());
    }
    let scale = 1.0 / (1.0 - p);
    let shape = x.shape();
    let mask = rng::with_rng(|r| {
        let data: Vec<f32> = (0..shape.iter().product::<usize>())
            .map(|_| if r.gen::<f32>() >= p { scale } else { 0.0 })
            .collect();
        Tensor::from_vec(data, &shape)
    })?;
    let v = x.value().mul_t(&mask)?;
    Ok(build_output(Box::new(Dropout { mask }), vec![x.clone()], v))
}

// --- comparisons (never differentiable) ---

pub fn gt(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let (av, bv) = (a.value(), b.value());
    Ok(Variable::new(av.gt_t(&bv)?))
}

pub fn lt(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let (av, bv) = (a.value(), b.value());
    Ok(Variable::new(av.lt_t(&bv)?))
}

pub fn eq(a: &Variable, b: &Variable) -> MzResult<Variable> {
    let (av, bv) = (a.value(), b.value());
    Ok(Variable::new(av.eq_t(&bv)?))
}

// --- composed activations ---

/// Tanh-approximated GELU, composed from primitive operators.
pub fn gelu(x: &Variable) -> MzResult<Variable> {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    let x3 = powf(x, 3.0)?;
    let inner = add(x, &mul_scalar(&x3, 0.044_715)?)?;
    let t = tanh(&mul_scalar(&inner, SQRT_2_OVER_PI)?)?;
    mul(&mul_scalar(x, 0.5)?, &add_scalar(&t, 1.0)?)
}

/// `swish(x) = x * sigmoid(x)`, the SwiGLU gate activation.
pub fn swish(x: &Variable) -> MzResult<Variable> {
    mul(x, &sigmoid(x)?)
}

// Method-style surface mirroring the free functions.
impl Variable {
    pub fn add(&self, other: &Variable) -> MzResult<Variable> {
        add(self, other)
    }
    pub fn sub(&self, other: &Variable) -> MzResult<Variable> {
        sub(self, other)
    }
    pub fn mul(&self, other: &Variable) -> MzResult<Variable> {
        mul(self, other)
    }
    pub fn div(&self, other: &Variable) -> MzResult<Variable> {
        div(self, other)
    }
    pub fn neg(&self) -> MzResult<Variable> {
        neg(self)
    }
    pub fn add_scalar(&self, s: f32) -> MzResult<Variable> {
        add_scalar(self, s)
    }
    pub fn mul_scalar(&self, s: f32) -> MzResult<Variable> {
        mul_scalar(self, s)
    }
    pub fn exp(&self) -> MzResult<Variable> {
        exp(self)
    }
    pub fn ln(&self) -> MzResult<Variable> {
        ln(self)
    }
    pub fn sqrt(&self) -> MzResult<Variable> {
        sqrt(self)
    }
    pub fn tanh(&self) -> MzResult<Variable> {
        tanh(self)
    }
    pub fn sigmoid(&self) -> MzResult<Variable> {
        sigmoid(self)
    }
    pub fn relu(&self) -> MzResult<Variable> {
        relu(self)
    }
    pub fn powf(&self, p: f32) -> MzResult<Variable> {
        powf(self, p)
    }
    pub fn clamp(&self, min: f32, max: f32) -> MzResult<Variable> {
        clamp(self, min, max)
    }
    pub fn matmul(&self, other: &Variable) -> MzResult<Variable> {
        matmul(self, other)
    }
    pub fn reshape(&self, dims: &[usize]) -> MzResult<Variable> {
        reshape(self, dims)
    }
    pub fn broadcast_to(&self, dims: &[usize]) -> MzResult<Variable> {
        broadcast_to(self, dims)
    }
    pub fn permute(&self, axes: &[usize]) -> MzResult<Variable> {
        permute(self, axes)
    }
    pub fn transpose_last(&self) -> MzResult<Variable> {
        transpose_last(self)
    }
    pub fn unsqueeze(&self, axis: isize) -> MzResult<Variable> {
        unsqueeze(self, axis)
    }
    pub fn squeeze(&self, axis: isize) -> MzResult<Variable> {
        squeeze(self, axis)
    }
    pub fn sum(&self, axis: Option<isize>, keep_dims: bool) -> MzResult<Variable> {
        sum(self, axis, keep_dims)
    }
    pub fn mean(&self, axis: Option<isize>, keep_dims: bool) -> MzResult<Variable> {
        mean(self, axis, keep_dims)
    }
    pub fn softmax(&self, axis: isize) -> MzResult<Variable> {
        softmax(self, axis)
    }
    pub fn log_softmax(&self, axis: isize) -> MzResult<Variable> {
        log_softmax(self, axis)
    }
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> MzResult<Variable> {
        masked_fill(self, mask, value)
    }
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> MzResult<Variable> {
        narrow(self, axis, start, len)
    }
    pub fn index_select(&self, axis: isize, indices: &[usize]) -> MzResult<Variable> {
        index_select(self, axis, indices)
    }
}
