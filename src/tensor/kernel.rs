//! Dense CPU kernels: reductions, matmul, shape transforms, softmax and the
//! index/mask operations the autograd operators are built on.

use super::Tensor;
use crate::types::{broadcast_shape, normalize_axis};
use crate::{MzError, MzResult};
use ndarray::{concatenate, ArrayD, Axis, Ix2, Ix3, IxDyn, Slice, Zip};

impl Tensor {
    // --- shape transforms ---

    pub fn reshape(&self, dims: &[usize]) -> MzResult<Tensor> {
        let new_size: usize = dims.iter().product();
        if new_size != self.len() {
            return Err(MzError::shapes("reshape", self.shape(), dims));
        }
        let arr = self
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(dims))
            .map_err(|_| MzError::shapes("reshape", self.shape(), dims))?;
        Ok(Tensor::new(arr))
    }

    pub fn broadcast_to(&self, dims: &[usize]) -> MzResult<Tensor> {
        let view = self
            .data
            .broadcast(IxDyn(dims))
            .ok_or_else(|| MzError::shapes("broadcast_to", self.shape(), dims))?;
        Ok(Tensor::new(view.to_owned()))
    }

    /// Inserts a size-1 axis. `axis` may equal the current rank to append.
    pub fn unsqueeze(&self, axis: isize) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim() + 1)?;
        Ok(Tensor::new(self.data.clone().insert_axis(Axis(ax))))
    }

    pub fn squeeze(&self, axis: isize) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        if self.shape()[ax] != 1 {
            return Err(MzError::InvalidArgument(format!(
                "squeeze: axis {} has size {}, expected 1",
                ax,
                self.shape()[ax]
            )));
        }
        Ok(Tensor::new(self.data.clone().index_axis_move(Axis(ax), 0)))
    }

    pub fn permute(&self, axes: &[usize]) -> MzResult<Tensor> {
        if axes.len() != self.ndim() {
            return Err(MzError::shapes("permute", self.shape(), axes));
        }
        let mut seen = vec![false; axes.len()];
        for &a in axes {
            if a >= axes.len() || seen[a] {
                return Err(MzError::InvalidArgument(format!(
                    "permute: {:?} is not a permutation of 0..{}",
                    axes,
                    axes.len()
                )));
            }
            seen[a] = true;
        }
        let view = self.data.view().permuted_axes(IxDyn(axes));
        Ok(Tensor::new(view.as_standard_layout().into_owned()))
    }

    /// Swaps the last two axes.
    pub fn transpose_last(&self) -> MzResult<Tensor> {
        let n = self.ndim();
        if n < 2 {
            return Err(MzError::InvalidArgument(
                "transpose requires at least 2 dimensions".into(),
            ));
        }
        let mut view = self.data.view();
        view.swap_axes(n - 2, n - 1);
        Ok(Tensor::new(view.as_standard_layout().into_owned()))
    }

    /// Replicates the tensor along each axis by the given factor (tile).
    pub fn repeat(&self, factors: &[usize]) -> MzResult<Tensor> {
        if factors.len() != self.ndim() {
            return Err(MzError::shapes("repeat", self.shape(), factors));
        }
        if factors.iter().any(|&f| f == 0) {
            return Err(MzError::InvalidArgument("repeat: zero factor".into()));
        }
        let mut cur = self.data.clone();
        for (ax, &f) in factors.iter().enumerate() {
            if f == 1 {
                continue;
            }
            let views: Vec<_> = (0..f).map(|_| cur.view()).collect();
            cur = concatenate(Axis(ax), &views)
                .map_err(|e| MzError::InvalidArgument(format!("repeat: {e}")))?;
        }
        Ok(Tensor::new(cur))
    }

    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let size = self.shape()[ax];
        if start + len > size {
            return Err(MzError::IndexOutOfRange {
                index: start + len,
                axis: ax,
                size,
            });
        }
        Ok(Tensor::new(
            self.data
                .slice_axis(Axis(ax), Slice::from(start..start + len))
                .to_owned(),
        ))
    }

    pub fn concat(tensors: &[&Tensor], axis: isize) -> MzResult<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| MzError::InvalidArgument("concat: empty input list".into()))?;
        let ax = normalize_axis(axis, first.ndim())?;
        let views: Vec<_> = tensors.iter().map(|t| t.data.view()).collect();
        let arr = concatenate(Axis(ax), &views)
            .map_err(|_| MzError::shapes("concat", first.shape(), tensors.last().unwrap().shape()))?;
        Ok(Tensor::new(arr))
    }

    // --- gather / scatter ---

    pub fn index_select(&self, axis: isize, indices: &[usize]) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let size = self.shape()[ax];
        for &i in indices {
            if i >= size {
                return Err(MzError::IndexOutOfRange {
                    index: i,
                    axis: ax,
                    size,
                });
            }
        }
        Ok(Tensor::new(self.data.select(Axis(ax), indices)))
    }

    /// Scatter-add: accumulates slabs of `src` into `self` at `indices`
    /// along `axis`. Inverse of `index_select`; repeated indices sum.
    pub fn index_add_inplace(
        &mut self,
        axis: isize,
        indices: &[usize],
        src: &Tensor,
    ) -> MzResult<()> {
        let ax = normalize_axis(axis, self.ndim())?;
        let size = self.shape()[ax];
        if src.shape()[ax] != indices.len() {
            return Err(MzError::shapes("index_add", src.shape(), self.shape()));
        }
        for (pos, &idx) in indices.iter().enumerate() {
            if idx >= size {
                return Err(MzError::IndexOutOfRange {
                    index: idx,
                    axis: ax,
                    size,
                });
            }
            let mut dst = self.data.slice_axis_mut(Axis(ax), Slice::from(idx..idx + 1));
            let s = src.data.slice_axis(Axis(ax), Slice::from(pos..pos + 1));
            dst += &s;
        }
        Ok(())
    }

    /// Picks one element per row along the last axis: `out[..] = self[.., index[..]]`.
    pub fn gather_last(&self, index: &ArrayD<usize>) -> MzResult<Tensor> {
        let n = self.ndim();
        if n == 0 || index.shape() != &self.shape()[..n - 1] {
            return Err(MzError::shapes("gather", self.shape(), index.shape()));
        }
        let classes = self.shape()[n - 1];
        let rows: usize = self.shape()[..n - 1].iter().product();
        let flat = self.reshape(&[rows, classes])?;
        let flat2 = flat.data.into_dimensionality::<Ix2>().unwrap();
        let mut out = Vec::with_capacity(rows);
        for (row, &ix) in index.iter().enumerate() {
            if ix >= classes {
                return Err(MzError::IndexOutOfRange {
                    index: ix,
                    axis: n - 1,
                    size: classes,
                });
            }
            out.push(flat2[[row, ix]]);
        }
        Tensor::from_vec(out, index.shape())
    }

    /// Inverse of `gather_last`: adds `src[..]` into `self[.., index[..]]`.
    pub fn scatter_add_last(&mut self, index: &ArrayD<usize>, src: &Tensor) -> MzResult<()> {
        let n = self.ndim();
        if n == 0 || index.shape() != &self.shape()[..n - 1] || src.shape() != index.shape() {
            return Err(MzError::shapes("scatter_add", self.shape(), index.shape()));
        }
        let classes = self.shape()[n - 1];
        let self_shape = self.shape().to_vec();
        let mut flat = self
            .data
            .view_mut()
            .into_shape((index.len(), classes))
            .map_err(|_| MzError::shapes("scatter_add", &self_shape, index.shape()))?;
        for (row, (&ix, &v)) in index.iter().zip(src.iter()).enumerate() {
            if ix >= classes {
                return Err(MzError::IndexOutOfRange {
                    index: ix,
                    axis: n - 1,
                    size: classes,
                });
            }
            flat[[row, ix]] += v;
        }
        Ok(())
    }

    /// Replaces positions where `mask` is truthy (non-zero) with `value`.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> MzResult<Tensor> {
        self.broadcast_with(mask, "masked_fill", move |v, m| if m != 0.0 { value } else { v })
    }

    // --- reductions ---

    pub fn sum(&self, axis: Option<isize>, keep_dims: bool) -> MzResult<Tensor> {
        match axis {
            None => {
                let total = self.data.sum();
                if keep_dims {
                    Ok(Tensor::full(&vec![1; self.ndim()], total))
                } else {
                    Ok(Tensor::scalar(total))
                }
            }
            Some(a) => {
                let ax = normalize_axis(a, self.ndim())?;
                let mut r = self.data.sum_axis(Axis(ax));
                if keep_dims {
                    r = r.insert_axis(Axis(ax));
                }
                Ok(Tensor::new(r))
            }
        }
    }

    pub fn mean(&self, axis: Option<isize>, keep_dims: bool) -> MzResult<Tensor> {
        let count = match axis {
            None => self.len(),
            Some(a) => self.shape()[normalize_axis(a, self.ndim())?],
        };
        if count == 0 {
            return Err(MzError::InvalidArgument("mean over empty axis".into()));
        }
        Ok(self.sum(axis, keep_dims)?.mul_scalar(1.0 / count as f32))
    }

    pub fn sum_all(&self) -> f32 {
        self.data.sum()
    }

    pub fn mean_all(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            self.data.sum() / self.len() as f32
        }
    }

    pub fn max_reduce(&self, axis: isize, keep_dims: bool) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let mut r = self
            .data
            .map_axis(Axis(ax), |lane| lane.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v)));
        if keep_dims {
            r = r.insert_axis(Axis(ax));
        }
        Ok(Tensor::new(r))
    }

    pub fn min_reduce(&self, axis: isize, keep_dims: bool) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let mut r = self
            .data
            .map_axis(Axis(ax), |lane| lane.iter().fold(f32::INFINITY, |m, &v| m.min(v)));
        if keep_dims {
            r = r.insert_axis(Axis(ax));
        }
        Ok(Tensor::new(r))
    }

    /// Population variance along `axis`.
    pub fn variance(&self, axis: isize, keep_dims: bool) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let count = self.shape()[ax];
        if count == 0 {
            return Err(MzError::InvalidArgument("variance over empty axis".into()));
        }
        let mut r = self.data.map_axis(Axis(ax), |lane| {
            let mean = lane.sum() / count as f32;
            lane.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / count as f32
        });
        if keep_dims {
            r = r.insert_axis(Axis(ax));
        }
        Ok(Tensor::new(r))
    }

    /// Reduces by summation back to `target`: the inverse shape transform of
    /// a broadcast. Sums extra leading axes, then every axis where the
    /// target holds a 1 against a larger source dim.
    pub fn sum_to(&self, target: &[usize]) -> MzResult<Tensor> {
        if self.shape() == target {
            return Ok(self.clone());
        }
        let mut data = self.data.clone();
        while data.ndim() > target.len() {
            data = data.sum_axis(Axis(0));
        }
        if data.ndim() != target.len() {
            return Err(MzError::shapes("sum_to", self.shape(), target));
        }
        for (i, &t) in target.iter().enumerate() {
            if t == 1 && data.shape()[i] > 1 {
                data = data.sum_axis(Axis(i)).insert_axis(Axis(i));
            }
        }
        if data.shape() != target {
            return Err(MzError::shapes("sum_to", self.shape(), target));
        }
        Ok(Tensor::new(data))
    }

    // --- linear algebra ---

    /// 2-D and batched matmul. Leading dims broadcast NumPy-style; the last
    /// two axes contract as `[.., m, k] x [.., k, n] -> [.., m, n]`.
    #[tracing::instrument(skip(self, rhs), name = "kernel_matmul")]
    pub fn matmul(&self, rhs: &Tensor) -> MzResult<Tensor> {
        let (an, bn) = (self.ndim(), rhs.ndim());
        if an < 2 || bn < 2 {
            return Err(MzError::shapes("matmul", self.shape(), rhs.shape()));
        }
        let (m, ka) = (self.shape()[an - 2], self.shape()[an - 1]);
        let (kb, n) = (rhs.shape()[bn - 2], rhs.shape()[bn - 1]);
        if ka != kb {
            return Err(MzError::shapes("matmul", self.shape(), rhs.shape()));
        }

        // Fast path for plain 2-D.
        if an == 2 && bn == 2 {
            let a2 = self.data.view().into_dimensionality::<Ix2>().unwrap();
            let b2 = rhs.data.view().into_dimensionality::<Ix2>().unwrap();
            return Ok(Tensor::new(a2.dot(&b2).into_dyn()));
        }

        let batch = broadcast_shape("matmul", &self.shape()[..an - 2], &rhs.shape()[..bn - 2])?;
        let nb: usize = batch.iter().product();

        let mut a_shape = batch.clone();
        a_shape.extend_from_slice(&[m, ka]);
        let mut b_shape = batch.clone();
        b_shape.extend_from_slice(&[ka, n]);

        let a3 = self
            .broadcast_to(&a_shape)?
            .reshape(&[nb, m, ka])?
            .data
            .into_dimensionality::<Ix3>()
            .unwrap();
        let b3 = rhs
            .broadcast_to(&b_shape)?
            .reshape(&[nb, ka, n])?
            .data
            .into_dimensionality::<Ix3>()
            .unwrap();

        let mut out3 = ndarray::Array3::<f32>::zeros((nb, m, n));
        let zip = Zip::from(out3.outer_iter_mut())
            .and(a3.outer_iter())
            .and(b3.outer_iter());
        #[cfg(feature = "rayon")]
        zip.par_for_each(|mut o, a, b| o.assign(&a.dot(&b)));
        #[cfg(not(feature = "rayon"))]
        zip.for_each(|mut o, a, b| o.assign(&a.dot(&b)));

        let mut out_shape = batch;
        out_shape.extend_from_slice(&[m, n]);
        Tensor::new(out3.into_dyn()).reshape(&out_shape)
    }

    // --- softmax family ---

    /// Softmax along `axis`, stabilized by the per-lane max. A lane that is
    /// `-inf` everywhere (fully masked) yields zeros, not NaN.
    pub fn softmax(&self, axis: isize) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let mut out = self.data.as_standard_layout().into_owned();
        for mut lane in out.lanes_mut(Axis(ax)) {
            let max = lane.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            if max == f32::NEG_INFINITY {
                lane.fill(0.0);
                continue;
            }
            let mut sum = 0.0;
            for v in lane.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in lane.iter_mut() {
                *v /= sum;
            }
        }
        Ok(Tensor::new(out))
    }

    /// `log_softmax(x) = x - logsumexp(x)` along `axis`; fully masked lanes
    /// follow the softmax policy and become zeros.
    pub fn log_softmax(&self, axis: isize) -> MzResult<Tensor> {
        let ax = normalize_axis(axis, self.ndim())?;
        let mut out = self.data.as_standard_layout().into_owned();
        for mut lane in out.lanes_mut(Axis(ax)) {
            let max = lane.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            if max == f32::NEG_INFINITY {
                lane.fill(0.0);
                continue;
            }
            let sum: f32 = lane.iter().map(|&v| (v - max).exp()).sum();
            let lse = max + sum.ln();
            for v in lane.iter_mut() {
                *v -= lse;
            }
        }
        Ok(Tensor::new(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_batched_broadcasts_leading_dims() {
        let a = Tensor::from_vec((0..12).map(|v| v as f32).collect(), &[2, 2, 3]).unwrap();
        let b = Tensor::from_vec((0..6).map(|v| v as f32).collect(), &[3, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2, 2]);
        // First batch, first row: [0,1,2] . [[0,1],[2,3],[4,5]] = [10, 13]
        assert_eq!(c.get(&[0, 0, 0]).unwrap(), 10.0);
        assert_eq!(c.get(&[0, 0, 1]).unwrap(), 13.0);
    }

    #[test]
    fn sum_to_reverses_broadcast() {
        let g = Tensor::ones(&[4, 3, 5]);
        let r = g.sum_to(&[1, 5]).unwrap();
        assert_eq!(r.shape(), &[1, 5]);
        assert_eq!(r.get(&[0, 0]).unwrap(), 12.0);
    }

    #[test]
    fn softmax_fully_masked_lane_is_zero() {
        let x = Tensor::from_vec(
            vec![f32::NEG_INFINITY, f32::NEG_INFINITY, 1.0, 2.0],
            &[2, 2],
        )
        .unwrap();
        let y = x.softmax(-1).unwrap();
        assert_eq!(y.get(&[0, 0]).unwrap(), 0.0);
        assert_eq!(y.get(&[0, 1]).unwrap(), 0.0);
        let row1 = y.get(&[1, 0]).unwrap() + y.get(&[1, 1]).unwrap();
        assert!((row1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gather_scatter_round_trip() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let idx = ArrayD::from_shape_vec(IxDyn(&[2]), vec![2usize, 0]).unwrap();
        let picked = x.gather_last(&idx).unwrap();
        assert_eq!(picked.to_vec(), vec![3.0, 4.0]);

        let mut z = Tensor::zeros(&[2, 3]);
        z.scatter_add_last(&idx, &picked).unwrap();
        assert_eq!(z.get(&[0, 2]).unwrap(), 3.0);
        assert_eq!(z.get(&[1, 0]).unwrap(), 4.0);
    }
}
