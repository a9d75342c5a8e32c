//! Reduction and Concatenation Kernels
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use super::{finish, float_result_dtype, float_values};
use crate::error::{TensorError, TensorResult};
use crate::shape::{normalize_dim, numel, unravel_index, Shape};
use crate::tensor::Tensor;

/// Computes the result shape of a mean over `dims`.
pub fn reduced_shape(shape: &[usize], dims: &[i64], keepdim: bool) -> TensorResult<Shape> {
    let mut reduce = vec![false; shape.len()];
    for &d in dims {
        reduce[normalize_dim(d, shape.len())?] = true;
    }
    Ok(shape
        .iter()
        .zip(reduce.iter())
        .filter_map(|(&s, &r)| match (r, keepdim) {
            (true, true) => Some(1),
            (true, false) => None,
            (false, _) => Some(s),
        })
        .collect())
}

/// Mean over a set of dimensions.
pub fn mean(x: &Tensor, dims: &[i64], keepdim: bool) -> TensorResult<Tensor> {
    let dtype = float_result_dtype(&[x], "mean")?;
    let kept = reduced_shape(x.shape(), dims, true)?;
    let out_shape = reduced_shape(x.shape(), dims, keepdim)?;
    let data = float_values(x, "mean")?;
    let count = (numel(x.shape()) / numel(&kept).max(1)).max(1);

    let out_strides = crate::shape::contiguous_strides(&kept);
    let mut sums = vec![0.0f32; numel(&kept)];
    for (i, v) in data.iter().enumerate() {
        let index = unravel_index(i, x.shape());
        let pos: isize = index
            .iter()
            .zip(kept.iter())
            .zip(out_strides.iter())
            .map(|((&ix, &k), &s)| if k == 1 { 0 } else { ix as isize * s })
            .sum();
        sums[pos as usize] += v;
    }
    let values = sums.into_iter().map(|s| s / count as f32).collect();
    Ok(finish(values, &out_shape, dtype, x.layout()))
}

/// Concatenates tensors along a dimension.
pub fn cat(tensors: &[Tensor], dim: i64) -> TensorResult<Tensor> {
    let first = tensors
        .first()
        .ok_or_else(|| TensorError::invalid_operation("cat of an empty list"))?;
    let refs: Vec<&Tensor> = tensors.iter().collect();
    let dtype = float_result_dtype(&refs, "cat")?;
    let d = normalize_dim(dim, first.ndim())?;

    let mut out_shape = Shape::from_slice(first.shape());
    out_shape[d] = 0;
    for t in tensors {
        let same_rank = t.ndim() == first.ndim();
        let compatible = same_rank
            && t.shape()
                .iter()
                .zip(first.shape())
                .enumerate()
                .all(|(i, (a, b))| i == d || a == b);
        if !compatible {
            return Err(TensorError::shape_mismatch(first.shape(), t.shape()));
        }
        out_shape[d] += t.shape()[d];
    }

    let outer: usize = first.shape()[..d].iter().product();
    let pieces: Vec<(Vec<f32>, usize)> = tensors
        .iter()
        .map(|t| {
            let chunk: usize = t.shape()[d..].iter().product();
            (t.to_vec(), chunk)
        })
        .collect();
    let mut data = Vec::with_capacity(numel(&out_shape));
    for o in 0..outer {
        for (values, chunk) in &pieces {
            data.extend_from_slice(&values[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok(finish(data, &out_shape, dtype, first.layout()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_dims() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let m = mean(&x, &[1], false).unwrap();
        assert_eq!(m.shape(), &[2]);
        assert_eq!(m.to_vec(), vec![2.0, 5.0]);
        let m = mean(&x, &[0], true).unwrap();
        assert_eq!(m.shape(), &[1, 3]);
        assert_eq!(m.to_vec(), vec![2.5, 3.5, 4.5]);
    }

    #[test]
    fn test_cat() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let b = Tensor::from_vec(vec![3.0, 4.0, 5.0, 6.0], &[2, 2]).unwrap();
        let c = cat(&[a.clone(), b.clone()], 0).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(cat(&[a, b], 1).is_err());
    }
}
