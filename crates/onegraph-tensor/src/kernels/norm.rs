//! Normalization Kernels
//!
//! Inference-mode batch normalization, layer normalization and softmax.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use super::{finish, float_result_dtype, float_values};
use crate::error::{TensorError, TensorResult};
use crate::shape::{normalize_dim, numel};
use crate::tensor::Tensor;

/// Batch normalization over channel dimension 1 with running statistics.
pub fn batch_norm(
    x: &Tensor,
    running_mean: &Tensor,
    running_var: &Tensor,
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    eps: f32,
) -> TensorResult<Tensor> {
    if x.ndim() < 2 {
        return Err(TensorError::invalid_operation(format!(
            "batch_norm expects at least 2 dimensions, got {:?}",
            x.shape()
        )));
    }
    let dtype = float_result_dtype(&[x], "batch_norm")?;
    let channels = x.shape()[1];
    let inner: usize = x.shape()[2..].iter().product();

    let per_channel = |t: Option<&Tensor>, default: f32| -> TensorResult<Vec<f32>> {
        match t {
            Some(t) if t.numel() == channels => float_values(t, "batch_norm"),
            Some(t) => Err(TensorError::shape_mismatch(&[channels], t.shape())),
            None => Ok(vec![default; channels]),
        }
    };
    let mean = per_channel(Some(running_mean), 0.0)?;
    let var = per_channel(Some(running_var), 1.0)?;
    let gamma = per_channel(weight, 1.0)?;
    let beta = per_channel(bias, 0.0)?;

    let mut data = float_values(x, "batch_norm")?;
    for (i, v) in data.iter_mut().enumerate() {
        let c = (i / inner.max(1)) % channels;
        *v = (*v - mean[c]) / (var[c] + eps).sqrt() * gamma[c] + beta[c];
    }
    Ok(finish(data, x.shape(), dtype, x.layout()))
}

/// Layer normalization over the trailing `normalized_shape` dimensions.
pub fn layer_norm(
    x: &Tensor,
    normalized_shape: &[usize],
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    eps: f32,
) -> TensorResult<Tensor> {
    let dtype = float_result_dtype(&[x], "layer_norm")?;
    let rank = normalized_shape.len();
    if rank > x.ndim() || &x.shape()[x.ndim() - rank..] != normalized_shape {
        return Err(TensorError::shape_mismatch(normalized_shape, x.shape()));
    }
    let group = numel(normalized_shape).max(1);
    let gamma = match weight {
        Some(w) => float_values(w, "layer_norm")?,
        None => vec![1.0; group],
    };
    let beta = match bias {
        Some(b) => float_values(b, "layer_norm")?,
        None => vec![0.0; group],
    };
    if gamma.len() != group || beta.len() != group {
        return Err(TensorError::shape_mismatch(normalized_shape, &[gamma.len()]));
    }

    let mut data = float_values(x, "layer_norm")?;
    for chunk in data.chunks_mut(group) {
        let mean = chunk.iter().sum::<f32>() / group as f32;
        let var = chunk.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / group as f32;
        let denom = (var + eps).sqrt();
        for (j, v) in chunk.iter_mut().enumerate() {
            *v = (*v - mean) / denom * gamma[j] + beta[j];
        }
    }
    Ok(finish(data, x.shape(), dtype, x.layout()))
}

/// Softmax along one dimension.
pub fn softmax(x: &Tensor, dim: i64) -> TensorResult<Tensor> {
    let dtype = float_result_dtype(&[x], "softmax")?;
    let d = normalize_dim(dim, x.ndim())?;
    let shape = x.shape();
    let size = shape[d];
    let inner: usize = shape[d + 1..].iter().product();
    let outer: usize = shape[..d].iter().product();

    let mut data = float_values(x, "softmax")?;
    for o in 0..outer {
        for i in 0..inner {
            let idx = |k: usize| (o * size + k) * inner + i;
            let max = (0..size).map(|k| data[idx(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for k in 0..size {
                let e = (data[idx(k)] - max).exp();
                data[idx(k)] = e;
                sum += e;
            }
            for k in 0..size {
                data[idx(k)] /= sum;
            }
        }
    }
    Ok(finish(data, shape, dtype, x.layout()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_norm() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[1, 2, 2]).unwrap();
        let mean = Tensor::from_vec(vec![1.0, 3.0], &[2]).unwrap();
        let var = Tensor::from_vec(vec![1.0, 4.0], &[2]).unwrap();
        let y = batch_norm(&x, &mean, &var, None, None, 0.0).unwrap();
        assert_eq!(y.to_vec(), vec![0.0, 1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_layer_norm() {
        let x = Tensor::from_vec(vec![1.0, 3.0, 2.0, 2.0], &[2, 2]).unwrap();
        let y = layer_norm(&x, &[2], None, None, 0.0).unwrap();
        let v = y.to_vec();
        assert!((v[0] + 1.0).abs() < 1e-5);
        assert!((v[1] - 1.0).abs() < 1e-5);
        assert!(layer_norm(&x, &[3], None, None, 1e-5).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let y = softmax(&x, -1).unwrap().to_vec();
        assert!((y[0] + y[1] + y[2] - 1.0).abs() < 1e-5);
        let y = softmax(&x, 0).unwrap().to_vec();
        assert!((y[0] + y[3] - 1.0).abs() < 1e-5);
    }
}
