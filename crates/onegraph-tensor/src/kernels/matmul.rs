//! Matrix Multiplication Kernels
//!
//! Batched matmul with broadcasting batch dimensions, bmm and linear.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rayon::prelude::*;

use super::{expect_rank, finish, float_result_dtype};
use crate::error::{TensorError, TensorResult};
use crate::shape::{broadcast_shape, numel, Shape};
use crate::tensor::Tensor;

/// Computes the result shape of `matmul(a, b)`.
pub fn matmul_shape(a: &[usize], b: &[usize]) -> TensorResult<Shape> {
    if a.is_empty() || b.is_empty() {
        return Err(TensorError::invalid_operation("matmul of a 0-d tensor"));
    }
    let a2: Shape = if a.len() == 1 { Shape::from_slice(&[1, a[0]]) } else { Shape::from_slice(a) };
    let b2: Shape = if b.len() == 1 { Shape::from_slice(&[b[0], 1]) } else { Shape::from_slice(b) };
    let (n, k) = (a2[a2.len() - 2], a2[a2.len() - 1]);
    let (k2, m) = (b2[b2.len() - 2], b2[b2.len() - 1]);
    if k != k2 {
        return Err(TensorError::shape_mismatch(a, b));
    }
    let mut shape = broadcast_shape(&a2[..a2.len() - 2], &b2[..b2.len() - 2])?;
    if a.len() > 1 {
        shape.push(n);
    }
    if b.len() > 1 {
        shape.push(m);
    }
    Ok(shape)
}

/// Matrix product with broadcasting over leading batch dimensions.
pub fn matmul(a: &Tensor, b: &Tensor) -> TensorResult<Tensor> {
    let dtype = float_result_dtype(&[a, b], "matmul")?;
    let out_shape = matmul_shape(a.shape(), b.shape())?;

    let a = if a.ndim() == 1 { a.reshape(&[1, a.shape()[0] as i64])? } else { a.clone() };
    let b = if b.ndim() == 1 { b.reshape(&[b.shape()[0] as i64, 1])? } else { b.clone() };
    let (n, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let m = b.shape()[b.ndim() - 1];
    let batch = broadcast_shape(&a.shape()[..a.ndim() - 2], &b.shape()[..b.ndim() - 2])?;

    let mut a_target = batch.clone();
    a_target.extend_from_slice(&[n, k]);
    let mut b_target = batch.clone();
    b_target.extend_from_slice(&[k, m]);
    let lhs = a.broadcast_values(&a_target)?;
    let rhs = b.broadcast_values(&b_target)?;

    let mut out = vec![0.0f32; numel(&batch) * n * m];
    out.par_chunks_mut(m.max(1)).enumerate().for_each(|(row, dst)| {
        let bi = row / n.max(1);
        let i = row % n.max(1);
        let a_row = &lhs[(bi * n + i) * k..(bi * n + i + 1) * k];
        let b_mat = &rhs[bi * k * m..(bi + 1) * k * m];
        for (j, slot) in dst.iter_mut().enumerate() {
            *slot = a_row
                .iter()
                .enumerate()
                .map(|(p, &av)| av * b_mat[p * m + j])
                .sum();
        }
    });

    Ok(finish(out, &out_shape, dtype, a.layout()))
}

/// Batched matrix product of two 3-d tensors with equal batch size.
pub fn bmm(a: &Tensor, b: &Tensor) -> TensorResult<Tensor> {
    expect_rank(a, 3, "bmm")?;
    expect_rank(b, 3, "bmm")?;
    if a.shape()[0] != b.shape()[0] {
        return Err(TensorError::shape_mismatch(a.shape(), b.shape()));
    }
    matmul(a, b)
}

/// `x @ w^T + bias` with `w` of shape `[out, in]`.
pub fn linear(x: &Tensor, w: &Tensor, bias: Option<&Tensor>) -> TensorResult<Tensor> {
    expect_rank(w, 2, "linear weight")?;
    let mut operands = vec![x, w];
    if let Some(b) = bias {
        operands.push(b);
    }
    let dtype = float_result_dtype(&operands, "linear")?;
    let product = matmul(x, &w.transpose(0, 1)?)?;
    let out_features = w.shape()[0];

    let mut data = product.to_vec();
    if let Some(b) = bias {
        if b.numel() != out_features {
            return Err(TensorError::shape_mismatch(&[out_features], b.shape()));
        }
        let bias_values = b.to_vec();
        for row in data.chunks_mut(out_features.max(1)) {
            for (v, bv) in row.iter_mut().zip(bias_values.iter()) {
                *v += bv;
            }
        }
    }
    Ok(finish(data, product.shape(), dtype, x.layout()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_2d() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.to_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_broadcast_batch() {
        let a = Tensor::full(&[2, 3, 4], 1.0);
        let b = Tensor::full(&[4, 5], 2.0);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 5]);
        assert!(c.to_vec().iter().all(|&v| v == 8.0));
    }

    #[test]
    fn test_matmul_vector() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let v = Tensor::from_vec(vec![1.0, 1.0], &[2]).unwrap();
        let c = matmul(&a, &v).unwrap();
        assert_eq!(c.shape(), &[2]);
        assert_eq!(c.to_vec(), vec![3.0, 7.0]);
    }

    #[test]
    fn test_matmul_transposed_operand() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let c = matmul(&a, &a.transpose(0, 1).unwrap()).unwrap();
        assert_eq!(c.to_vec(), vec![5.0, 11.0, 11.0, 25.0]);
    }

    #[test]
    fn test_bmm_rank_check() {
        let a = Tensor::zeros(&[2, 2]);
        assert!(bmm(&a, &a).is_err());
        let a = Tensor::full(&[3, 2, 4], 1.0);
        let b = Tensor::full(&[3, 4, 2], 1.0);
        assert_eq!(bmm(&a, &b).unwrap().shape(), &[3, 2, 2]);
    }

    #[test]
    fn test_linear() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2]).unwrap();
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]).unwrap();
        let b = Tensor::from_vec(vec![0.5, 0.5, 0.5], &[3]).unwrap();
        let y = linear(&x, &w, Some(&b)).unwrap();
        assert_eq!(y.shape(), &[1, 3]);
        assert_eq!(y.to_vec(), vec![1.5, 2.5, 3.5]);
    }
}
