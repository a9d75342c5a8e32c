//! Quantization Kernels
//!
//! Conversions between float tensors and 8-bit quantized tensors.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use super::float_values;
use crate::dtype::DType;
use crate::error::{TensorError, TensorResult};
use crate::quant::{dequantize_value, dtype_range, quantize_value, QParams};
use crate::tensor::Tensor;

/// Quantizes a float tensor with one scale and zero point.
pub fn quantize_per_tensor(x: &Tensor, scale: f32, zero_point: i32, dtype: DType) -> TensorResult<Tensor> {
    if scale <= 0.0 || !scale.is_finite() {
        return Err(TensorError::Quantization(format!("invalid scale {scale}")));
    }
    let (qmin, qmax) = dtype_range(dtype)?;
    let data = float_values(x, "quantize_per_tensor")?
        .into_iter()
        .map(|v| quantize_value(v, scale, zero_point, qmin, qmax))
        .collect();
    let out = Tensor::quantized_from_vec(data, x.shape(), dtype, QParams::per_tensor(scale, zero_point))?;
    Ok(out.with_layout(crate::tensor::dense_layout(x.layout())))
}

/// Quantizes a float tensor with one scale and zero point per slice of `axis`.
pub fn quantize_per_channel(
    x: &Tensor,
    scales: &[f32],
    zero_points: &[i32],
    axis: usize,
    dtype: DType,
) -> TensorResult<Tensor> {
    if axis >= x.ndim() || scales.len() != x.shape()[axis] {
        return Err(TensorError::Quantization(format!(
            "{} scales for axis {axis} of shape {:?}",
            scales.len(),
            x.shape()
        )));
    }
    if scales.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
        return Err(TensorError::Quantization("invalid per-channel scale".to_string()));
    }
    let (qmin, qmax) = dtype_range(dtype)?;
    let params = QParams::per_channel(scales.to_vec(), zero_points.to_vec(), axis)?;
    let inner: usize = x.shape()[axis + 1..].iter().product();
    let channels = x.shape()[axis];
    let data = float_values(x, "quantize_per_channel")?
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            let (scale, zp) = params.channel((i / inner.max(1)) % channels);
            quantize_value(v, scale, zp, qmin, qmax)
        })
        .collect();
    Tensor::quantized_from_vec(data, x.shape(), dtype, params)
}

/// Converts a quantized tensor back to f32.
pub fn dequantize(q: &Tensor) -> TensorResult<Tensor> {
    let params = q.qparams().ok_or(TensorError::UnsupportedDType {
        dtype: q.dtype(),
        op: "dequantize",
    })?;
    let data = q.to_vec();
    let values = match params {
        QParams::PerTensor { scale, zero_point } => data
            .into_iter()
            .map(|v| dequantize_value(v, *scale, *zero_point))
            .collect(),
        QParams::PerChannel { axis, .. } => {
            let inner: usize = q.shape()[axis + 1..].iter().product();
            let channels = q.shape()[*axis];
            data.into_iter()
                .enumerate()
                .map(|(i, v)| {
                    let (scale, zp) = params.channel((i / inner.max(1)) % channels);
                    dequantize_value(v, scale, zp)
                })
                .collect()
        }
    };
    Ok(Tensor::from_vec(values, q.shape())?.with_layout(crate::tensor::dense_layout(q.layout())))
}
