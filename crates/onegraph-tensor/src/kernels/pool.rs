//! Pooling Kernels
//!
//! Max and average pooling over NCHW tensors, plus adaptive average
//! pooling. Max pooling also accepts quantized input and keeps its
//! quantization parameters.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use serde::{Deserialize, Serialize};

use super::{expect_rank, finish, float_result_dtype};
use crate::error::{TensorError, TensorResult};
use crate::shape::window_output_size;
use crate::tensor::Tensor;

/// Static attributes of a 2-d pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolParams {
    /// Window size (height, width).
    pub kernel: [usize; 2],
    /// Stride (height, width).
    pub stride: [usize; 2],
    /// Implicit padding (height, width).
    pub padding: [usize; 2],
    /// Dilation (height, width).
    pub dilation: [usize; 2],
    /// Use ceil instead of floor for the output size.
    pub ceil_mode: bool,
}

impl PoolParams {
    /// Square window whose stride equals its size.
    #[must_use]
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel: [kernel, kernel],
            stride: [kernel, kernel],
            padding: [0, 0],
            dilation: [1, 1],
            ceil_mode: false,
        }
    }

    /// Sets the stride.
    #[must_use]
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = [stride, stride];
        self
    }

    /// Sets the padding.
    #[must_use]
    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = [padding, padding];
        self
    }

    /// Sets the dilation.
    #[must_use]
    pub fn dilation(mut self, dilation: usize) -> Self {
        self.dilation = [dilation, dilation];
        self
    }

    /// Enables ceil mode.
    #[must_use]
    pub fn ceil_mode(mut self, ceil_mode: bool) -> Self {
        self.ceil_mode = ceil_mode;
        self
    }

    /// Computes the output shape for a 4-d input.
    pub fn output_shape(&self, input: &[usize]) -> TensorResult<[usize; 4]> {
        if input.len() != 4 {
            return Err(TensorError::invalid_operation(format!(
                "pool2d expects a 4-d input, got {input:?}"
            )));
        }
        let oh = window_output_size(input[2], self.kernel[0], self.stride[0], self.padding[0], self.dilation[0], self.ceil_mode);
        let ow = window_output_size(input[3], self.kernel[1], self.stride[1], self.padding[1], self.dilation[1], self.ceil_mode);
        Ok([input[0], input[1], oh, ow])
    }

    fn windows(&self, h: usize, w: usize, oy: usize, ox: usize) -> impl Iterator<Item = Option<(usize, usize)>> + '_ {
        let (kh, kw) = (self.kernel[0], self.kernel[1]);
        (0..kh * kw).map(move |k| {
            let iy = (oy * self.stride[0] + (k / kw) * self.dilation[0]) as isize - self.padding[0] as isize;
            let ix = (ox * self.stride[1] + (k % kw) * self.dilation[1]) as isize - self.padding[1] as isize;
            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                None
            } else {
                Some((iy as usize, ix as usize))
            }
        })
    }
}

/// 2-d max pooling.
pub fn max_pool2d(x: &Tensor, params: &PoolParams) -> TensorResult<Tensor> {
    expect_rank(x, 4, "max_pool2d")?;
    if !(x.dtype().is_floating() || x.dtype().is_quantized()) {
        return Err(TensorError::UnsupportedDType {
            dtype: x.dtype(),
            op: "max_pool2d",
        });
    }
    let [n, c, oh, ow] = params.output_shape(x.shape())?;
    let (h, w) = (x.shape()[2], x.shape()[3]);
    let input = x.to_vec();
    let mut out = Vec::with_capacity(n * c * oh * ow);
    for plane in 0..n * c {
        let base = plane * h * w;
        for oy in 0..oh {
            for ox in 0..ow {
                let best = params
                    .windows(h, w, oy, ox)
                    .flatten()
                    .map(|(iy, ix)| input[base + iy * w + ix])
                    .fold(f32::NEG_INFINITY, f32::max);
                out.push(best);
            }
        }
    }
    Ok(x.dense_like(out, &[n, c, oh, ow]))
}

/// 2-d average pooling.
pub fn avg_pool2d(x: &Tensor, params: &PoolParams, count_include_pad: bool) -> TensorResult<Tensor> {
    expect_rank(x, 4, "avg_pool2d")?;
    let dtype = float_result_dtype(&[x], "avg_pool2d")?;
    let [n, c, oh, ow] = params.output_shape(x.shape())?;
    let (h, w) = (x.shape()[2], x.shape()[3]);
    let input = x.to_vec();
    let mut out = Vec::with_capacity(n * c * oh * ow);
    for plane in 0..n * c {
        let base = plane * h * w;
        for oy in 0..oh {
            for ox in 0..ow {
                let mut sum = 0.0;
                let mut count = 0usize;
                for pos in params.windows(h, w, oy, ox) {
                    match pos {
                        Some((iy, ix)) => {
                            sum += input[base + iy * w + ix];
                            count += 1;
                        }
                        None if count_include_pad => count += 1,
                        None => {}
                    }
                }
                out.push(if count == 0 { 0.0 } else { sum / count as f32 });
            }
        }
    }
    Ok(finish(out, &[n, c, oh, ow], dtype, x.layout()))
}

/// Adaptive average pooling to a fixed spatial size.
pub fn adaptive_avg_pool2d(x: &Tensor, output_size: [usize; 2]) -> TensorResult<Tensor> {
    expect_rank(x, 4, "adaptive_avg_pool2d")?;
    let dtype = float_result_dtype(&[x], "adaptive_avg_pool2d")?;
    let (n, c, h, w) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let [oh, ow] = output_size;
    let input = x.to_vec();
    let mut out = Vec::with_capacity(n * c * oh * ow);
    for plane in 0..n * c {
        let base = plane * h * w;
        for oy in 0..oh {
            let (y0, y1) = (oy * h / oh, ((oy + 1) * h).div_ceil(oh));
            for ox in 0..ow {
                let (x0, x1) = (ox * w / ow, ((ox + 1) * w).div_ceil(ow));
                let mut sum = 0.0;
                for iy in y0..y1 {
                    for ix in x0..x1 {
                        sum += input[base + iy * w + ix];
                    }
                }
                out.push(sum / ((y1 - y0) * (x1 - x0)).max(1) as f32);
            }
        }
    }
    Ok(finish(out, &[n, c, oh, ow], dtype, x.layout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::quant::QParams;

    #[test]
    fn test_max_pool2d() {
        let x = Tensor::from_vec((0..16).map(|v| v as f32).collect(), &[1, 1, 4, 4]).unwrap();
        let y = max_pool2d(&x, &PoolParams::new(2)).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.to_vec(), vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_max_pool2d_quantized_keeps_params() {
        let x = Tensor::quantized_from_vec(vec![1.0, 9.0, 3.0, 4.0], &[1, 1, 2, 2], DType::QUInt8, QParams::per_tensor(0.5, 2)).unwrap();
        let y = max_pool2d(&x, &PoolParams::new(2)).unwrap();
        assert_eq!(y.dtype(), DType::QUInt8);
        assert_eq!(y.qparams(), Some(&QParams::per_tensor(0.5, 2)));
        assert_eq!(y.to_vec(), vec![9.0]);
    }

    #[test]
    fn test_avg_pool2d_padding() {
        let x = Tensor::full(&[1, 1, 2, 2], 4.0);
        let params = PoolParams::new(2).stride(1).padding(1);
        let include = avg_pool2d(&x, &params, true).unwrap();
        let exclude = avg_pool2d(&x, &params, false).unwrap();
        assert_eq!(include.shape(), &[1, 1, 3, 3]);
        assert_eq!(include.to_vec()[0], 1.0);
        assert_eq!(exclude.to_vec()[0], 4.0);
    }

    #[test]
    fn test_adaptive_avg_pool2d() {
        let x = Tensor::from_vec((0..16).map(|v| v as f32).collect(), &[1, 1, 4, 4]).unwrap();
        let y = adaptive_avg_pool2d(&x, [1, 1]).unwrap();
        assert_eq!(y.to_vec(), vec![7.5]);
    }
}
