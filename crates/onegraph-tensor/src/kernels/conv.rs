//! Convolution Kernel
//!
//! Direct 2-d convolution over NCHW tensors with stride, padding, dilation
//! and groups. Output planes are computed in parallel.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{expect_rank, finish, float_result_dtype};
use crate::error::{TensorError, TensorResult};
use crate::shape::window_output_size;
use crate::tensor::Tensor;

/// Static attributes of a 2-d convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conv2dParams {
    /// Stride (height, width).
    pub stride: [usize; 2],
    /// Zero padding (height, width).
    pub padding: [usize; 2],
    /// Dilation (height, width).
    pub dilation: [usize; 2],
    /// Number of channel groups.
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

impl Conv2dParams {
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

    /// Sets the group count.
    #[must_use]
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Computes the output shape for input `[N, C, H, W]` and weight `[O, C/g, KH, KW]`.
    pub fn output_shape(&self, input: &[usize], weight: &[usize]) -> TensorResult<[usize; 4]> {
        if input.len() != 4 || weight.len() != 4 {
            return Err(TensorError::invalid_operation(format!(
                "conv2d expects 4-d input and weight, got {input:?} and {weight:?}"
            )));
        }
        let groups = self.groups.max(1);
        if input[1] != weight[1] * groups || weight[0] % groups != 0 {
            return Err(TensorError::invalid_operation(format!(
                "conv2d channel mismatch: input {input:?}, weight {weight:?}, groups {groups}"
            )));
        }
        let oh = window_output_size(input[2], weight[2], self.stride[0], self.padding[0], self.dilation[0], false);
        let ow = window_output_size(input[3], weight[3], self.stride[1], self.padding[1], self.dilation[1], false);
        Ok([input[0], weight[0], oh, ow])
    }
}

/// 2-d convolution with optional bias.
pub fn conv2d(x: &Tensor, w: &Tensor, bias: Option<&Tensor>, params: &Conv2dParams) -> TensorResult<Tensor> {
    expect_rank(x, 4, "conv2d")?;
    let mut operands = vec![x, w];
    if let Some(b) = bias {
        operands.push(b);
    }
    let dtype = float_result_dtype(&operands, "conv2d")?;
    let [n, oc, oh, ow] = params.output_shape(x.shape(), w.shape())?;
    let (c, h, wd) = (x.shape()[1], x.shape()[2], x.shape()[3]);
    let (icg, kh, kw) = (w.shape()[1], w.shape()[2], w.shape()[3]);
    let groups = params.groups.max(1);
    let ocg = oc / groups;

    let bias_values = match bias {
        Some(b) => {
            if b.numel() != oc {
                return Err(TensorError::shape_mismatch(&[oc], b.shape()));
            }
            b.to_vec()
        }
        None => vec![0.0; oc],
    };
    let input = x.to_vec();
    let weight = w.to_vec();
    let mut out = vec![0.0f32; n * oc * oh * ow];

    out.par_chunks_mut((oh * ow).max(1))
        .enumerate()
        .for_each(|(plane, dst)| {
            let batch = plane / oc;
            let o = plane % oc;
            let g = o / ocg;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias_values[o];
                    for ic in 0..icg {
                        let ch = g * icg + ic;
                        let in_base = (batch * c + ch) * h * wd;
                        let w_base = (o * icg + ic) * kh * kw;
                        for ky in 0..kh {
                            let iy = (oy * params.stride[0] + ky * params.dilation[0]) as isize
                                - params.padding[0] as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * params.stride[1] + kx * params.dilation[1]) as isize
                                    - params.padding[1] as isize;
                                if ix < 0 || ix >= wd as isize {
                                    continue;
                                }
                                acc += input[in_base + iy as usize * wd + ix as usize]
                                    * weight[w_base + ky * kw + kx];
                            }
                        }
                    }
                    dst[oy * ow + ox] = acc;
                }
            }
        });

    Ok(finish(out, &[n, oc, oh, ow], dtype, x.layout()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv2d_identity_kernel() {
        let x = Tensor::from_vec((0..16).map(|v| v as f32).collect(), &[1, 1, 4, 4]).unwrap();
        let w = Tensor::from_vec(vec![1.0], &[1, 1, 1, 1]).unwrap();
        let y = conv2d(&x, &w, None, &Conv2dParams::default()).unwrap();
        assert_eq!(y.shape(), &[1, 1, 4, 4]);
        assert_eq!(y.to_vec(), x.to_vec());
    }

    #[test]
    fn test_conv2d_padding_and_bias() {
        let x = Tensor::full(&[1, 1, 3, 3], 1.0);
        let w = Tensor::full(&[2, 1, 3, 3], 1.0);
        let b = Tensor::from_vec(vec![0.0, 10.0], &[2]).unwrap();
        let y = conv2d(&x, &w, Some(&b), &Conv2dParams::default().padding(1)).unwrap();
        assert_eq!(y.shape(), &[1, 2, 3, 3]);
        let v = y.to_vec();
        assert_eq!(v[0], 4.0);
        assert_eq!(v[4], 9.0);
        assert_eq!(v[9 + 4], 19.0);
    }

    #[test]
    fn test_conv2d_groups() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[1, 2, 1, 1]).unwrap();
        let w = Tensor::from_vec(vec![3.0, 5.0], &[2, 1, 1, 1]).unwrap();
        let y = conv2d(&x, &w, None, &Conv2dParams::default().groups(2)).unwrap();
        assert_eq!(y.to_vec(), vec![3.0, 10.0]);
    }

    #[test]
    fn test_conv2d_channel_mismatch() {
        let x = Tensor::zeros(&[1, 3, 4, 4]);
        let w = Tensor::zeros(&[2, 2, 1, 1]);
        assert!(conv2d(&x, &w, None, &Conv2dParams::default()).is_err());
    }
}
