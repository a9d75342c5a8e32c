//! Tensor - Strided N-Dimensional Array
//!
//! The `Tensor` type used by the reference kernels and the graph
//! interpreter. Element values are held as `f32` regardless of dtype:
//! bfloat16 values are kept rounded to bf16 precision, quantized tensors
//! hold their integer levels together with `QParams`, and complex tensors
//! hold interleaved (re, im) pairs. Storage is shared between views so that
//! inplace kernels write through every alias.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use core::fmt;
use std::sync::Arc;

use half::bf16;
use parking_lot::RwLock;

use crate::dtype::DType;
use crate::error::{TensorError, TensorResult};
use crate::quant::QParams;
use crate::shape::{
    broadcast_strides, contiguous_strides, is_contiguous, linear_index, normalize_dim, numel,
    permute_shape, reshape, unravel_index, Layout, Shape, Strides,
};

// =============================================================================
// Tensor Struct
// =============================================================================

/// A strided tensor with shared storage.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Vec<f32>>>,
    shape: Shape,
    strides: Strides,
    offset: usize,
    dtype: DType,
    layout: Layout,
    qparams: Option<Arc<QParams>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Creates an f32 tensor from data in row-major order.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> TensorResult<Self> {
        Self::from_vec_with_dtype(data, shape, DType::F32)
    }

    /// Creates a tensor of a non-quantized dtype, rounding values to it.
    pub fn from_vec_with_dtype(mut data: Vec<f32>, shape: &[usize], dtype: DType) -> TensorResult<Self> {
        if dtype.is_quantized() {
            return Err(TensorError::Quantization(
                "quantized tensors need quantization parameters".to_string(),
            ));
        }
        let expected = numel(shape) * lanes(dtype);
        if data.len() != expected {
            return Err(TensorError::DataLengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        round_in_place(&mut data, dtype);
        Ok(Self::dense(data, shape, dtype, None))
    }

    /// Creates a quantized tensor from integer levels.
    pub fn quantized_from_vec(
        data: Vec<f32>,
        shape: &[usize],
        dtype: DType,
        qparams: QParams,
    ) -> TensorResult<Self> {
        if !dtype.is_quantized() {
            return Err(TensorError::UnsupportedDType {
                dtype,
                op: "quantized_from_vec",
            });
        }
        if data.len() != numel(shape) {
            return Err(TensorError::DataLengthMismatch {
                expected: numel(shape),
                actual: data.len(),
            });
        }
        if let QParams::PerChannel { scales, axis, .. } = &qparams {
            if *axis >= shape.len() || scales.len() != shape[*axis] {
                return Err(TensorError::Quantization(format!(
                    "{} channel scales do not match axis {} of shape {:?}",
                    scales.len(),
                    axis,
                    shape
                )));
            }
        }
        Ok(Self::dense(data, shape, dtype, Some(Arc::new(qparams))))
    }

    /// Creates a tensor filled with zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Creates an f32 tensor filled with one value.
    #[must_use]
    pub fn full(shape: &[usize], value: f32) -> Self {
        Self::dense(vec![value; numel(shape)], shape, DType::F32, None)
    }

    /// Creates a 0-d f32 tensor.
    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self::dense(vec![value], &[], DType::F32, None)
    }

    pub(crate) fn dense(data: Vec<f32>, shape: &[usize], dtype: DType, qparams: Option<Arc<QParams>>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(data)),
            shape: Shape::from_slice(shape),
            strides: contiguous_strides(shape),
            offset: 0,
            dtype,
            layout: Layout::Contiguous,
            qparams,
        }
    }

    /// Builds a dense output tensor carrying this tensor's quantization metadata.
    pub(crate) fn dense_like(&self, data: Vec<f32>, shape: &[usize]) -> Self {
        let mut out = Self::dense(data, shape, self.dtype, self.qparams.clone());
        out.layout = dense_layout(self.layout);
        out
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Returns the shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the strides in elements.
    #[must_use]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Returns the number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    /// Returns the element dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the memory layout tag.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Returns the quantization parameters of a quantized tensor.
    #[must_use]
    pub fn qparams(&self) -> Option<&QParams> {
        self.qparams.as_deref()
    }

    /// Returns true if the elements are laid out densely in row-major order.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        is_contiguous(&self.shape, &self.strides)
    }

    /// Returns true if both tensors view the same storage.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Returns a tensor that shares storage but carries a new layout tag.
    #[must_use]
    pub fn with_layout(&self, layout: Layout) -> Self {
        let mut out = self.clone();
        out.layout = layout;
        out
    }

    // =========================================================================
    // Data Access
    // =========================================================================

    /// Returns the elements in logical row-major order.
    ///
    /// Complex tensors return interleaved (re, im) pairs.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        let storage = self.storage.read();
        let lanes = lanes(self.dtype);
        let total = self.numel();

        if self.is_contiguous() {
            let start = self.offset * lanes;
            return storage[start..start + total * lanes].to_vec();
        }

        let mut result = Vec::with_capacity(total * lanes);
        for i in 0..total {
            let index = unravel_index(i, &self.shape);
            let pos = self.element_offset(&index);
            result.extend_from_slice(&storage[pos * lanes..(pos + 1) * lanes]);
        }
        result
    }

    /// Returns the single element of a one-element tensor.
    pub fn item(&self) -> TensorResult<f32> {
        if self.numel() != 1 || self.dtype.is_complex() {
            return Err(TensorError::invalid_operation(format!(
                "item() requires a single real element, tensor has shape {:?}",
                self.shape()
            )));
        }
        Ok(self.to_vec()[0])
    }

    /// Writes row-major data through this view into the shared storage.
    pub fn assign(&self, data: &[f32]) -> TensorResult<()> {
        let lanes = lanes(self.dtype);
        if data.len() != self.numel() * lanes {
            return Err(TensorError::DataLengthMismatch {
                expected: self.numel() * lanes,
                actual: data.len(),
            });
        }
        let mut values = data.to_vec();
        round_in_place(&mut values, self.dtype);

        let mut storage = self.storage.write();
        for (i, chunk) in values.chunks(lanes).enumerate() {
            let index = unravel_index(i, &self.shape);
            let pos = self.element_offset(&index);
            storage[pos * lanes..(pos + 1) * lanes].copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Returns a dense copy that no longer shares storage.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        self.dense_like(self.to_vec(), &self.shape.clone())
            .with_layout(dense_layout(self.layout))
    }

    /// Returns the elements broadcast to `target` in row-major order.
    pub fn broadcast_values(&self, target: &[usize]) -> TensorResult<Vec<f32>> {
        if self.ndim() > target.len() {
            return Err(TensorError::BroadcastError {
                shape1: self.shape.to_vec(),
                shape2: target.to_vec(),
            });
        }
        let strides = broadcast_strides(&self.shape, &self.strides, target);
        let storage = self.storage.read();
        let total = numel(target);
        let mut result = Vec::with_capacity(total);
        for i in 0..total {
            let index = unravel_index(i, target);
            let pos = self.offset as isize + linear_index(&index, &strides);
            result.push(storage[pos as usize]);
        }
        Ok(result)
    }

    fn element_offset(&self, index: &[usize]) -> usize {
        (self.offset as isize + linear_index(index, &self.strides)) as usize
    }

    // =========================================================================
    // View Operations
    // =========================================================================

    /// Returns a view with a new shape; requires a contiguous tensor.
    pub fn view(&self, new_shape: &[i64]) -> TensorResult<Self> {
        if !self.is_contiguous() {
            return Err(TensorError::invalid_operation(
                "view requires a contiguous tensor, use reshape",
            ));
        }
        let shape = reshape(&self.shape, new_shape)?;
        Ok(Self {
            storage: Arc::clone(&self.storage),
            strides: contiguous_strides(&shape),
            shape,
            offset: self.offset,
            dtype: self.dtype,
            layout: Layout::Contiguous,
            qparams: self.per_tensor_qparams()?,
        })
    }

    /// Returns a tensor with a new shape, copying when the view is impossible.
    pub fn reshape(&self, new_shape: &[i64]) -> TensorResult<Self> {
        if self.is_contiguous() {
            self.view(new_shape)
        } else {
            self.contiguous(Layout::Contiguous).view(new_shape)
        }
    }

    /// Returns a view with reordered dimensions.
    pub fn permute(&self, dims: &[usize]) -> TensorResult<Self> {
        let shape = permute_shape(&self.shape, dims)?;
        let strides: Strides = dims.iter().map(|&d| self.strides[d]).collect();
        let layout = if is_contiguous(&shape, &strides) {
            Layout::Contiguous
        } else {
            Layout::Strided
        };
        Ok(Self {
            storage: Arc::clone(&self.storage),
            shape,
            strides,
            offset: self.offset,
            dtype: self.dtype,
            layout,
            qparams: self.qparams.as_ref().map(|q| Arc::new(q.permuted(dims))),
        })
    }

    /// Returns a view with two dimensions swapped.
    pub fn transpose(&self, dim0: i64, dim1: i64) -> TensorResult<Self> {
        let d0 = normalize_dim(dim0, self.ndim())?;
        let d1 = normalize_dim(dim1, self.ndim())?;
        let mut dims: Vec<usize> = (0..self.ndim()).collect();
        dims.swap(d0, d1);
        self.permute(&dims)
    }

    /// Returns a view of one index along a dimension, dropping that dimension.
    pub fn select(&self, dim: i64, index: i64) -> TensorResult<Self> {
        let d = normalize_dim(dim, self.ndim())?;
        let size = self.shape[d];
        let i = if index < 0 { index + size as i64 } else { index };
        if i < 0 || i >= size as i64 {
            return Err(TensorError::IndexOutOfBounds { index, size });
        }
        let mut shape = self.shape.clone();
        let mut strides = self.strides.clone();
        let offset = (self.offset as isize + i as isize * strides[d]) as usize;
        shape.remove(d);
        strides.remove(d);
        let layout = if is_contiguous(&shape, &strides) {
            Layout::Contiguous
        } else {
            Layout::Strided
        };
        Ok(Self {
            storage: Arc::clone(&self.storage),
            shape,
            strides,
            offset,
            dtype: self.dtype,
            layout,
            qparams: self.per_tensor_qparams()?,
        })
    }

    /// Returns a dense copy tagged with the requested memory layout.
    ///
    /// Returns `self` unchanged when it already has that layout.
    #[must_use]
    pub fn contiguous(&self, layout: Layout) -> Self {
        if self.layout == layout && self.is_contiguous() {
            return self.clone();
        }
        let mut out = self.dense_like(self.to_vec(), &self.shape.clone());
        out.layout = layout;
        out
    }

    fn per_tensor_qparams(&self) -> TensorResult<Option<Arc<QParams>>> {
        match self.qparams.as_deref() {
            Some(QParams::PerChannel { .. }) => Err(TensorError::Quantization(
                "reshaping a per-channel quantized tensor is not supported".to_string(),
            )),
            _ => Ok(self.qparams.clone()),
        }
    }

    // =========================================================================
    // Type Conversion
    // =========================================================================

    /// Converts to another non-quantized dtype.
    pub fn to_dtype(&self, dtype: DType) -> TensorResult<Self> {
        if self.dtype.is_quantized() || dtype.is_quantized() {
            return Err(TensorError::UnsupportedDType {
                dtype: if dtype.is_quantized() { dtype } else { self.dtype },
                op: "to",
            });
        }
        if self.dtype.is_complex() != dtype.is_complex() {
            return Err(TensorError::UnsupportedDType {
                dtype: self.dtype,
                op: "to",
            });
        }
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let mut data = self.to_vec();
        round_in_place(&mut data, dtype);
        let mut out = Self::dense(data, &self.shape, dtype, None);
        out.layout = dense_layout(self.layout);
        Ok(out)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape.as_slice())
            .field("dtype", &self.dtype)
            .field("layout", &self.layout)
            .field("qparams", &self.qparams)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Number of stored `f32` lanes per element.
fn lanes(dtype: DType) -> usize {
    if dtype.is_complex() {
        2
    } else {
        1
    }
}

/// Output layout of a kernel that writes a dense result.
pub(crate) fn dense_layout(layout: Layout) -> Layout {
    match layout {
        Layout::ChannelsLast => Layout::ChannelsLast,
        _ => Layout::Contiguous,
    }
}

/// Rounds values to the precision of `dtype`.
pub(crate) fn round_in_place(data: &mut [f32], dtype: DType) {
    match dtype {
        DType::BF16 => {
            for v in data.iter_mut() {
                *v = bf16::from_f32(*v).to_f32();
            }
        }
        DType::I64 => {
            for v in data.iter_mut() {
                *v = v.trunc();
            }
        }
        DType::Bool => {
            for v in data.iter_mut() {
                *v = if *v != 0.0 { 1.0 } else { 0.0 };
            }
        }
        _ => {}
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_validates_length() {
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], &[2, 2]).is_err());
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        assert_eq!(t.numel(), 4);
        assert_eq!(t.dtype(), DType::F32);
    }

    #[test]
    fn test_permute_is_a_view() {
        let t = Tensor::from_vec((0..6).map(|v| v as f32).collect(), &[2, 3]).unwrap();
        let p = t.permute(&[1, 0]).unwrap();
        assert_eq!(p.shape(), &[3, 2]);
        assert_eq!(p.layout(), Layout::Strided);
        assert_eq!(p.to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(p.shares_storage(&t));
        assert!(p.view(&[6]).is_err());
        assert_eq!(p.reshape(&[6]).unwrap().to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_select_writes_through() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let row = t.select(0, 1).unwrap();
        assert_eq!(row.to_vec(), vec![3.0, 4.0]);
        row.assign(&[7.0, 8.0]).unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 2.0, 7.0, 8.0]);

        let col = t.select(1, 0).unwrap();
        col.assign(&[0.0, 0.0]).unwrap();
        assert_eq!(t.to_vec(), vec![0.0, 2.0, 0.0, 8.0]);
    }

    #[test]
    fn test_bf16_rounding() {
        let t = Tensor::from_vec(vec![1.001], &[1]).unwrap();
        let b = t.to_dtype(DType::BF16).unwrap();
        assert_eq!(b.dtype(), DType::BF16);
        assert_eq!(b.to_vec()[0], 1.0);
        let back = b.to_dtype(DType::F32).unwrap();
        assert_eq!(back.to_vec()[0], 1.0);
    }

    #[test]
    fn test_contiguous_changes_layout() {
        let t = Tensor::from_vec(vec![0.0; 8], &[1, 2, 2, 2]).unwrap();
        assert!(t.contiguous(Layout::Contiguous).shares_storage(&t));
        let cl = t.contiguous(Layout::ChannelsLast);
        assert_eq!(cl.layout(), Layout::ChannelsLast);
        assert!(!cl.shares_storage(&t));
    }

    #[test]
    fn test_complex_storage() {
        let t = Tensor::from_vec_with_dtype(vec![3.0, 4.0, 0.0, 1.0], &[2], DType::Complex64).unwrap();
        assert_eq!(t.numel(), 2);
        assert_eq!(t.to_vec().len(), 4);
        assert!(t.item().is_err());
    }

    #[test]
    fn test_quantized_tensor_validation() {
        let ok = Tensor::quantized_from_vec(
            vec![1.0, 2.0],
            &[2, 1],
            DType::QInt8,
            QParams::per_channel(vec![0.1, 0.2], vec![0, 0], 0).unwrap(),
        );
        assert!(ok.is_ok());
        let bad = Tensor::quantized_from_vec(
            vec![1.0, 2.0],
            &[2, 1],
            DType::QInt8,
            QParams::per_channel(vec![0.1], vec![0], 0).unwrap(),
        );
        assert!(bad.is_err());
    }
}
