//! onegraph-tensor - Tensors and Reference Kernels
//!
//! A small strided tensor type together with reference implementations of
//! every operator the onegraph IR can express. The fuser uses these kernels
//! to execute unfused graphs, to run partitions that fall back from their
//! compiled form, and inside its reference kernel compiler.
//!
//! # Example
//! ```rust
//! use onegraph_tensor::{kernels, Tensor};
//!
//! let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
//! let b = kernels::matmul(&a, &a).unwrap();
//! assert_eq!(b.to_vec(), vec![7.0, 10.0, 15.0, 22.0]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_arguments)]

pub mod dtype;
pub mod error;
pub mod kernels;
pub mod quant;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use error::{TensorError, TensorResult};
pub use quant::QParams;
pub use shape::{Layout, Shape, Strides};
pub use tensor::Tensor;
