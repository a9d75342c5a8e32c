//! Kernel Compiler Interface
//!
//! The capability a fusion group uses to turn its subgraph into an
//! executable kernel. A compiled partition is specialized to the input
//! signature it was compiled for and reports `SignatureMismatch` when
//! invoked outside it. `ReferenceCompiler` is the in-tree implementation:
//! its kernels check the signature and execute the subgraph with the
//! reference kernels.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use onegraph_tensor::{DType, Layout};
use serde::{Deserialize, Serialize};

use crate::error::{FuseError, FuseResult};
use crate::interpret::run_graph;
use crate::ir::{Graph, OpKind};
use crate::value::RtValue;

// =============================================================================
// Signatures
// =============================================================================

/// Static description of one partition input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgSpec {
    /// A tensor with concrete dtype, shape and layout.
    Tensor {
        /// Element dtype.
        dtype: DType,
        /// Concrete dimensions.
        shape: Vec<usize>,
        /// Layout tag.
        layout: Layout,
    },
    /// A scalar number.
    Scalar,
    /// A list or the absent value.
    Other,
}

impl ArgSpec {
    /// Describes a runtime value.
    #[must_use]
    pub fn of(value: &RtValue) -> Self {
        match value {
            RtValue::Tensor(t) => Self::Tensor {
                dtype: t.dtype(),
                shape: t.shape().to_vec(),
                layout: t.layout(),
            },
            RtValue::Float(_) | RtValue::Int(_) | RtValue::Bool(_) => Self::Scalar,
            RtValue::Ints(_) | RtValue::List(_) | RtValue::None => Self::Other,
        }
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tensor { dtype, shape, layout } => write!(f, "{dtype}{shape:?}/{layout:?}"),
            Self::Scalar => f.write_str("scalar"),
            Self::Other => f.write_str("other"),
        }
    }
}

/// Concrete input signature a compiled partition is specialized to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeSignature {
    /// One entry per partition input.
    pub args: Vec<ArgSpec>,
}

impl ShapeSignature {
    /// Describes a list of runtime inputs.
    #[must_use]
    pub fn of(inputs: &[RtValue]) -> Self {
        Self {
            args: inputs.iter().map(ArgSpec::of).collect(),
        }
    }
}

impl fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        write!(f, "({})", args.join(", "))
    }
}

/// Everything a kernel compiler receives for one partition.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    /// Fusion group name.
    pub name: String,
    /// Operator sequence of the subgraph in execution order.
    pub op_sequence: Vec<OpKind>,
    /// The subgraph to compile.
    pub subgraph: Graph,
    /// Input signature to specialize for.
    pub signature: ShapeSignature,
}

// =============================================================================
// Compiler Traits
// =============================================================================

/// An executable kernel specialized to one input signature.
pub trait CompiledPartition: Send + Sync {
    /// Returns the signature the kernel was compiled for.
    fn signature(&self) -> &ShapeSignature;

    /// Runs the kernel; returns `SignatureMismatch` when `inputs` do not
    /// match the compiled signature.
    fn run(&self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>>;
}

/// Compiles partitions into kernels.
pub trait KernelCompiler: Send + Sync {
    /// Compiles a partition. Errors are reported to the caller as is.
    fn compile(&self, spec: &PartitionSpec) -> FuseResult<Arc<dyn CompiledPartition>>;
}

// =============================================================================
// Reference Compiler
// =============================================================================

/// Compiler whose kernels interpret the subgraph with the reference kernels.
#[derive(Debug, Default)]
pub struct ReferenceCompiler {
    compilations: AtomicUsize,
}

impl ReferenceCompiler {
    /// Creates a reference compiler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many partitions have been compiled.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl KernelCompiler for ReferenceCompiler {
    fn compile(&self, spec: &PartitionSpec) -> FuseResult<Arc<dyn CompiledPartition>> {
        if spec.subgraph.inputs().len() != spec.signature.args.len() {
            return Err(FuseError::Compilation {
                group: spec.name.clone(),
                message: format!(
                    "signature has {} arguments for {} subgraph inputs",
                    spec.signature.args.len(),
                    spec.subgraph.inputs().len()
                ),
            });
        }
        self.compilations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ReferenceKernel {
            signature: spec.signature.clone(),
            subgraph: spec.subgraph.clone(),
        }))
    }
}

struct ReferenceKernel {
    signature: ShapeSignature,
    subgraph: Graph,
}

impl CompiledPartition for ReferenceKernel {
    fn signature(&self) -> &ShapeSignature {
        &self.signature
    }

    fn run(&self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        let found = ShapeSignature::of(inputs);
        if found != self.signature {
            return Err(FuseError::SignatureMismatch {
                expected: self.signature.to_string(),
                found: found.to_string(),
            });
        }
        run_graph(&self.subgraph, inputs)
    }
}
