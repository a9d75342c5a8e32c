//! onegraph-fuser - Graph Partitioning and Fusion
//!
//! Rewrites a traced tensor graph into fusion groups: subgraphs handed to a
//! kernel compiler as one unit. Types are propagated through the graph,
//! quantize and dequantize markers are inserted from calibration ranges,
//! supported nodes are grouped into partitions, quantize nodes are lifted
//! over layout-only chains, and every installed group runs through a
//! shape-guarded executor that falls back to the uncompiled subgraph when
//! its inputs change signature.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use onegraph_fuser::{fuse_graph, trace, FuserConfig, ReferenceCompiler, RtValue};
//! use onegraph_tensor::{DType, Tensor};
//!
//! let graph = trace(|t| {
//!     let x = t.input("x", DType::F32, &[2, 3]);
//!     let w = t.constant(Tensor::full(&[4, 3], 0.5));
//!     vec![x.linear(&w, None).relu()]
//! });
//! let x = Tensor::from_vec(vec![1.0, -2.0, 3.0, 0.5, 0.0, -1.0], &[2, 3]).unwrap();
//! let inputs = vec![RtValue::Tensor(x)];
//!
//! let fused = fuse_graph(&graph, &[inputs.clone()], &FuserConfig::fp32(), Arc::new(ReferenceCompiler::new())).unwrap();
//! assert_eq!(onegraph_fuser::query::count_fusion_groups(&fused.graph), 1);
//! let out = fused.run(&inputs).unwrap();
//! assert_eq!(out[0].as_tensor().unwrap().shape(), &[2, 4]);
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

pub mod alias;
pub mod calibration;
pub mod compiler;
pub mod error;
pub mod group;
pub mod interpret;
pub mod ir;
pub mod lift;
pub mod partition;
pub mod pipeline;
pub mod propagate;
pub mod quantize;
pub mod query;
pub mod runtime;
pub mod simplify;
pub mod support;
pub mod trace;
pub mod value;

pub use alias::AliasAnalysis;
pub use calibration::{calibrate, CalibrationTable, Observer};
pub use compiler::{ArgSpec, CompiledPartition, KernelCompiler, PartitionSpec, ReferenceCompiler, ShapeSignature};
pub use error::{FuseError, FuseResult};
pub use group::FusionGroup;
pub use interpret::{run_graph, Interpreter};
pub use ir::{BlockId, ConstValue, Graph, Node, NodeId, Op, OpKind, Operands, TensorType, Value, ValueId, ValueType};
pub use lift::{lift_quantize, LiftStats};
pub use partition::{install_fusion_groups, partition, Partition, Partitioner};
pub use pipeline::{fuse_graph, FuseStats, FusedGraph, FuserConfig};
pub use propagate::{propagate, propagate_with_inputs};
pub use quantize::{insert_quant_markers, MarkerStats, ObserverKind, ObserverSpec, QScheme, QuantConfig};
pub use runtime::{ExecutorState, ExecutorStats, PartitionExecutor};
pub use simplify::{SimplifyPass, SimplifyStats, Simplifier};
pub use support::{classify, OpClass, Support};
pub use trace::{trace, TracedValue, Tracer};
pub use value::RtValue;
