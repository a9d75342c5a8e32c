//! Partition Executor
//!
//! Runs a fusion group through its compiled kernel, guarded by the input
//! signature. The first invocation compiles for the signature it sees.
//! A later invocation with a different signature falls back to
//! interpreting the subgraph and remembers the new signature; seeing that
//! signature again compiles it, evicting the oldest entry once the cache is
//! full. The cache is a copy-on-write snapshot so concurrent runs read
//! either the old or the new entry list, never a partial one.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compiler::{CompiledPartition, KernelCompiler, PartitionSpec, ShapeSignature};
use crate::error::FuseResult;
use crate::group::FusionGroup;
use crate::interpret::run_graph;
use crate::value::RtValue;

/// Default number of signatures kept compiled per group.
pub const DEFAULT_CACHE_CAPACITY: usize = 1;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a partition executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    /// Never invoked.
    Uncompiled,
    /// Last invocation ran a compiled kernel.
    Compiled,
    /// Last invocation ran the uncompiled subgraph.
    Fallback,
}

/// Executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Kernels compiled.
    pub compilations: usize,
    /// Invocations served by a compiled kernel.
    pub compiled_runs: usize,
    /// Invocations served by the fallback path.
    pub fallback_runs: usize,
    /// Signatures currently cached.
    pub cached_signatures: usize,
}

#[derive(Clone)]
struct CacheEntry {
    signature: ShapeSignature,
    kernel: Arc<dyn CompiledPartition>,
}

// =============================================================================
// Executor
// =============================================================================

/// Shape-guarded executor owned by one fusion group.
pub struct PartitionExecutor {
    compiler: Arc<dyn KernelCompiler>,
    capacity: usize,
    cache: RwLock<Arc<Vec<CacheEntry>>>,
    pending: Mutex<Option<ShapeSignature>>,
    state: RwLock<ExecutorState>,
    compilations: AtomicUsize,
    compiled_runs: AtomicUsize,
    fallback_runs: AtomicUsize,
}

impl PartitionExecutor {
    /// Creates an executor that keeps up to `capacity` compiled signatures.
    pub fn new(compiler: Arc<dyn KernelCompiler>, capacity: usize) -> Self {
        Self {
            compiler,
            capacity: capacity.max(1),
            cache: RwLock::new(Arc::new(Vec::new())),
            pending: Mutex::new(None),
            state: RwLock::new(ExecutorState::Uncompiled),
            compilations: AtomicUsize::new(0),
            compiled_runs: AtomicUsize::new(0),
            fallback_runs: AtomicUsize::new(0),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ExecutorState {
        *self.state.read()
    }

    /// Returns the executor counters.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            compilations: self.compilations.load(Ordering::Relaxed),
            compiled_runs: self.compiled_runs.load(Ordering::Relaxed),
            fallback_runs: self.fallback_runs.load(Ordering::Relaxed),
            cached_signatures: self.cache.read().len(),
        }
    }

    /// Returns the signatures currently compiled, oldest first.
    pub fn cached_signatures(&self) -> Vec<ShapeSignature> {
        self.cache.read().iter().map(|e| e.signature.clone()).collect()
    }

    /// Runs `group` on `inputs`.
    pub fn run(&self, group: &FusionGroup, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        let signature = ShapeSignature::of(inputs);
        let snapshot = Arc::clone(&self.cache.read());

        let kernel = match snapshot.iter().find(|e| e.signature == signature) {
            Some(entry) => Some(Arc::clone(&entry.kernel)),
            None if snapshot.len() < self.capacity || self.take_pending(&signature) => {
                Some(self.compile(group, signature.clone())?)
            }
            None => None,
        };

        if let Some(kernel) = kernel {
            match kernel.run(inputs) {
                Ok(outputs) => {
                    self.compiled_runs.fetch_add(1, Ordering::Relaxed);
                    *self.state.write() = ExecutorState::Compiled;
                    return Ok(outputs);
                }
                Err(err) if err.is_signature_mismatch() => {
                    debug!(group = %group.name(), %err, "compiled kernel rejected inputs");
                }
                Err(err) => return Err(err),
            }
        }
        self.fallback(group, signature, inputs)
    }

    fn take_pending(&self, signature: &ShapeSignature) -> bool {
        let mut pending = self.pending.lock();
        if pending.as_ref() == Some(signature) {
            *pending = None;
            true
        } else {
            false
        }
    }

    fn compile(&self, group: &FusionGroup, signature: ShapeSignature) -> FuseResult<Arc<dyn CompiledPartition>> {
        let spec = PartitionSpec {
            name: group.name().to_string(),
            op_sequence: group.op_sequence().to_vec(),
            subgraph: group.subgraph().clone(),
            signature: signature.clone(),
        };
        let kernel = self.compiler.compile(&spec)?;
        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!(group = %group.name(), %signature, "partition compiled");

        let mut cache = self.cache.write();
        if !cache.iter().any(|e| e.signature == signature) {
            let mut entries: Vec<CacheEntry> = cache.as_ref().clone();
            entries.push(CacheEntry {
                signature,
                kernel: Arc::clone(&kernel),
            });
            while entries.len() > self.capacity {
                let evicted = entries.remove(0);
                debug!(group = %group.name(), signature = %evicted.signature, "compiled signature evicted");
            }
            *cache = Arc::new(entries);
        }
        Ok(kernel)
    }

    fn fallback(&self, group: &FusionGroup, signature: ShapeSignature, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        let previous = std::mem::replace(&mut *self.state.write(), ExecutorState::Fallback);
        if previous != ExecutorState::Fallback {
            warn!(group = %group.name(), %signature, "input signature changed, running uncompiled subgraph");
        } else {
            debug!(group = %group.name(), %signature, "running uncompiled subgraph");
        }
        *self.pending.lock() = Some(signature);
        self.fallback_runs.fetch_add(1, Ordering::Relaxed);
        run_graph(group.subgraph(), inputs)
    }
}

impl fmt::Debug for PartitionExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionExecutor")
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ReferenceCompiler;
    use crate::error::FuseError;
    use crate::ir::OpKind;
    use crate::trace::trace;
    use onegraph_tensor::{DType, Tensor};

    fn relu_group(capacity: usize) -> (FusionGroup, Arc<ReferenceCompiler>) {
        let subgraph = trace(|t| {
            let x = t.input_unshaped("x", DType::F32);
            vec![x.relu()]
        });
        let compiler = Arc::new(ReferenceCompiler::new());
        let executor = PartitionExecutor::new(compiler.clone(), capacity);
        let group = FusionGroup::new(0, subgraph, vec![OpKind::Relu], executor);
        (group, compiler)
    }

    fn input(shape: &[usize]) -> Vec<RtValue> {
        let n = shape.iter().product::<usize>();
        let data = (0..n).map(|i| i as f32 - 2.0).collect();
        vec![RtValue::Tensor(Tensor::from_vec(data, shape).unwrap())]
    }

    #[test]
    fn test_first_run_compiles() {
        let (group, compiler) = relu_group(1);
        assert_eq!(group.executor().state(), ExecutorState::Uncompiled);
        group.run(&input(&[2, 2])).unwrap();
        group.run(&input(&[2, 2])).unwrap();
        assert_eq!(group.executor().state(), ExecutorState::Compiled);
        assert_eq!(compiler.compilations(), 1);
        assert_eq!(group.executor().stats().compiled_runs, 2);
    }

    #[test]
    fn test_new_signature_falls_back_then_recompiles() {
        let (group, compiler) = relu_group(1);
        let first = input(&[2, 2]);
        let second = input(&[3, 2]);
        group.run(&first).unwrap();

        let fallback = group.run(&second).unwrap();
        assert_eq!(group.executor().state(), ExecutorState::Fallback);
        let reference = run_graph(group.subgraph(), &second).unwrap();
        assert_eq!(
            fallback[0].as_tensor().unwrap().to_vec(),
            reference[0].as_tensor().unwrap().to_vec()
        );

        group.run(&second).unwrap();
        assert_eq!(group.executor().state(), ExecutorState::Compiled);
        assert_eq!(compiler.compilations(), 2);
        assert_eq!(group.executor().cached_signatures(), vec![ShapeSignature::of(&second)]);

        group.run(&first).unwrap();
        assert_eq!(group.executor().state(), ExecutorState::Fallback);
        assert_eq!(group.executor().stats().fallback_runs, 2);
    }

    #[test]
    fn test_capacity_keeps_several_signatures() {
        let (group, compiler) = relu_group(2);
        group.run(&input(&[2, 2])).unwrap();
        group.run(&input(&[4])).unwrap();
        group.run(&input(&[2, 2])).unwrap();
        assert_eq!(compiler.compilations(), 2);
        assert_eq!(group.executor().stats().fallback_runs, 0);
    }

    struct FailingCompiler;

    impl KernelCompiler for FailingCompiler {
        fn compile(&self, spec: &PartitionSpec) -> FuseResult<Arc<dyn CompiledPartition>> {
            Err(FuseError::Compilation {
                group: spec.name.clone(),
                message: "unsupported".to_string(),
            })
        }
    }

    #[test]
    fn test_compile_failure_is_hard_error() {
        let subgraph = trace(|t| vec![t.input("x", DType::F32, &[2]).relu()]);
        let executor = PartitionExecutor::new(Arc::new(FailingCompiler), 1);
        let group = FusionGroup::new(0, subgraph, vec![OpKind::Relu], executor);
        let err = group.run(&input(&[2])).unwrap_err();
        assert!(matches!(err, FuseError::Compilation { .. }));
    }

    #[test]
    fn test_concurrent_runs_share_cache() {
        let (group, compiler) = relu_group(1);
        let group = Arc::new(group);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let group = Arc::clone(&group);
                std::thread::spawn(move || {
                    let shape = if i % 2 == 0 { [2, 2] } else { [4, 1] };
                    for _ in 0..10 {
                        let out = group.run(&input(&shape)).unwrap();
                        let expected: Vec<f32> = (0..4).map(|v| (v as f32 - 2.0).max(0.0)).collect();
                        assert_eq!(out[0].as_tensor().unwrap().to_vec(), expected);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = group.executor().stats();
        assert_eq!(stats.compiled_runs + stats.fallback_runs, 80);
        assert!(compiler.compilations() >= 1);
        assert_eq!(stats.cached_signatures, 1);
    }
}
