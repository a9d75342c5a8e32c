//! Fusion Pipeline
//!
//! End-to-end driver: propagate types for the example inputs, simplify,
//! calibrate and insert quantization markers, partition, lift quantize
//! nodes and partition again, then install the selected partitions as
//! fusion groups that run through the injected kernel compiler.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::calibration::calibrate;
use crate::compiler::KernelCompiler;
use crate::error::{FuseError, FuseResult};
use crate::interpret::run_graph;
use crate::ir::Graph;
use crate::lift::{lift_quantize, LiftStats};
use crate::partition::{install_fusion_groups, partition};
use crate::propagate::{propagate, propagate_with_inputs};
use crate::quantize::{insert_quant_markers, MarkerStats, QuantConfig};
use crate::runtime::DEFAULT_CACHE_CAPACITY;
use crate::simplify::{SimplifyPass, SimplifyStats, Simplifier};
use crate::value::RtValue;

// =============================================================================
// Configuration
// =============================================================================

/// Pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuserConfig {
    /// Quantization settings; `None` keeps the graph in floating point.
    pub quant: Option<QuantConfig>,
    /// Run quantized compute operators in bf16 between the markers.
    pub int8_bf16: bool,
    /// Fold weight quantization into quantized constants.
    pub freeze: bool,
    /// Rewrite partitions without quantization markers too.
    pub fuse_fp32_bf16: bool,
    /// Lift quantize nodes above layout chains.
    pub enable_lift: bool,
    /// Compiled signatures kept per fusion group.
    pub cache_capacity: usize,
}

impl Default for FuserConfig {
    fn default() -> Self {
        Self {
            quant: None,
            int8_bf16: false,
            freeze: false,
            fuse_fp32_bf16: false,
            enable_lift: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl FuserConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Floating point fusion.
    pub fn fp32() -> Self {
        Self::default().fuse_fp32_bf16(true)
    }

    /// Quantized fusion with the given settings.
    pub fn int8(quant: QuantConfig) -> Self {
        Self::default().quant(quant)
    }

    /// Sets the quantization settings.
    pub fn quant(mut self, quant: QuantConfig) -> Self {
        self.quant = Some(quant);
        self
    }

    /// Enables bf16 compute between quantization markers.
    pub fn int8_bf16(mut self, enabled: bool) -> Self {
        self.int8_bf16 = enabled;
        self
    }

    /// Enables weight folding.
    pub fn freeze(mut self, enabled: bool) -> Self {
        self.freeze = enabled;
        self
    }

    /// Enables rewriting of floating point partitions.
    pub fn fuse_fp32_bf16(mut self, enabled: bool) -> Self {
        self.fuse_fp32_bf16 = enabled;
        self
    }

    /// Enables quantize lifting.
    pub fn enable_lift(mut self, enabled: bool) -> Self {
        self.enable_lift = enabled;
        self
    }

    /// Sets the number of compiled signatures kept per group.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Checks the combination of settings.
    pub fn validate(&self) -> FuseResult<()> {
        if self.cache_capacity == 0 {
            return Err(FuseError::InvalidConfig("cache capacity must be at least 1".to_string()));
        }
        match &self.quant {
            Some(quant) => quant.validate(),
            None if self.int8_bf16 => Err(FuseError::InvalidConfig(
                "int8_bf16 requires a quantization config".to_string(),
            )),
            None if self.freeze => Err(FuseError::InvalidConfig(
                "freeze requires a quantization config".to_string(),
            )),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Result
// =============================================================================

/// Summary of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseStats {
    /// Simplification rewrites.
    pub simplify: SimplifyStats,
    /// Inserted quantization markers.
    pub markers: MarkerStats,
    /// Quantize lift decisions.
    pub lift: LiftStats,
    /// Partitions found.
    pub partitions: usize,
    /// Partitions installed as fusion groups.
    pub fusion_groups: usize,
}

/// A graph with fusion groups installed, plus the unfused graph it came from.
#[derive(Debug, Clone)]
pub struct FusedGraph {
    /// Graph with fusion groups.
    pub graph: Graph,
    /// The same computation before fusion groups were installed.
    pub reference: Graph,
    /// Pipeline statistics.
    pub stats: FuseStats,
}

impl FusedGraph {
    /// Runs the fused graph.
    pub fn run(&self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        run_graph(&self.graph, inputs)
    }

    /// Runs the unfused graph with the reference kernels.
    pub fn run_reference(&self, inputs: &[RtValue]) -> FuseResult<Vec<RtValue>> {
        run_graph(&self.reference, inputs)
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Rewrites `graph` into fusion groups.
///
/// Types are specialized to the first example batch; all batches feed
/// calibration when quantization is enabled.
pub fn fuse_graph(
    graph: &Graph,
    example_batches: &[Vec<RtValue>],
    config: &FuserConfig,
    compiler: Arc<dyn KernelCompiler>,
) -> FuseResult<FusedGraph> {
    config.validate()?;
    let mut stats = FuseStats::default();
    let mut graph = graph.clone();
    graph.validate()?;

    match example_batches.first() {
        Some(batch) => propagate_with_inputs(&mut graph, batch)?,
        None => propagate(&mut graph)?,
    }
    stats.simplify = Simplifier::default_passes().run(&mut graph)?;
    propagate(&mut graph)?;

    if let Some(quant) = &config.quant {
        let table = calibrate(&graph, example_batches, quant.activation.kind)?;
        stats.markers = insert_quant_markers(&mut graph, &table, quant, config.int8_bf16)?;

        let mut cleanup = Simplifier::new();
        if config.freeze {
            cleanup.add_pass(SimplifyPass::FoldWeightQuantization);
        }
        cleanup.add_pass(SimplifyPass::EliminateRedundantCasts);
        cleanup.add_pass(SimplifyPass::DeadCodeElimination);
        let cleaned = cleanup.run(&mut graph)?;
        stats.simplify.weights_folded += cleaned.weights_folded;
        stats.simplify.casts_removed += cleaned.casts_removed;
        stats.simplify.dead_nodes_removed += cleaned.dead_nodes_removed;
        propagate(&mut graph)?;
    }

    let mut partitions = partition(&graph);
    if config.enable_lift && config.quant.is_some() {
        stats.lift = lift_quantize(&mut graph, &partitions)?;
        if stats.lift.lifted > 0 {
            propagate(&mut graph)?;
            partitions = partition(&graph);
            debug!(partitions = partitions.len(), "partitioned again after lift");
        }
    }
    graph.validate()?;
    let reference = graph.clone();

    stats.partitions = partitions.len();
    let selected: Vec<_> = partitions
        .into_iter()
        .filter(|p| p.should_rewrite(&graph, config.fuse_fp32_bf16))
        .collect();
    let installed = install_fusion_groups(&mut graph, &selected, &compiler, config.cache_capacity)?;
    stats.fusion_groups = installed.len();
    graph.validate()?;

    info!(
        partitions = stats.partitions,
        fusion_groups = stats.fusion_groups,
        quantized = config.quant.is_some(),
        lifted = stats.lift.lifted,
        "graph fused"
    );
    Ok(FusedGraph {
        graph,
        reference,
        stats,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ReferenceCompiler;
    use crate::ir::OpKind;
    use crate::query::{check_patterns, count_fusion_groups, count_kind};
    use crate::trace::trace;
    use onegraph_tensor::{DType, Tensor};

    fn compiler() -> Arc<dyn KernelCompiler> {
        Arc::new(ReferenceCompiler::new())
    }

    fn linear_relu() -> Graph {
        trace(|t| {
            let x = t.input("x", DType::F32, &[4, 6]);
            let w = t.constant(Tensor::from_vec((0..18).map(|i| (i as f32 - 9.0) / 20.0).collect(), &[3, 6]).unwrap());
            let b = t.constant(Tensor::from_vec(vec![0.1, 0.0, -0.1], &[3]).unwrap());
            vec![x.linear(&w, Some(&b)).relu()]
        })
    }

    fn batch() -> Vec<RtValue> {
        vec![RtValue::Tensor(
            Tensor::from_vec((0..24).map(|i| (i as f32 * 0.37).sin()).collect(), &[4, 6]).unwrap(),
        )]
    }

    #[test]
    fn test_config_builder_and_validation() {
        let config = FuserConfig::fp32().cache_capacity(2);
        assert!(config.fuse_fp32_bf16);
        assert_eq!(config.cache_capacity, 2);
        assert!(config.validate().is_ok());
        assert!(FuserConfig::new().int8_bf16(true).validate().is_err());
        assert!(FuserConfig::new().freeze(true).validate().is_err());
        assert!(FuserConfig::fp32().cache_capacity(0).validate().is_err());
        assert!(FuserConfig::int8(QuantConfig::default()).int8_bf16(true).validate().is_ok());
    }

    #[test]
    fn test_config_serde() {
        let config = FuserConfig::int8(QuantConfig::default()).freeze(true);
        let json = serde_json::to_string(&config).unwrap();
        let back: FuserConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_fp32_fusion() {
        let fused = fuse_graph(&linear_relu(), &[batch()], &FuserConfig::fp32(), compiler()).unwrap();
        assert_eq!(count_fusion_groups(&fused.graph), 1);
        assert!(check_patterns(&fused.graph, &[vec![OpKind::Linear, OpKind::Relu]]));
        let out = fused.run(&batch()).unwrap();
        let reference = fused.run_reference(&batch()).unwrap();
        assert_eq!(out[0].as_tensor().unwrap().to_vec(), reference[0].as_tensor().unwrap().to_vec());
    }

    #[test]
    fn test_fp32_without_flag_is_untouched() {
        let fused = fuse_graph(&linear_relu(), &[batch()], &FuserConfig::new(), compiler()).unwrap();
        assert_eq!(count_fusion_groups(&fused.graph), 0);
        assert_eq!(fused.stats.partitions, 1);
    }

    #[test]
    fn test_int8_fusion() {
        let config = FuserConfig::int8(QuantConfig::default());
        let fused = fuse_graph(&linear_relu(), &[batch()], &config, compiler()).unwrap();
        assert_eq!(count_fusion_groups(&fused.graph), 1);
        assert!(check_patterns(
            &fused.graph,
            &[vec![OpKind::Dequantize, OpKind::Linear, OpKind::Relu]]
        ));
        assert_eq!(fused.stats.markers.activations, 1);
        assert_eq!(fused.stats.markers.weights, 1);
    }

    #[test]
    fn test_freeze_folds_weight_quantization() {
        let config = FuserConfig::int8(QuantConfig::default()).freeze(true);
        let fused = fuse_graph(&linear_relu(), &[batch()], &config, compiler()).unwrap();
        assert_eq!(fused.stats.simplify.weights_folded, 1);
        assert_eq!(count_kind(&fused.graph, OpKind::QuantizePerChannel, true), 0);
        assert_eq!(count_fusion_groups(&fused.graph), 1);
    }

    #[test]
    fn test_quantization_requires_examples() {
        let config = FuserConfig::int8(QuantConfig::default());
        let err = fuse_graph(&linear_relu(), &[], &config, compiler()).unwrap_err();
        assert!(matches!(err, FuseError::Calibration(_)));
    }
}
