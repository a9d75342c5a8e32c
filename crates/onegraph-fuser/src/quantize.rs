//! Quantization Markers
//!
//! Inserts quantize and dequantize nodes around the operands of every
//! quantizable top-level operator. Activations are quantized per tensor
//! with parameters derived from calibration ranges; constant weights are
//! quantized per output channel from their data. Each value is quantized
//! once and each quantized use receives its own dequantize. In `int8_bf16`
//! mode compute operators run in bfloat16 between the markers.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::DType;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::{weight_qparams, CalibrationTable};
use crate::error::{FuseError, FuseResult};
use crate::ir::{ConstValue, Graph, NodeId, Op, ValueId};
use crate::propagate::propagate;

// =============================================================================
// Configuration
// =============================================================================

/// How ranges are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObserverKind {
    /// Running minimum and maximum.
    MinMax,
    /// Histogram with percentile clipping.
    Histogram,
}

/// How a range maps to scale and zero point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QScheme {
    /// Scale and zero point fitted to `[min, max]`.
    PerTensorAffine,
    /// Scale fitted to the largest magnitude, centred zero point.
    PerTensorSymmetric,
    /// Symmetric parameters per channel of a weight.
    PerChannelSymmetric,
}

/// Observer settings for one class of tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverSpec {
    /// Range collection method.
    pub kind: ObserverKind,
    /// Parameter scheme.
    pub scheme: QScheme,
    /// Narrow dtype.
    pub dtype: DType,
    /// Give up one bit of range.
    pub reduce_range: bool,
}

impl ObserverSpec {
    /// Creates an observer spec.
    pub fn new(kind: ObserverKind, scheme: QScheme, dtype: DType) -> Self {
        Self {
            kind,
            scheme,
            dtype,
            reduce_range: false,
        }
    }

    /// Activation default: min/max, affine, unsigned.
    pub fn activation_default() -> Self {
        Self::new(ObserverKind::MinMax, QScheme::PerTensorAffine, DType::QUInt8)
    }

    /// Weight default: min/max, symmetric per channel, signed.
    pub fn weight_default() -> Self {
        Self::new(ObserverKind::MinMax, QScheme::PerChannelSymmetric, DType::QInt8)
    }

    /// Enables or disables reduced range.
    pub fn reduce_range(mut self, enabled: bool) -> Self {
        self.reduce_range = enabled;
        self
    }
}

/// Quantization settings for activations and weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Activation observer.
    pub activation: ObserverSpec,
    /// Weight observer.
    pub weight: ObserverSpec,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            activation: ObserverSpec::activation_default(),
            weight: ObserverSpec::weight_default(),
        }
    }
}

impl QuantConfig {
    /// Creates a config whose activation observer uses `kind` and `scheme`.
    ///
    /// Affine activations are unsigned and symmetric ones signed.
    pub fn new(kind: ObserverKind, scheme: QScheme) -> Self {
        let dtype = match scheme {
            QScheme::PerTensorAffine => DType::QUInt8,
            QScheme::PerTensorSymmetric | QScheme::PerChannelSymmetric => DType::QInt8,
        };
        Self {
            activation: ObserverSpec::new(kind, scheme, dtype),
            weight: ObserverSpec::weight_default(),
        }
    }

    /// Every supported activation observer combination.
    pub fn all() -> Vec<Self> {
        let mut configs = Vec::new();
        for kind in [ObserverKind::MinMax, ObserverKind::Histogram] {
            for scheme in [QScheme::PerTensorAffine, QScheme::PerTensorSymmetric] {
                configs.push(Self::new(kind, scheme));
            }
        }
        configs
    }

    /// Sets the activation observer.
    pub fn activation(mut self, spec: ObserverSpec) -> Self {
        self.activation = spec;
        self
    }

    /// Sets the weight observer.
    pub fn weight(mut self, spec: ObserverSpec) -> Self {
        self.weight = spec;
        self
    }

    /// Checks that the combination is supported.
    pub fn validate(&self) -> FuseResult<()> {
        let a = &self.activation;
        if !a.dtype.is_quantized() {
            return Err(FuseError::InvalidConfig(format!(
                "activation dtype {} is not quantized",
                a.dtype
            )));
        }
        if a.scheme == QScheme::PerChannelSymmetric {
            return Err(FuseError::InvalidConfig(
                "activations are quantized per tensor".to_string(),
            ));
        }
        let w = &self.weight;
        if w.kind != ObserverKind::MinMax || w.scheme != QScheme::PerChannelSymmetric || w.dtype != DType::QInt8 {
            return Err(FuseError::InvalidConfig(
                "weights use per-channel symmetric min/max qint8".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Marker Insertion
// =============================================================================

/// Counts of nodes inserted by the marker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerStats {
    /// Activation quantize nodes.
    pub activations: usize,
    /// Weight quantize nodes.
    pub weights: usize,
    /// Dequantize nodes.
    pub dequantizes: usize,
    /// Precision casts.
    pub casts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Activation,
    Weight,
}

/// Returns the quantizable operands of an operator.
fn quantizable_operands(graph: &Graph, node: NodeId) -> Vec<(usize, Operand)> {
    let n = graph.node(node);
    let weight_or_activation = |index: usize| match n.inputs().get(index).and_then(|&v| graph.constant_value(v)) {
        Some(ConstValue::Tensor(_)) => Operand::Weight,
        _ => Operand::Activation,
    };
    match n.op {
        Op::Conv2d(_) | Op::Linear => vec![(0, Operand::Activation), (1, weight_or_activation(1))],
        Op::MatMul | Op::Bmm => vec![(0, Operand::Activation), (1, Operand::Activation)],
        Op::MaxPool2d(_) | Op::AvgPool2d { .. } => vec![(0, Operand::Activation)],
        _ => Vec::new(),
    }
}

fn is_f32_tensor(graph: &Graph, value: ValueId) -> bool {
    graph.tensor_type(value).map_or(false, |t| t.dtype == DType::F32)
}

/// Inserts quantize and dequantize markers using calibrated ranges.
///
/// Types must be propagated; they are propagated again on return.
pub fn insert_quant_markers(
    graph: &mut Graph,
    table: &CalibrationTable,
    config: &QuantConfig,
    int8_bf16: bool,
) -> FuseResult<MarkerStats> {
    config.validate()?;
    let mut stats = MarkerStats::default();
    let mut quantized: FxHashMap<ValueId, ValueId> = FxHashMap::default();

    for node in graph.nodes().to_vec() {
        let operands = quantizable_operands(graph, node);
        let mut marked = false;
        for (index, kind) in operands {
            let Some(&value) = graph.node(node).inputs().get(index) else {
                continue;
            };
            if !is_f32_tensor(graph, value) {
                continue;
            }
            let q = match quantized.get(&value) {
                Some(&q) => q,
                None => {
                    let op = match kind {
                        Operand::Activation => {
                            let Ok((scale, zero_point)) = table.qparams(value, &config.activation) else {
                                debug!(value = %value, "no calibration range, operand left in f32");
                                continue;
                            };
                            stats.activations += 1;
                            Op::QuantizePerTensor {
                                scale,
                                zero_point,
                                dtype: config.activation.dtype,
                            }
                        }
                        Operand::Weight => {
                            let Some(ConstValue::Tensor(weight)) = graph.constant_value(value) else {
                                continue;
                            };
                            let (scales, zero_points) = weight_qparams(weight, 0, &config.weight)?;
                            stats.weights += 1;
                            Op::QuantizePerChannel {
                                scales,
                                zero_points,
                                axis: 0,
                                dtype: config.weight.dtype,
                            }
                        }
                    };
                    let q_node = graph.insert_before(node, op, &[value], 1);
                    let q = graph.node(q_node).outputs()[0];
                    quantized.insert(value, q);
                    q
                }
            };

            let dq_node = graph.insert_before(node, Op::Dequantize, &[q], 1);
            let mut operand = graph.node(dq_node).outputs()[0];
            stats.dequantizes += 1;
            if int8_bf16 {
                let cast = graph.insert_before(node, Op::To { dtype: DType::BF16 }, &[operand], 1);
                operand = graph.node(cast).outputs()[0];
                stats.casts += 1;
            }
            graph.set_input(node, index, operand);
            marked = true;
        }

        if marked && int8_bf16 {
            stats.casts += convert_float_constants(graph, node)?;
        }
    }
    propagate(graph)?;

    if int8_bf16 {
        stats.casts += cast_quantize_inputs(graph)?;
        propagate(graph)?;
    }
    debug!(
        activations = stats.activations,
        weights = stats.weights,
        dequantizes = stats.dequantizes,
        casts = stats.casts,
        "quantization markers inserted"
    );
    Ok(stats)
}

/// Replaces f32 tensor constants feeding `node` with bf16 copies.
fn convert_float_constants(graph: &mut Graph, node: NodeId) -> FuseResult<usize> {
    let mut converted = 0;
    for (index, value) in graph.node(node).inputs().to_vec().into_iter().enumerate() {
        let Some(ConstValue::Tensor(t)) = graph.constant_value(value) else {
            continue;
        };
        if t.dtype() != DType::F32 {
            continue;
        }
        let constant = ConstValue::Tensor(t.to_dtype(DType::BF16)?);
        let replacement = graph.insert_before(node, Op::Constant(constant), &[], 1);
        let out = graph.node(replacement).outputs()[0];
        graph.set_input(node, index, out);
        converted += 1;
    }
    Ok(converted)
}

/// Puts an f32 cast in front of every quantize whose input is bf16.
fn cast_quantize_inputs(graph: &mut Graph) -> FuseResult<usize> {
    let mut inserted = 0;
    for node in graph.nodes().to_vec() {
        if !matches!(graph.node(node).op, Op::QuantizePerTensor { .. }) {
            continue;
        }
        let input = graph.node(node).inputs()[0];
        if graph.tensor_type(input).map(|t| t.dtype) != Some(DType::BF16) {
            continue;
        }
        let cast = graph.insert_before(node, Op::To { dtype: DType::F32 }, &[input], 1);
        let out = graph.node(cast).outputs()[0];
        graph.set_input(node, 0, out);
        inserted += 1;
    }
    Ok(inserted)
}

// =============================================================================
// Tests
// =============================================================================
