//! Calibration - Range Collection and Quantization Parameters
//!
//! Runs the reference interpreter over example inputs and records the value
//! range of every floating point tensor the graph produces. Ranges are then
//! turned into scale and zero point according to an observer spec. Weights
//! are calibrated directly from their constant data, per output channel.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::{DType, Tensor};
use rustc_hash::FxHashMap;

use crate::error::{FuseError, FuseResult};
use crate::interpret::Interpreter;
use crate::ir::{Graph, ValueId};
use crate::quantize::{ObserverKind, ObserverSpec, QScheme};
use crate::value::RtValue;

/// Number of histogram bins kept by the histogram observer.
pub const HISTOGRAM_BINS: usize = 2048;

/// Share of the distribution kept by histogram clipping, in percent.
pub const HISTOGRAM_PERCENTILE: f32 = 99.99;

// =============================================================================
// Histogram
// =============================================================================

#[derive(Debug, Clone)]
struct Histogram {
    min: f32,
    max: f32,
    bins: Vec<u64>,
}

impl Histogram {
    fn new(min: f32, max: f32) -> Self {
        Self {
            min,
            max,
            bins: vec![0; HISTOGRAM_BINS],
        }
    }

    fn bin_width(&self) -> f32 {
        (self.max - self.min) / HISTOGRAM_BINS as f32
    }

    fn bin_of(&self, value: f32) -> usize {
        let width = self.bin_width();
        if width <= 0.0 {
            return 0;
        }
        (((value - self.min) / width) as usize).min(HISTOGRAM_BINS - 1)
    }

    /// Widens the histogram, moving each old bin to the bin holding its centre.
    fn widen(&mut self, min: f32, max: f32) {
        if min >= self.min && max <= self.max {
            return;
        }
        let old = std::mem::replace(self, Self::new(min.min(self.min), max.max(self.max)));
        let width = old.bin_width();
        for (i, &count) in old.bins.iter().enumerate() {
            if count > 0 {
                let centre = old.min + (i as f32 + 0.5) * width;
                let bin = self.bin_of(centre);
                self.bins[bin] += count;
            }
        }
    }

    fn add(&mut self, data: &[f32]) {
        for &v in data {
            let bin = self.bin_of(v);
            self.bins[bin] += 1;
        }
    }

    /// Returns the range holding the central `percentile` of the samples.
    fn clipped_range(&self) -> (f32, f32) {
        let total: u64 = self.bins.iter().sum();
        if total == 0 {
            return (self.min, self.max);
        }
        let tail = ((1.0 - HISTOGRAM_PERCENTILE / 100.0) * total as f32 / 2.0) as u64;
        let width = self.bin_width();

        let mut seen = 0;
        let mut lo = 0;
        for (i, &count) in self.bins.iter().enumerate() {
            seen += count;
            if seen > tail {
                lo = i;
                break;
            }
        }
        seen = 0;
        let mut hi = HISTOGRAM_BINS - 1;
        for (i, &count) in self.bins.iter().enumerate().rev() {
            seen += count;
            if seen > tail {
                hi = i;
                break;
            }
        }
        (self.min + lo as f32 * width, self.min + (hi + 1) as f32 * width)
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Accumulates the range of one value across calibration batches.
#[derive(Debug, Clone)]
pub struct Observer {
    kind: ObserverKind,
    min: f32,
    max: f32,
    histogram: Option<Histogram>,
}

impl Observer {
    /// Creates an empty observer.
    pub fn new(kind: ObserverKind) -> Self {
        Self {
            kind,
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            histogram: None,
        }
    }

    /// Records a batch of samples; non-finite samples are ignored.
    pub fn observe(&mut self, data: &[f32]) {
        let finite: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return;
        }
        let lo = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        self.min = self.min.min(lo);
        self.max = self.max.max(hi);

        if self.kind == ObserverKind::Histogram {
            let histogram = self.histogram.get_or_insert_with(|| Histogram::new(lo, hi));
            histogram.widen(lo, hi);
            histogram.add(&finite);
        }
    }

    /// Returns the observed range widened to include zero, or `None` when
    /// nothing was observed.
    pub fn range(&self) -> Option<(f32, f32)> {
        if self.min > self.max {
            return None;
        }
        let (lo, hi) = match &self.histogram {
            Some(histogram) => histogram.clipped_range(),
            None => (self.min, self.max),
        };
        Some((lo.min(0.0), hi.max(0.0)))
    }
}

// =============================================================================
// Parameter Computation
// =============================================================================

fn qrange(dtype: DType, reduce_range: bool) -> FuseResult<(i32, i32)> {
    dtype
        .quant_range(reduce_range)
        .ok_or_else(|| FuseError::Calibration(format!("{dtype} is not a quantized dtype")))
}

fn clamp_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > f32::EPSILON {
        scale
    } else {
        f32::EPSILON
    }
}

/// Computes scale and zero point for a range `[min, max]` that contains zero.
pub fn range_qparams(min: f32, max: f32, scheme: QScheme, dtype: DType, reduce_range: bool) -> FuseResult<(f32, i32)> {
    let (qmin, qmax) = qrange(dtype, reduce_range)?;
    let (min, max) = (min.min(0.0), max.max(0.0));
    match scheme {
        QScheme::PerTensorAffine => {
            let scale = clamp_scale((max - min) / (qmax - qmin) as f32);
            let zero_point = (qmin as f32 - (min / scale).round()) as i32;
            Ok((scale, zero_point.clamp(qmin, qmax)))
        }
        QScheme::PerTensorSymmetric | QScheme::PerChannelSymmetric => {
            let max_abs = min.abs().max(max);
            let scale = clamp_scale(max_abs / ((qmax - qmin) as f32 / 2.0));
            let zero_point = if dtype == DType::QUInt8 { (qmin + qmax + 1) / 2 } else { 0 };
            Ok((scale, zero_point))
        }
    }
}

/// Computes symmetric per-channel parameters for a constant weight along `axis`.
pub fn weight_qparams(weight: &Tensor, axis: usize, spec: &ObserverSpec) -> FuseResult<(Vec<f32>, Vec<i32>)> {
    if axis >= weight.ndim() {
        return Err(FuseError::Calibration(format!(
            "channel axis {axis} out of range for weight of shape {:?}",
            weight.shape()
        )));
    }
    let channels = weight.shape()[axis];
    let inner: usize = weight.shape()[axis + 1..].iter().product();
    let mut observers = vec![Observer::new(ObserverKind::MinMax); channels];
    let data = weight.to_vec();
    for (c, observer) in observers.iter_mut().enumerate() {
        let slice: Vec<f32> = data
            .chunks(inner.max(1))
            .enumerate()
            .filter(|(i, _)| i % channels == c)
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .collect();
        observer.observe(&slice);
    }

    let mut scales = Vec::with_capacity(channels);
    let mut zero_points = Vec::with_capacity(channels);
    for observer in &observers {
        let (lo, hi) = observer.range().unwrap_or((0.0, 0.0));
        let (scale, zp) = range_qparams(lo, hi, spec.scheme, spec.dtype, spec.reduce_range)?;
        scales.push(scale);
        zero_points.push(zp);
    }
    Ok((scales, zero_points))
}

// =============================================================================
// Calibration Table
// =============================================================================

/// Observed ranges of graph values.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    ranges: FxHashMap<ValueId, (f32, f32)>,
}

impl CalibrationTable {
    /// Returns the observed range of a value.
    pub fn range(&self, value: ValueId) -> Option<(f32, f32)> {
        self.ranges.get(&value).copied()
    }

    /// Records a range directly.
    pub fn insert(&mut self, value: ValueId, range: (f32, f32)) {
        self.ranges.insert(value, range);
    }

    /// Returns the number of calibrated values.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if no value was calibrated.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Computes activation parameters for a calibrated value.
    pub fn qparams(&self, value: ValueId, spec: &ObserverSpec) -> FuseResult<(f32, i32)> {
        let (lo, hi) = self
            .range(value)
            .ok_or_else(|| FuseError::Calibration(format!("no calibration data for {value}")))?;
        range_qparams(lo, hi, spec.scheme, spec.dtype, spec.reduce_range)
    }
}

/// Runs `graph` on every example batch and records the range of each
/// floating point tensor it produces.
pub fn calibrate(graph: &Graph, batches: &[Vec<RtValue>], kind: ObserverKind) -> FuseResult<CalibrationTable> {
    if batches.is_empty() {
        return Err(FuseError::Calibration("no example inputs".to_string()));
    }
    let mut observers: FxHashMap<ValueId, Observer> = FxHashMap::default();
    for batch in batches {
        let mut record = |id: ValueId, value: &RtValue| {
            if let RtValue::Tensor(t) = value {
                if t.dtype().is_floating() {
                    observers
                        .entry(id)
                        .or_insert_with(|| Observer::new(kind))
                        .observe(&t.to_vec());
                }
            }
        };
        Interpreter::new(graph).with_observer(&mut record).run(batch)?;
    }

    let ranges = observers
        .into_iter()
        .filter_map(|(id, observer)| observer.range().map(|r| (id, r)))
        .collect();
    Ok(CalibrationTable { ranges })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::trace;

    #[test]
    fn test_minmax_range_includes_zero() {
        let mut obs = Observer::new(ObserverKind::MinMax);
        assert_eq!(obs.range(), None);
        obs.observe(&[1.0, 3.0]);
        obs.observe(&[2.0, 5.0]);
        assert_eq!(obs.range(), Some((0.0, 5.0)));
    }

    #[test]
    fn test_histogram_clips_outlier() {
        let mut obs = Observer::new(ObserverKind::Histogram);
        let mut data: Vec<f32> = (0..100_000).map(|i| (i % 100) as f32 / 100.0).collect();
        data.push(1000.0);
        obs.observe(&data);
        let (lo, hi) = obs.range().unwrap();
        assert_eq!(lo, 0.0);
        assert!(hi < 2.0, "outlier kept: {hi}");
    }

    #[test]
    fn test_histogram_widens_across_batches() {
        let mut obs = Observer::new(ObserverKind::Histogram);
        obs.observe(&[0.0, 1.0]);
        obs.observe(&[-4.0, 4.0]);
        let (lo, hi) = obs.range().unwrap();
        assert!(lo <= -3.9 && hi >= 3.9);
    }

    #[test]
    fn test_affine_params() {
        let (scale, zp) = range_qparams(-1.0, 3.0, QScheme::PerTensorAffine, DType::QUInt8, false).unwrap();
        assert!((scale - 4.0 / 255.0).abs() < 1e-7);
        assert_eq!(zp, 64);
    }

    #[test]
    fn test_symmetric_params() {
        let (scale, zp) = range_qparams(-2.0, 1.0, QScheme::PerTensorSymmetric, DType::QInt8, false).unwrap();
        assert!((scale - 2.0 / 127.5).abs() < 1e-7);
        assert_eq!(zp, 0);
        let (_, zp) = range_qparams(-2.0, 1.0, QScheme::PerTensorSymmetric, DType::QUInt8, false).unwrap();
        assert_eq!(zp, 128);
    }

    #[test]
    fn test_degenerate_range_gets_minimum_scale() {
        let (scale, _) = range_qparams(0.0, 0.0, QScheme::PerTensorAffine, DType::QUInt8, false).unwrap();
        assert_eq!(scale, f32::EPSILON);
        assert!(range_qparams(0.0, 1.0, QScheme::PerTensorAffine, DType::F32, false).is_err());
    }

    #[test]
    fn test_weight_params_per_channel() {
        let w = Tensor::from_vec(vec![1.0, -2.0, 0.5, 0.25], &[2, 2]).unwrap();
        let (scales, zps) = weight_qparams(&w, 0, &ObserverSpec::weight_default()).unwrap();
        assert!((scales[0] - 2.0 / 127.5).abs() < 1e-7);
        assert!((scales[1] - 0.5 / 127.5).abs() < 1e-7);
        assert_eq!(zps, vec![0, 0]);
    }

    #[test]
    fn test_calibrate_records_float_values() {
        let graph = trace(|t| {
            let x = t.input("x", DType::F32, &[4]);
            vec![x.relu().mul_scalar(2.0)]
        });
        let batches = vec![
            vec![RtValue::Tensor(Tensor::from_vec(vec![-1.0, 0.5, 2.0, 1.0], &[4]).unwrap())],
            vec![RtValue::Tensor(Tensor::from_vec(vec![3.0, 0.0, 0.0, -5.0], &[4]).unwrap())],
        ];
        let table = calibrate(&graph, &batches, ObserverKind::MinMax).unwrap();
        let input = graph.inputs()[0];
        let output = graph.outputs()[0];
        assert_eq!(table.range(input), Some((-5.0, 3.0)));
        assert_eq!(table.range(output), Some((0.0, 6.0)));
        assert!(calibrate(&graph, &[], ObserverKind::MinMax).is_err());
    }
}
