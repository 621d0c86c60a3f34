//! Detector plugin contracts and the detection source adapter

use crate::error::VisionError;
use crate::models::{letterbox_tensor, BoxDecoder};
use async_trait::async_trait;
use cntem_core::{CounterConfig, Detection, Frame, RawPrediction};
use ndarray::{Array4, ArrayD};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A detector that emits ready-made boxes
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    /// Human-readable backend name for logs
    fn name(&self) -> &str;

    /// Run the detector on one frame
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawPrediction>, VisionError>;
}

/// A detector that consumes a letterboxed `[1, 3, S, S]` tensor and emits a
/// raw score/box tensor
#[async_trait]
pub trait TensorModel: Send + Sync {
    /// Side of the square inference canvas
    fn input_size(&self) -> u32;

    async fn infer(&self, input: Array4<f32>) -> Result<ArrayD<f32>, VisionError>;
}

/// Adapts a [`TensorModel`] to the [`ObjectDetector`] contract:
/// letterbox, infer, decode + suppress
pub struct TensorDetector<M: TensorModel> {
    model: M,
    decoder: BoxDecoder,
}

impl<M: TensorModel> TensorDetector<M> {
    pub fn new(model: M, decoder: BoxDecoder) -> Self {
        Self { model, decoder }
    }
}

#[async_trait]
impl<M: TensorModel> ObjectDetector for TensorDetector<M> {
    fn name(&self) -> &str {
        "tensor"
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<RawPrediction>, VisionError> {
        // resizing a full frame is CPU-bound; keep it off the async workers
        let size = self.model.input_size();
        let source = frame.clone();
        let (input, letterbox) = tokio::task::spawn_blocking(move || letterbox_tensor(&source, size))
            .await
            .map_err(|e| VisionError::DetectorInference(format!("Preprocessing task failed: {}", e)))??;
        let output = self.model.infer(input).await?;
        let detections = self.decoder.decode(output.view(), &letterbox)?;

        Ok(detections
            .into_iter()
            .map(|d| RawPrediction::new(d.class_name, d.confidence, d.bbox))
            .collect())
    }
}

/// Vocabulary and per-class confidence gate applied to raw predictions
#[derive(Debug, Clone)]
pub struct ClassFilter {
    vocabulary: Vec<String>,
    thresholds: HashMap<String, f32>,
    default_threshold: f32,
}

impl ClassFilter {
    pub fn from_config(config: &CounterConfig) -> Self {
        Self {
            vocabulary: config.target_classes.clone(),
            thresholds: config.confidence_thresholds.clone(),
            default_threshold: config.default_confidence_threshold,
        }
    }

    pub fn threshold(&self, label: &str) -> f32 {
        self.thresholds.get(label).copied().unwrap_or(self.default_threshold)
    }

    /// Keep a prediction only if its label is in the vocabulary and its score
    /// strictly exceeds that class's threshold
    pub fn accept(&self, prediction: RawPrediction) -> Option<Detection> {
        let class_id = self.vocabulary.iter().position(|c| c == &prediction.label)?;

        if !prediction.score.is_finite() || prediction.score <= self.threshold(&prediction.label) {
            return None;
        }

        if !prediction.bbox.is_valid() {
            trace!("Dropping {} with malformed box {:?}", prediction.label, prediction.bbox);
            return None;
        }

        Some(Detection::new(class_id, prediction.label, prediction.score, prediction.bbox))
    }
}

/// Outcome of one detector invocation.
///
/// A failed call still yields a (empty) detection list; the failure rides
/// alongside so the caller can log it without stopping the loop.
#[derive(Debug, Default)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
    pub failure: Option<VisionError>,
}

impl DetectionBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failed(error: VisionError) -> Self {
        Self {
            detections: Vec::new(),
            failure: Some(error),
        }
    }
}

/// Wraps a pluggable detector: bounds its latency, filters its output to the
/// configured vocabulary and thresholds, and never propagates its failures
pub struct DetectionSource {
    detector: Arc<dyn ObjectDetector>,
    filter: ClassFilter,
    timeout: Duration,
}

impl DetectionSource {
    pub fn new(detector: Arc<dyn ObjectDetector>, config: &CounterConfig) -> Self {
        Self {
            detector,
            filter: ClassFilter::from_config(config),
            timeout: config.detector_timeout(),
        }
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Detect and filter. Zero-area frames yield an empty batch without
    /// calling the detector.
    pub async fn detect(&self, frame: &Frame) -> DetectionBatch {
        if frame.is_empty() {
            debug!("Skipping detection on {}x{} frame", frame.width(), frame.height());
            return DetectionBatch::empty();
        }

        let predictions = match tokio::time::timeout(self.timeout, self.detector.detect(frame)).await {
            Ok(Ok(predictions)) => predictions,
            Ok(Err(e)) => {
                warn!("Detector {} failed on frame {}: {}", self.detector.name(), frame.sequence, e);
                return DetectionBatch::failed(e);
            }
            Err(_) => {
                warn!(
                    "Detector {} exceeded {:?} on frame {}",
                    self.detector.name(),
                    self.timeout,
                    frame.sequence
                );
                return DetectionBatch::failed(VisionError::DetectorTimeout(self.timeout));
            }
        };

        let raw = predictions.len();
        let detections: Vec<Detection> = predictions
            .into_iter()
            .filter_map(|p| self.filter.accept(p))
            .collect();
        debug!("Frame {}: kept {} of {} predictions", frame.sequence, detections.len(), raw);

        DetectionBatch {
            detections,
            failure: None,
        }
    }
}
