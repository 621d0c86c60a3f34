//! Evidence sources and the per-frame counting pipeline

use crate::detector::{DetectionSource, ObjectDetector};
use crate::error::VisionError;
use crate::processing::{CountZone, IdentityTracker, TrackedIdentity, TripwireSensor};
use async_trait::async_trait;
use cntem_core::{CounterConfig, Detection, EvidenceMode, Frame};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of one processed frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub sequence: u64,
    pub timestamp: Duration,
    /// New items counted on this frame
    pub count_delta: u32,
    /// Identities confirmed on this frame (detector mode)
    pub confirmed_ids: Vec<u64>,
    /// Live identities after this frame (detector mode)
    pub tracks: Vec<TrackedIdentity>,
    /// Counted identities matched on this frame
    pub visible_counted: usize,
    /// Tripwire fired recently (visual feedback window)
    pub tripwire_flash: bool,
    /// Highest-confidence detection of the frame, before zone gating
    pub best_detection: Option<Detection>,
    /// Detector failure treated as an empty frame
    pub detector_failure: Option<String>,
}

impl FrameReport {
    pub fn empty(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            count_delta: 0,
            confirmed_ids: Vec::new(),
            tracks: Vec::new(),
            visible_counted: 0,
            tripwire_flash: false,
            best_detection: None,
            detector_failure: None,
        }
    }
}

/// Receives the count delta once per processed frame
pub trait CountSink: Send {
    fn on_count(&mut self, delta: u32);
}

impl<F> CountSink for F
where
    F: FnMut(u32) + Send,
{
    fn on_count(&mut self, delta: u32) {
        self(delta)
    }
}

/// One way of turning frames into count events. Chosen once per session.
#[async_trait]
pub trait CountingEvidenceSource: Send {
    fn name(&self) -> &'static str;

    /// Begin sampling
    fn start(&mut self) {}

    /// Process one frame. None means the frame was skipped by the source's
    /// cadence and nothing was evaluated.
    async fn process(&mut self, frame: &Frame) -> Option<FrameReport>;

    /// Discard all per-session state
    fn reset(&mut self);

    fn stop(&mut self) {}
}

/// Decides whether a frame is due given a minimum frame-clock spacing
#[derive(Debug, Clone, Copy)]
struct Cadence {
    interval: Duration,
    last: Option<Duration>,
}

impl Cadence {
    fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    fn due(&mut self, at: Duration) -> bool {
        if let Some(last) = self.last {
            if let Some(elapsed) = at.checked_sub(last) {
                if elapsed < self.interval {
                    return false;
                }
            }
        }
        self.last = Some(at);
        true
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Detector → zone gate → identity tracker
pub struct DetectorEvidence {
    source: DetectionSource,
    zone: CountZone,
    tracker: IdentityTracker,
    cadence: Cadence,
}

impl DetectorEvidence {
    pub fn new(detector: Arc<dyn ObjectDetector>, config: &CounterConfig) -> Self {
        Self {
            source: DetectionSource::new(detector, config),
            zone: CountZone::new(config.zone_inset_fractions),
            tracker: IdentityTracker::from_config(config),
            cadence: Cadence::new(config.detection_interval()),
        }
    }

    pub fn tracker(&self) -> &IdentityTracker {
        &self.tracker
    }
}

#[async_trait]
impl CountingEvidenceSource for DetectorEvidence {
    fn name(&self) -> &'static str {
        "detector"
    }

    async fn process(&mut self, frame: &Frame) -> Option<FrameReport> {
        if !self.cadence.due(frame.timestamp) {
            return None;
        }

        let batch = self.source.detect(frame).await;
        let best_detection = batch
            .detections
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .cloned();

        let (width, height) = (frame.width(), frame.height());
        let in_zone: Vec<Detection> = batch
            .detections
            .into_iter()
            .filter(|d| self.zone.contains(d, width, height))
            .collect();

        let update = self.tracker.update(&in_zone);
        if !update.evicted.is_empty() {
            debug!("Frame {}: evicted identities {:?}", frame.sequence, update.evicted);
        }

        Some(FrameReport {
            count_delta: update.newly_counted,
            confirmed_ids: update.confirmed,
            tracks: update.tracks,
            visible_counted: self.tracker.visible_counted(),
            best_detection,
            detector_failure: batch.failure.map(|e| e.to_string()),
            ..FrameReport::empty(frame)
        })
    }

    fn reset(&mut self) {
        self.tracker.reset();
        self.cadence.reset();
    }
}

/// Pixel-change tripwire
pub struct TripwireEvidence {
    sensor: TripwireSensor,
}

impl TripwireEvidence {
    pub fn new(config: &CounterConfig) -> Self {
        Self {
            sensor: TripwireSensor::from_config(config),
        }
    }

    pub fn sensor(&self) -> &TripwireSensor {
        &self.sensor
    }
}

#[async_trait]
impl CountingEvidenceSource for TripwireEvidence {
    fn name(&self) -> &'static str {
        "tripwire"
    }

    fn start(&mut self) {
        self.sensor.start();
    }

    async fn process(&mut self, frame: &Frame) -> Option<FrameReport> {
        let observation = self.sensor.process(frame)?;
        Some(FrameReport {
            count_delta: u32::from(observation.triggered),
            tripwire_flash: observation.flashing,
            ..FrameReport::empty(frame)
        })
    }

    fn reset(&mut self) {
        self.sensor.reset();
    }

    fn stop(&mut self) {
        self.sensor.stop();
    }
}

/// Validated configuration plus the evidence source it selected.
///
/// Keeps a running total for convenience; the authoritative count lives with
/// whoever consumes the deltas.
pub struct CountingPipeline {
    config: Arc<CounterConfig>,
    evidence: Box<dyn CountingEvidenceSource>,
    total: u64,
}

impl CountingPipeline {
    /// Validate `config` and build the evidence source it names. Detector
    /// mode without a detector is `DetectorUnavailable`.
    pub fn from_config(config: CounterConfig, detector: Option<Arc<dyn ObjectDetector>>) -> Result<Self, VisionError> {
        config.validate()?;

        let evidence: Box<dyn CountingEvidenceSource> = match config.mode {
            EvidenceMode::Detector => {
                let detector = detector.ok_or_else(|| {
                    VisionError::DetectorUnavailable("detector mode requires a loaded detector".to_string())
                })?;
                info!("Counting with detector {}", detector.name());
                Box::new(DetectorEvidence::new(detector, &config))
            }
            EvidenceMode::Tripwire => Box::new(TripwireEvidence::new(&config)),
        };

        Ok(Self::with_evidence(config, evidence))
    }

    /// Use a custom evidence source. The source is started immediately.
    pub fn with_evidence(config: CounterConfig, mut evidence: Box<dyn CountingEvidenceSource>) -> Self {
        evidence.start();
        Self {
            config: Arc::new(config),
            evidence,
            total: 0,
        }
    }

    pub fn config(&self) -> &CounterConfig {
        &self.config
    }

    pub fn evidence_name(&self) -> &'static str {
        self.evidence.name()
    }

    pub async fn process(&mut self, frame: &Frame) -> Option<FrameReport> {
        let report = self.evidence.process(frame).await?;
        self.total += u64::from(report.count_delta);
        Some(report)
    }

    /// Fresh session state: no identities, no baseline strip, no cooldown
    pub fn reset(&mut self) {
        self.evidence.reset();
        self.total = 0;
    }

    pub fn stop(&mut self) {
        self.evidence.stop();
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cntem_core::{BoundingBox, RawPrediction};
    use image::{Rgb, RgbImage};

    struct FixedDetector(Vec<RawPrediction>);

    #[async_trait]
    impl ObjectDetector for FixedDetector {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn detect(&self, _frame: &Frame) -> Result<Vec<RawPrediction>, VisionError> {
            Ok(self.0.clone())
        }
    }

    fn frame(sequence: u64, ms: u64) -> Frame {
        Frame::new(sequence, Duration::from_millis(ms), RgbImage::new(640, 480))
    }

    fn centered_bottle() -> RawPrediction {
        RawPrediction::new("bottle", 0.9, BoundingBox::new(300.0, 200.0, 40.0, 80.0))
    }

    #[test]
    fn test_detector_mode_requires_detector() {
        let result = CountingPipeline::from_config(CounterConfig::default(), None);
        assert!(matches!(result, Err(VisionError::DetectorUnavailable(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CounterConfig::default();
        config.iou_threshold = 2.0;
        let result = CountingPipeline::from_config(config, Some(Arc::new(FixedDetector(Vec::new()))));
        assert!(matches!(result, Err(ref e) if e.is_configuration()));
    }

    #[tokio::test]
    async fn test_detector_cadence_skips_early_frames() {
        let detector = Arc::new(FixedDetector(vec![centered_bottle()]));
        let mut pipeline = CountingPipeline::from_config(CounterConfig::default(), Some(detector)).unwrap();
        assert_eq!(pipeline.evidence_name(), "detector");

        // 15 fps: one detection per ~66ms
        assert!(pipeline.process(&frame(0, 0)).await.is_some());
        assert!(pipeline.process(&frame(1, 33)).await.is_none());
        assert!(pipeline.process(&frame(2, 67)).await.is_some());
    }

    #[tokio::test]
    async fn test_detector_counts_once() {
        let detector = Arc::new(FixedDetector(vec![centered_bottle()]));
        let mut pipeline = CountingPipeline::from_config(CounterConfig::default(), Some(detector)).unwrap();

        let mut deltas = Vec::new();
        for i in 0..6 {
            let report = pipeline.process(&frame(i, i * 100)).await.unwrap();
            deltas.push(report.count_delta);
        }
        assert_eq!(deltas, vec![0, 0, 1, 0, 0, 0]);
        assert_eq!(pipeline.total(), 1);
    }

    #[tokio::test]
    async fn test_out_of_zone_detection_still_reported_as_best() {
        let edge = RawPrediction::new("bottle", 0.95, BoundingBox::new(0.0, 0.0, 40.0, 40.0));
        let detector = Arc::new(FixedDetector(vec![edge]));
        let mut pipeline = CountingPipeline::from_config(CounterConfig::default(), Some(detector)).unwrap();

        let report = pipeline.process(&frame(0, 0)).await.unwrap();
        assert!(report.tracks.is_empty());
        assert_eq!(report.best_detection.unwrap().confidence, 0.95);
    }

    #[tokio::test]
    async fn test_tripwire_mode() {
        let mut config = CounterConfig::default();
        config.mode = cntem_core::EvidenceMode::Tripwire;
        let mut pipeline = CountingPipeline::from_config(config, None).unwrap();
        assert_eq!(pipeline.evidence_name(), "tripwire");

        let dark = Frame::new(0, Duration::ZERO, RgbImage::from_pixel(64, 48, Rgb([0, 0, 0])));
        let light = Frame::new(1, Duration::from_millis(50), RgbImage::from_pixel(64, 48, Rgb([255, 255, 255])));
        assert_eq!(pipeline.process(&dark).await.unwrap().count_delta, 0);
        let report = pipeline.process(&light).await.unwrap();
        assert_eq!(report.count_delta, 1);
        assert!(report.tripwire_flash);
    }

    #[tokio::test]
    async fn test_reset_clears_total_and_identities() {
        let detector = Arc::new(FixedDetector(vec![centered_bottle()]));
        let mut pipeline = CountingPipeline::from_config(CounterConfig::default(), Some(detector)).unwrap();
        for i in 0..3 {
            pipeline.process(&frame(i, i * 100)).await;
        }
        assert_eq!(pipeline.total(), 1);

        pipeline.reset();
        assert_eq!(pipeline.total(), 0);
        let report = pipeline.process(&frame(3, 300)).await.unwrap();
        assert_eq!(report.tracks.len(), 1);
        assert_eq!(report.tracks[0].id, 1);
        assert_eq!(report.count_delta, 0);
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |delta: u32| seen.push(delta);
            sink.on_count(0);
            sink.on_count(2);
        }
        assert_eq!(seen, vec![0, 2]);
    }
}
