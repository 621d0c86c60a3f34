//! Counting session driver
//!
//! One spawned task per session pulls the latest frame, runs it through the
//! pipeline and hands the delta to the sink. Frames that arrive while the
//! pipeline is busy are overwritten in the source, never queued.

use crate::camera::FrameSource;
use crate::detector::ObjectDetector;
use crate::error::VisionError;
use crate::pipeline::{CountSink, CountingPipeline, FrameReport};
use cntem_core::CounterConfig;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const REPORT_BUFFER_SIZE: usize = 256;
const STOP_GRACE: Duration = Duration::from_secs(1);

/// State shared between the handle and the driver task
#[derive(Debug, Default)]
struct SessionShared {
    is_running: RwLock<bool>,
    reset_requested: AtomicBool,
    total: AtomicU64,
    frames_processed: AtomicU64,
}

pub struct CountingSession;

impl CountingSession {
    /// Validate configuration, build the evidence source and spawn the
    /// driver. Must be called from within a tokio runtime.
    ///
    /// Fails before anything is spawned on invalid configuration or when
    /// detector mode has no detector.
    pub fn start<S>(
        config: CounterConfig,
        detector: Option<Arc<dyn ObjectDetector>>,
        frames: Arc<dyn FrameSource>,
        sink: S,
    ) -> Result<SessionHandle, VisionError>
    where
        S: CountSink + 'static,
    {
        let pipeline = CountingPipeline::from_config(config, detector)?;
        Ok(Self::start_with_pipeline(pipeline, frames, sink))
    }

    /// Drive an already-built pipeline
    pub fn start_with_pipeline<S>(pipeline: CountingPipeline, frames: Arc<dyn FrameSource>, sink: S) -> SessionHandle
    where
        S: CountSink + 'static,
    {
        let session_id = Uuid::new_v4();
        let shared = Arc::new(SessionShared {
            is_running: RwLock::new(true),
            ..SessionShared::default()
        });
        let (reports, _) = broadcast::channel(REPORT_BUFFER_SIZE);

        info!(
            "Session {} started ({} evidence, poll every {:?})",
            session_id,
            pipeline.evidence_name(),
            pipeline.config().poll_interval()
        );

        let task = tokio::spawn(drive(
            session_id,
            pipeline,
            frames.clone(),
            sink,
            shared.clone(),
            reports.clone(),
        ));

        SessionHandle {
            session_id,
            shared,
            frames,
            task: Mutex::new(Some(task)),
            reports,
            released: AtomicBool::new(false),
        }
    }
}

async fn drive<S: CountSink>(
    session_id: Uuid,
    mut pipeline: CountingPipeline,
    frames: Arc<dyn FrameSource>,
    mut sink: S,
    shared: Arc<SessionShared>,
    reports: broadcast::Sender<FrameReport>,
) {
    let mut ticker = tokio::time::interval(pipeline.config().poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sequence = None;

    loop {
        ticker.tick().await;

        if !*shared.is_running.read() {
            break;
        }

        if shared.reset_requested.swap(false, Ordering::SeqCst) {
            pipeline.reset();
            last_sequence = None;
            shared.total.store(0, Ordering::SeqCst);
            info!("Session {} reset", session_id);
        }

        let Some(frame) = frames.latest_frame() else {
            continue;
        };
        if frame.is_empty() {
            trace!("Frame source not ready");
            continue;
        }
        if last_sequence == Some(frame.sequence) {
            continue;
        }
        last_sequence = Some(frame.sequence);

        let report = match AssertUnwindSafe(pipeline.process(&frame)).catch_unwind().await {
            Ok(Some(report)) => report,
            Ok(None) => continue,
            Err(panic) => {
                if cfg!(debug_assertions) {
                    std::panic::resume_unwind(panic);
                }
                error!(
                    "Session {}: counting defect on frame {}, frame dropped",
                    session_id, frame.sequence
                );
                continue;
            }
        };

        if let Some(failure) = &report.detector_failure {
            debug!("Session {}: frame {} counted as empty ({})", session_id, frame.sequence, failure);
        }

        sink.on_count(report.count_delta);
        shared.total.fetch_add(u64::from(report.count_delta), Ordering::SeqCst);
        shared.frames_processed.fetch_add(1, Ordering::SeqCst);

        // no subscribers is fine
        let _ = reports.send(report);
    }

    pipeline.stop();
    *shared.is_running.write() = false;
    info!("Session {} stopped", session_id);
}

/// Control surface of a running session
pub struct SessionHandle {
    session_id: Uuid,
    shared: Arc<SessionShared>,
    frames: Arc<dyn FrameSource>,
    task: Mutex<Option<JoinHandle<()>>>,
    reports: broadcast::Sender<FrameReport>,
    released: AtomicBool,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn is_running(&self) -> bool {
        *self.shared.is_running.read() && self.task.lock().as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Sum of deltas delivered since start or the last reset
    pub fn total(&self) -> u64 {
        self.shared.total.load(Ordering::SeqCst)
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.frames_processed.load(Ordering::SeqCst)
    }

    /// Per-frame reports for overlay consumers
    pub fn subscribe_reports(&self) -> broadcast::Receiver<FrameReport> {
        self.reports.subscribe()
    }

    /// Clear tracker/tripwire state before the next frame
    pub fn reset(&self) {
        self.shared.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Halt the driver and release the frame source. Safe to call repeatedly;
    /// the source is released exactly once.
    pub async fn stop(&self) {
        self.halt();

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("Session {} did not stop within {:?}, aborting", self.session_id, STOP_GRACE);
                task.abort();
            }
        }

        self.release_frames();
    }

    fn halt(&self) {
        *self.shared.is_running.write() = false;
    }

    fn release_frames(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.frames.release();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.halt();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.release_frames();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{LatestFrameSlot, MockFrameSource};
    use cntem_core::{EvidenceMode, Frame};
    use image::{Rgb, RgbImage};

    fn tripwire_config() -> CounterConfig {
        CounterConfig {
            mode: EvidenceMode::Tripwire,
            poll_interval_ms: 1,
            ..CounterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_rejects_missing_detector() {
        let mut frames = MockFrameSource::new();
        frames.expect_release().times(0);
        let result = CountingSession::start(CounterConfig::default(), None, Arc::new(frames), |_: u32| {});
        assert!(matches!(result, Err(VisionError::DetectorUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stop_releases_once() {
        let mut frames = MockFrameSource::new();
        frames.expect_latest_frame().returning(|| None);
        frames.expect_release().times(1).return_const(());

        let handle = CountingSession::start(tripwire_config(), None, Arc::new(frames), |_: u32| {}).unwrap();
        assert!(handle.is_running());
        handle.stop().await;
        handle.stop().await;
        assert!(!handle.is_running());
        drop(handle);
    }

    #[tokio::test]
    async fn test_not_ready_frames_are_skipped() {
        let mut frames = MockFrameSource::new();
        frames
            .expect_latest_frame()
            .returning(|| Some(Frame::new(0, Duration::ZERO, RgbImage::new(0, 0))));
        frames.expect_release().times(1).return_const(());

        let handle = CountingSession::start(tripwire_config(), None, Arc::new(frames), |_: u32| {}).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.frames_processed(), 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_same_frame_processed_once() {
        let slot = Arc::new(LatestFrameSlot::new());
        slot.publish(RgbImage::from_pixel(32, 32, Rgb([0, 0, 0])), Duration::ZERO);

        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let handle = CountingSession::start(tripwire_config(), None, slot.clone(), move |_: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.frames_processed() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        // the driver keeps polling the same frame
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.frames_processed(), 1);
        handle.stop().await;
        assert!(slot.is_released());
    }

    #[tokio::test]
    async fn test_drop_releases_frames() {
        let slot = Arc::new(LatestFrameSlot::new());
        let handle = CountingSession::start(tripwire_config(), None, slot.clone(), |_: u32| {}).unwrap();
        drop(handle);
        assert!(slot.is_released());
    }
}
