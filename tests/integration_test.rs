//! Whole-system counting on synthetic conveyor footage
//!
//! Dark blocks slide top to bottom across a light background, one at a time.
//! Both evidence sources must count each block exactly once.

use async_trait::async_trait;
use cntem_core::{BoundingBox, CounterConfig, EvidenceMode, Frame, RawPrediction};
use cntem_eye::camera::LatestFrameSlot;
use cntem_eye::{CountingPipeline, CountingSession, ObjectDetector, SessionHandle, VisionError};
use image::{Rgb, RgbImage};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const BLOCK_W: u32 = 160;
const BLOCK_H: i32 = 60;
const STEP: i32 = 12;
const FRAMES_PER_ITEM: u64 = 30;
const FRAME_MS: u64 = 40;

/// Finds the bounding box of dark pixels and reports it as a bottle
struct DarkBlobDetector;

#[async_trait]
impl ObjectDetector for DarkBlobDetector {
    fn name(&self) -> &str {
        "dark-blob"
    }

    async fn detect(&self, frame: &Frame) -> Result<Vec<RawPrediction>, VisionError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in frame.image.enumerate_pixels() {
            if pixel[0] < 100 {
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }

        Ok(bounds
            .map(|(x0, y0, x1, y1)| {
                let bbox = BoundingBox::from_corners(x0 as f32, y0 as f32, (x1 + 1) as f32, (y1 + 1) as f32);
                RawPrediction::new("bottle", 0.9, bbox)
            })
            .into_iter()
            .collect())
    }
}

/// Frame `sequence` of the conveyor; a new block enters every `FRAMES_PER_ITEM` frames
fn conveyor_frame(sequence: u64) -> Frame {
    let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([210, 210, 210]));
    let phase = (sequence % FRAMES_PER_ITEM) as i32;
    let top = -BLOCK_H + phase * STEP;
    let left = (WIDTH - BLOCK_W) / 2;
    for y in top.max(0)..(top + BLOCK_H).min(HEIGHT as i32) {
        for x in left..left + BLOCK_W {
            image.put_pixel(x, y as u32, Rgb([30, 30, 30]));
        }
    }
    Frame::new(sequence, Duration::from_millis(sequence * FRAME_MS), image)
}

fn conveyor(items: u64) -> Vec<Frame> {
    (0..items * FRAMES_PER_ITEM).map(conveyor_frame).collect()
}

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

async fn wait_for_frames(handle: &SessionHandle, processed: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.frames_processed() < processed {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("driver fell behind");
}

async fn run(pipeline: &mut CountingPipeline, frames: &[Frame]) -> u64 {
    for frame in frames {
        pipeline.process(frame).await;
    }
    pipeline.total()
}

#[tokio::test]
async fn test_detector_counts_each_item_once() {
    let file = write_config("mode = \"detector\"\ndetectionFps = 30\n");
    let config = assert_ok!(CounterConfig::from_file(file.path()));
    let mut pipeline = CountingPipeline::from_config(config, Some(Arc::new(DarkBlobDetector))).unwrap();

    assert_eq!(run(&mut pipeline, &conveyor(4)).await, 4);
}

#[tokio::test]
async fn test_tripwire_counts_each_item_once() {
    let file = write_config(r#"{"mode": "tripwire", "tripwireY": 0.5, "tripwireCooldownMs": 400}"#);
    let config = assert_ok!(CounterConfig::from_file(file.path()));
    let mut pipeline = CountingPipeline::from_config(config, None).unwrap();

    assert_eq!(run(&mut pipeline, &conveyor(4)).await, 4);
}

#[tokio::test]
async fn test_both_sources_agree() {
    let frames = conveyor(3);

    let mut detector = CountingPipeline::from_config(
        CounterConfig {
            detection_fps: 30,
            ..CounterConfig::default()
        },
        Some(Arc::new(DarkBlobDetector)),
    )
    .unwrap();
    let mut tripwire = CountingPipeline::from_config(
        CounterConfig {
            mode: EvidenceMode::Tripwire,
            ..CounterConfig::default()
        },
        None,
    )
    .unwrap();

    assert_eq!(run(&mut detector, &frames).await, run(&mut tripwire, &frames).await);
}

#[tokio::test]
async fn test_default_cadence_still_counts() {
    // 15 fps detection over 25 fps footage skips frames but not items
    let mut pipeline =
        CountingPipeline::from_config(CounterConfig::default(), Some(Arc::new(DarkBlobDetector))).unwrap();
    assert_eq!(run(&mut pipeline, &conveyor(3)).await, 3);
}

#[tokio::test]
async fn test_live_session_on_conveyor() {
    let config = CounterConfig {
        detection_fps: 30,
        poll_interval_ms: 1,
        ..CounterConfig::default()
    };
    let slot = Arc::new(LatestFrameSlot::new());
    let handle = CountingSession::start(config, Some(Arc::new(DarkBlobDetector)), slot.clone(), |_: u32| {}).unwrap();

    for frame in conveyor(2) {
        let processed = frame.sequence + 1;
        slot.push(frame);
        wait_for_frames(&handle, processed).await;
    }
    handle.stop().await;

    assert_eq!(handle.total(), 2);
    assert!(slot.is_released());
}

#[test]
fn test_yaml_config_with_unknown_mode_is_rejected() {
    let file = write_config("mode: conveyor\n");
    assert_err!(CounterConfig::from_file(file.path()));
}

#[test]
fn test_invalid_file_config_never_starts() {
    let file = write_config("minFramesToCount = 0\n");
    let config = assert_ok!(CounterConfig::from_file(file.path()));
    let result = CountingPipeline::from_config(config, Some(Arc::new(DarkBlobDetector)));
    assert!(matches!(result, Err(ref e) if e.is_configuration()));
}
