//! cntem-eye: detection-to-count pipeline
//!
//! Turns per-frame visual evidence into a de-duplicated, monotonically
//! increasing item count. Two evidence sources are supported: a bounding-box
//! detector feeding a zone filter and an identity tracker, or a detector-free
//! tripwire that watches pixel change along a horizontal line.

pub mod camera;
pub mod detector;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod session;

pub use camera::{FrameSource, LatestFrameSlot};
pub use detector::{DetectionBatch, DetectionSource, ObjectDetector, TensorDetector, TensorModel};
pub use error::VisionError;
pub use pipeline::{CountSink, CountingEvidenceSource, CountingPipeline, FrameReport};
pub use processing::{CountZone, IdentityTracker, TrackedIdentity, TripwireSensor};
pub use session::{CountingSession, SessionHandle};
