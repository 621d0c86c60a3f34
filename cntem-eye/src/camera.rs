//! Frame sources the driver pulls from

use crate::error::VisionError;
use cntem_core::Frame;
use image::RgbImage;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Pull-based access to the most recent video frame.
///
/// A zero-sized frame means "not ready yet" and is not an error.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSource: Send + Sync {
    /// Most recent frame, if any has arrived
    fn latest_frame(&self) -> Option<Frame>;

    /// Give the underlying camera/video handle back. Called once per session.
    fn release(&self);
}

/// Single-slot mailbox a capture thread publishes into. Newer frames replace
/// older ones, so a slow consumer always sees the freshest frame and never a
/// backlog.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    slot: RwLock<Option<Frame>>,
    next_sequence: AtomicU64,
    released: AtomicBool,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a captured image; returns its sequence number
    pub fn publish(&self, image: RgbImage, timestamp: Duration) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.push(Frame::new(sequence, timestamp, image));
        sequence
    }

    /// Publish an already-built frame, replacing whatever is pending
    pub fn push(&self, frame: Frame) {
        if self.is_released() {
            trace!("Dropping frame {} published after release", frame.sequence);
            return;
        }
        *self.slot.write() = Some(frame);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl FrameSource for LatestFrameSlot {
    fn latest_frame(&self) -> Option<Frame> {
        self.slot.read().clone()
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.slot.write().take();
            info!("Frame source released");
        }
    }
}

/// Load an image file from disk as an RGB frame
pub fn load_frame(path: impl AsRef<Path>, sequence: u64, timestamp: Duration) -> Result<Frame, VisionError> {
    let path = path.as_ref();
    let image = image::open(path)?.to_rgb8();
    debug!("Loaded {} ({}x{})", path.display(), image.width(), image.height());
    Ok(Frame::new(sequence, timestamp, image))
}
