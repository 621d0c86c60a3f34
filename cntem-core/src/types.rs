use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A point in source-frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point
    pub fn distance(&self, other: &Point2) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned rectangle in source-frame pixels (x, y, width, height)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from corner encoding (x1, y1, x2, y2)
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn xmax(&self) -> f32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn centroid(&self) -> Point2 {
        Point2::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Finite coordinates and non-negative size
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width >= 0.0
            && self.height >= 0.0
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.xmax().min(other.xmax());
        let bottom = self.ymax().min(other.ymax());
        (right - left).max(0.0) * (bottom - top).max(0.0)
    }

    /// Intersection over Union. Invalid or disjoint boxes yield 0.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        if !self.is_valid() || !other.is_valid() {
            return 0.0;
        }

        let intersection = self.intersection_area(other);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 || !union.is_finite() {
            return 0.0;
        }

        (intersection / union).clamp(0.0, 1.0)
    }
}

/// One observation of a known class in one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Index of the class in the configured vocabulary
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: usize, class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }
}

/// Unfiltered output of a ready-made box detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl RawPrediction {
    pub fn new(label: impl Into<String>, score: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }
}

/// A video frame as pulled from the upstream source.
///
/// `timestamp` is the frame clock: every cadence, cooldown and flash window
/// in the pipeline is measured against it, never against wall time.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub timestamp: Duration,
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(sequence: u64, timestamp: Duration, image: RgbImage) -> Self {
        Self {
            sequence,
            timestamp,
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Zero width or height means the source is not ready yet
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical() {
        let bbox = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((bbox.iou(&bbox) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        let b = BoundingBox::new(200.0, 200.0, 50.0, 50.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        // 50x50 boxes offset by 25 on x: intersection 25*50, union 2*2500 - 1250
        let a = BoundingBox::new(0.0, 0.0, 50.0, 50.0);
        let b = BoundingBox::new(25.0, 0.0, 50.0, 50.0);
        let expected = 1250.0 / 3750.0;
        assert!((a.iou(&b) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_iou_invalid_inputs() {
        let good = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert_eq!(good.iou(&BoundingBox::new(f32::NAN, 10.0, 50.0, 50.0)), 0.0);
        assert_eq!(good.iou(&BoundingBox::new(10.0, 10.0, -50.0, 50.0)), 0.0);
        assert_eq!(good.iou(&BoundingBox::new(f32::INFINITY, 10.0, 50.0, 50.0)), 0.0);
    }

    #[test]
    fn test_iou_zero_area() {
        let a = BoundingBox::new(10.0, 10.0, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
    }

    #[test]
    fn test_centroid_and_corners() {
        let bbox = BoundingBox::from_corners(10.0, 20.0, 30.0, 60.0);
        assert_eq!(bbox.width, 20.0);
        assert_eq!(bbox.height, 40.0);
        assert_eq!(bbox.centroid(), Point2::new(20.0, 40.0));
    }

    #[test]
    fn test_point_distance() {
        let a = Point2::new(0.0, 0.0);
        let b = Point2::new(3.0, 4.0);
        assert_eq!(a.distance(&b), 5.0);
    }

    #[test]
    fn test_frame_empty() {
        let frame = Frame::new(0, Duration::ZERO, RgbImage::new(0, 480));
        assert!(frame.is_empty());

        let frame = Frame::new(1, Duration::from_millis(33), RgbImage::new(640, 480));
        assert!(!frame.is_empty());
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
    }
}
