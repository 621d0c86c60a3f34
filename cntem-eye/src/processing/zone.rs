//! Count zone gating

use cntem_core::{Detection, ZoneInsets};

/// Central sub-rectangle of the frame, expressed as fractional insets from
/// each edge. Detections centered outside it are edge noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountZone {
    insets: ZoneInsets,
}

impl CountZone {
    pub fn new(insets: ZoneInsets) -> Self {
        Self { insets }
    }

    /// Zone bounds in pixels for a `width` x `height` frame: (left, top, right, bottom)
    pub fn bounds(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let (w, h) = (width as f32, height as f32);
        (
            w * self.insets.left,
            h * self.insets.top,
            w * (1.0 - self.insets.right),
            h * (1.0 - self.insets.bottom),
        )
    }

    /// Whether the box center lies inside the zone. Edges are inclusive.
    pub fn contains(&self, detection: &Detection, width: u32, height: u32) -> bool {
        let center = detection.bbox.centroid();
        let (left, top, right, bottom) = self.bounds(width, height);
        center.x >= left && center.x <= right && center.y >= top && center.y <= bottom
    }
}

impl Default for CountZone {
    fn default() -> Self {
        Self::new(ZoneInsets::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cntem_core::BoundingBox;

    fn centered_at(x: f32, y: f32) -> Detection {
        Detection::new(0, "bottle", 0.9, BoundingBox::new(x - 10.0, y - 10.0, 20.0, 20.0))
    }

    #[test]
    fn test_center_inside() {
        let zone = CountZone::default();
        assert!(zone.contains(&centered_at(320.0, 240.0), 640, 480));
    }

    #[test]
    fn test_center_outside_each_edge() {
        let zone = CountZone::default();
        assert!(!zone.contains(&centered_at(50.0, 240.0), 640, 480));
        assert!(!zone.contains(&centered_at(600.0, 240.0), 640, 480));
        assert!(!zone.contains(&centered_at(320.0, 50.0), 640, 480));
        assert!(!zone.contains(&centered_at(320.0, 450.0), 640, 480));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let zone = CountZone::default();
        // 0.2 * 640 = 128, 0.2 * 480 = 96
        assert!(zone.contains(&centered_at(128.0, 96.0), 640, 480));
        assert!(zone.contains(&centered_at(512.0, 384.0), 640, 480));
    }

    #[test]
    fn test_large_box_gated_by_center_only() {
        let zone = CountZone::default();
        let detection = Detection::new(0, "bottle", 0.9, BoundingBox::new(0.0, 0.0, 640.0, 480.0));
        assert!(zone.contains(&detection, 640, 480));
    }

    #[test]
    fn test_asymmetric_insets() {
        let zone = CountZone::new(ZoneInsets {
            left: 0.0,
            top: 0.5,
            right: 0.0,
            bottom: 0.0,
        });
        assert!(zone.contains(&centered_at(10.0, 400.0), 640, 480));
        assert!(!zone.contains(&centered_at(10.0, 100.0), 640, 480));
    }
}
