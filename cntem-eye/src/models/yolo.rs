//! YOLO box decoding, letterbox transform and non-maximum suppression

use crate::error::VisionError;
use cntem_core::{BoundingBox, DecoderConfig, Detection, Frame};
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD, Axis, Ix2};
use tracing::{debug, trace};

/// Uniform scale + padding that fits a source frame into the square
/// inference canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_size: u32,
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
}

impl Letterbox {
    /// Compute the letterbox for a `width` x `height` source
    pub fn fit(width: u32, height: u32, input_size: u32) -> Result<Self, VisionError> {
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidFrame(format!(
                "cannot letterbox a {}x{} frame",
                width, height
            )));
        }
        if input_size == 0 {
            return Err(VisionError::Processing("Inference size cannot be zero".to_string()));
        }

        let size = input_size as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, input_size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, input_size);

        Ok(Self {
            input_size,
            scale,
            pad_x: (input_size - scaled_width) / 2,
            pad_y: (input_size - scaled_height) / 2,
            scaled_width,
            scaled_height,
        })
    }

    /// Map a point on the inference canvas back to source-frame pixels
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }

    /// Map a point in source-frame pixels onto the inference canvas
    pub fn to_canvas(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale + self.pad_x as f32,
            y * self.scale + self.pad_y as f32,
        )
    }
}

/// Letterbox `frame` onto a black square canvas and lay it out as a
/// `[1, 3, S, S]` float tensor normalized to [0, 1]
pub fn letterbox_tensor(frame: &Frame, input_size: u32) -> Result<(Array4<f32>, Letterbox), VisionError> {
    let letterbox = Letterbox::fit(frame.width(), frame.height(), input_size)?;

    let resized = imageops::resize(
        &*frame.image,
        letterbox.scaled_width,
        letterbox.scaled_height,
        FilterType::Triangle,
    );
    let mut canvas = RgbImage::from_pixel(input_size, input_size, Rgb([0, 0, 0]));
    imageops::overlay(&mut canvas, &resized, letterbox.pad_x as i64, letterbox.pad_y as i64);

    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = pixel[channel] as f32 / 255.0;
        }
    }

    Ok((tensor, letterbox))
}

/// Decodes YOLOv8-style `[1, 4 + classes, boxes]` score tensors into
/// detections in source-frame coordinates
#[derive(Debug, Clone)]
pub struct BoxDecoder {
    class_names: Vec<String>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl BoxDecoder {
    pub fn new(class_names: Vec<String>, confidence_threshold: f32, nms_threshold: f32) -> Self {
        Self {
            class_names,
            confidence_threshold,
            nms_threshold,
        }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(
            config.class_names.clone(),
            config.confidence_threshold,
            config.nms_iou_threshold,
        )
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Decode one raw output tensor. Accepts `[1, 4 + C, N]` or `[4 + C, N]`.
    pub fn decode(&self, output: ArrayViewD<'_, f32>, letterbox: &Letterbox) -> Result<Vec<Detection>, VisionError> {
        let output = match output.ndim() {
            3 if output.shape()[0] == 1 => output.index_axis_move(Axis(0), 0),
            2 => output,
            _ => {
                return Err(VisionError::DetectorInference(format!(
                    "unexpected output shape {:?}",
                    output.shape()
                )))
            }
        };
        let output = output
            .into_dimensionality::<Ix2>()
            .map_err(|e| VisionError::DetectorInference(format!("Failed to view output tensor: {}", e)))?;

        let (rows, num_boxes) = output.dim();
        if rows <= 4 {
            return Err(VisionError::DetectorInference(format!(
                "output has {} rows, expected 4 box coordinates plus class scores",
                rows
            )));
        }
        let num_classes = rows - 4;

        let mut candidates = Vec::new();
        for i in 0..num_boxes {
            // argmax over class scores, first maximum wins
            let mut best_class = 0;
            let mut best_score = 0.0f32;
            for class_id in 0..num_classes {
                let score = output[[4 + class_id, i]];
                if score > best_score {
                    best_score = score;
                    best_class = class_id;
                }
            }

            if !best_score.is_finite() || best_score < self.confidence_threshold {
                continue;
            }

            let cx = output[[0, i]];
            let cy = output[[1, i]];
            let w = output[[2, i]];
            let h = output[[3, i]];

            let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);
            let bbox = BoundingBox::from_corners(x1, y1, x2, y2);
            if !bbox.is_valid() {
                trace!("Dropping candidate {} with invalid box {:?}", i, bbox);
                continue;
            }

            candidates.push(Detection::new(best_class, self.class_name(best_class), best_score, bbox));
        }

        let before = candidates.len();
        let detections = non_max_suppression(candidates, self.nms_threshold);
        debug!(
            "Decoded {} candidates above {:.2}, {} left after NMS",
            before,
            self.confidence_threshold,
            detections.len()
        );

        Ok(detections)
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

/// Greedy class-agnostic non-maximum suppression.
///
/// Candidates are visited by descending score; equal scores keep their input
/// order. A candidate is dropped when its IoU with an already kept box exceeds
/// `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.retain(|d| d.confidence.is_finite());
    // stable sort: ties stay in original index order
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep
            .iter()
            .any(|kept| kept.bbox.iou(&candidate.bbox) > iou_threshold);
        if !suppressed {
            keep.push(candidate);
        }
    }

    keep
}
