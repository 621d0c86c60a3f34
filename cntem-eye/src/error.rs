//! Error types for cntem-eye

use cntem_core::Error as CoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("Detector inference failed: {0}")]
    DetectorInference(String),

    #[error("Detector did not respond within {0:?}")]
    DetectorTimeout(Duration),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    Ort(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl VisionError {
    /// Per-frame failures the driver logs and treats as "no detections"
    pub fn is_frame_miss(&self) -> bool {
        matches!(
            self,
            VisionError::DetectorInference(_) | VisionError::DetectorTimeout(_) | VisionError::InvalidFrame(_)
        )
    }

    /// Configuration rejected at session start
    pub fn is_configuration(&self) -> bool {
        matches!(self, VisionError::Core(CoreError::ConfigurationInvalid(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::DetectorUnavailable("no model loaded".to_string());
        assert!(err.to_string().contains("Detector unavailable"));
        assert!(err.to_string().contains("no model loaded"));
    }

    #[test]
    fn test_vision_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let vision_err: VisionError = io_err.into();
        match vision_err {
            VisionError::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_configuration_error_from_core() {
        let err: VisionError = CoreError::ConfigurationInvalid("bad".to_string()).into();
        assert!(err.is_configuration());
        assert!(!err.is_frame_miss());
    }

    #[test]
    fn test_frame_miss_kinds() {
        assert!(VisionError::DetectorInference("boom".to_string()).is_frame_miss());
        assert!(VisionError::DetectorTimeout(Duration::from_millis(5)).is_frame_miss());
        assert!(VisionError::InvalidFrame("zero area".to_string()).is_frame_miss());
        assert!(!VisionError::DetectorUnavailable("missing".to_string()).is_frame_miss());
    }
}
