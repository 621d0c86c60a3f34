//! Model backends and raw output decoding

pub mod yolo;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use yolo::{letterbox_tensor, non_max_suppression, BoxDecoder, Letterbox};
#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;
