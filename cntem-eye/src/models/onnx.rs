//! ONNX Runtime backend for YOLOv8 exports

use crate::detector::TensorModel;
use crate::error::VisionError;
use async_trait::async_trait;
use ndarray::{Array4, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// YOLOv8 model executed through ONNX Runtime
pub struct OnnxModel {
    session: Arc<Mutex<Session>>,
    input_size: u32,
}

impl OnnxModel {
    /// Load a model exported at `input_size` x `input_size`
    pub fn new(model_path: &Path, input_size: u32) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::DetectorUnavailable(format!(
                "model file {:?} does not exist",
                model_path
            )));
        }

        let session = Session::builder()
            .map_err(|e| VisionError::Ort(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| VisionError::Ort(format!("Failed to set optimization level: {}", e)))?
            .with_intra_threads(2)
            .map_err(|e| VisionError::Ort(format!("Failed to set thread count: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::DetectorUnavailable(format!("Failed to load model: {}", e)))?;

        info!("ONNX model loaded from {:?}", model_path);

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_size,
        })
    }
}

#[async_trait]
impl TensorModel for OnnxModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    async fn infer(&self, input: Array4<f32>) -> Result<ArrayD<f32>, VisionError> {
        let session = self.session.clone();

        tokio::task::spawn_blocking(move || {
            let tensor = Tensor::from_array(input)
                .map_err(|e| VisionError::DetectorInference(format!("Failed to create input tensor: {}", e)))?;

            let mut session = session.lock();
            let outputs = session
                .run(ort::inputs![tensor])
                .map_err(|e| VisionError::DetectorInference(format!("Inference failed: {}", e)))?;

            let output = outputs[0]
                .try_extract_array::<f32>()
                .map_err(|e| VisionError::DetectorInference(format!("Failed to extract output tensor: {}", e)))?;
            debug!("ONNX output shape: {:?}", output.shape());

            Ok(output.to_owned())
        })
        .await
        .map_err(|e| VisionError::DetectorInference(format!("Inference task failed: {}", e)))?
    }
}
