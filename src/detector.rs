// src/detector.rs
//
// Detection backend seam. The pipeline only sees `Detect`; the ONNX Runtime
// backend is feature-gated so stub deployments and tests build without a
// model runtime.

use crate::types::{Detection, Frame, ModelConfig};
use anyhow::Result;
use tracing::info;

pub trait Detect: Send {
    /// Run PPE detection over one frame. Errors are per-frame: the caller
    /// downgrades them to zero detections and keeps processing.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Select the detection backend for the configured model path. A path of
/// `stub` yields a no-op detector for dry runs.
pub fn build_detector(config: &ModelConfig) -> Result<Box<dyn Detect>> {
    if config.path == "stub" {
        info!("Using stub detector (no model)");
        return Ok(Box::new(StubDetector));
    }

    #[cfg(feature = "backend-ort")]
    {
        Ok(Box::new(ort_backend::OrtDetector::new(config)?))
    }
    #[cfg(not(feature = "backend-ort"))]
    {
        anyhow::bail!(
            "model {} requires the backend-ort feature",
            config.path
        )
    }
}

/// Always reports an empty scene. Keeps the full pipeline runnable on
/// machines without an inference runtime.
pub struct StubDetector;

impl Detect for StubDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[cfg(feature = "backend-ort")]
mod ort_backend {
    use super::Detect;
    use crate::postprocess;
    use crate::preprocessing::letterbox_to_tensor;
    use crate::types::{Detection, Frame, ModelConfig};
    use anyhow::{Context, Result};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use tracing::{debug, info};

    /// YOLO PPE detector backed by an ONNX Runtime session.
    pub struct OrtDetector {
        session: Session,
        config: ModelConfig,
    }

    impl OrtDetector {
        pub fn new(config: &ModelConfig) -> Result<Self> {
            info!("Loading PPE model: {}", config.path);

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(config.num_threads)?
                .commit_from_file(&config.path)
                .context("Failed to load model")?;

            info!("PPE detector initialized");
            Ok(Self {
                session,
                config: config.clone(),
            })
        }
    }

    impl Detect for OrtDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let (input, lb) = letterbox_to_tensor(
                &frame.data,
                frame.width,
                frame.height,
                self.config.input_size,
            )?;

            let shape = [1, 3, self.config.input_size, self.config.input_size];
            let input_value = ort::value::Value::from_array((
                shape.as_slice(),
                input.into_boxed_slice(),
            ))?;

            let outputs = self.session.run(ort::inputs!["images" => input_value])?;
            let (out_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
            let dims: Vec<usize> = out_shape.iter().map(|&d| d as usize).collect();

            let detections = postprocess::decode(
                data,
                &dims,
                lb,
                frame.width,
                frame.height,
                self.config.confidence_threshold,
                self.config.iou_threshold,
                &self.config.class_names,
            )?;

            debug!("Frame {}: {} detection(s)", frame.seq, detections.len());
            Ok(detections)
        }
    }
}
