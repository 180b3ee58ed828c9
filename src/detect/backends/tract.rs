#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::Labels;
use crate::detect::result::RawDetection;
use crate::detect::yolo::{self, DEFAULT_IOU_THRESHOLD};

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// The model is loaded once and optimized for a fixed square input. The
/// runnable plan is immutable, so concurrent `detect` calls run in parallel.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    iou_threshold: f32,
    labels: Labels,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, side, side]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            labels: Labels::coco(),
        })
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_name(&self, class_id: u32) -> Option<&str> {
        self.labels.get(class_id)
    }

    fn detect(&self, image: &RgbImage, confidence_floor: f32) -> Result<Vec<RawDetection>> {
        let side = self.input_size as usize;
        let (data, geometry) = yolo::letterbox_tensor(image, self.input_size);
        let input: Tensor = tract_ndarray::Array4::from_shape_vec((1, 3, side, side), data)
            .context("build model input")?
            .into();

        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let flat: Vec<f32> = view.iter().copied().collect();

        yolo::decode_output(
            &flat,
            shape[1],
            shape[2],
            &geometry,
            confidence_floor,
            self.iou_threshold,
        )
    }

    fn warm_up(&self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank, 1.0).map(|_| ())
    }
}
