//! Detection pipeline: receive → decode → detect → normalize → re-encode.
//!
//! Each call is independent. The pipeline holds only read-only state (the
//! shared detector and settings), so any number of request threads can run it
//! at once.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use crate::detect::{BoundingBox, Detection, DetectorBackend, RawDetection};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No image uploaded")]
    MissingImage,
    #[error("Invalid image: {0}")]
    Decode(String),
    #[error("Detection failed: {0}")]
    Inference(String),
    #[error("Detection failed: could not encode image: {0}")]
    Encode(String),
}

impl PipelineError {
    /// HTTP status for this failure. Client input problems are 4xx.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::MissingImage | PipelineError::Decode(_) => 400,
            PipelineError::Inference(_) | PipelineError::Encode(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status() < 500
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DetectionResponse {
    pub detections: Vec<Detection>,
    pub image_base64: String,
}

pub struct DetectionPipeline {
    detector: Arc<dyn DetectorBackend>,
    confidence_floor: f32,
    jpeg_quality: u8,
}

impl DetectionPipeline {
    pub fn new(detector: Arc<dyn DetectorBackend>, confidence_floor: f32) -> Self {
        Self {
            detector,
            confidence_floor,
            jpeg_quality: 90,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Run the whole pipeline on an uploaded payload.
    pub fn run(&self, upload: Option<&[u8]>) -> Result<DetectionResponse, PipelineError> {
        let bytes = match upload {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(PipelineError::MissingImage),
        };

        let image = decode(bytes)?;
        let raw = self
            .detector
            .detect(&image, self.confidence_floor)
            .map_err(|e| PipelineError::Inference(format!("{:#}", e)))?;
        let raw_count = raw.len();
        let detections = self.normalize(raw);
        let image_base64 = encode_jpeg_base64(&image, self.jpeg_quality)?;

        log::debug!(
            "detect: {}x{} backend={} raw={} kept={}",
            image.width(),
            image.height(),
            self.detector.name(),
            raw_count,
            detections.len()
        );

        Ok(DetectionResponse {
            detections,
            image_base64,
        })
    }

    /// Shape raw backend output into `Detection`s, preserving order.
    ///
    /// Entries with no class, an unnamed class, no geometry, or a confidence
    /// that is not finite or below the floor are dropped.
    pub fn normalize(&self, raw: Vec<RawDetection>) -> Vec<Detection> {
        raw.into_iter()
            .filter_map(|det| {
                let class_id = det.class_id?;
                let class_name = self.detector.class_name(class_id)?.to_string();
                let bbox = BoundingBox::from_corners(det.bbox?)?;
                if !det.confidence.is_finite() || det.confidence < self.confidence_floor {
                    return None;
                }
                Some(Detection {
                    class_id,
                    class_name,
                    confidence: det.confidence.clamp(0.0, 1.0),
                    bbox,
                })
            })
            .collect()
    }
}

/// Decode any supported image format into 8-bit RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    let image =
        image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))?;
    Ok(image.into_rgb8())
}

/// Encode as JPEG and wrap in standard base64.
pub fn encode_jpeg_base64(image: &RgbImage, quality: u8) -> Result<String, PipelineError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(image)
        .map_err(|e| PipelineError::Encode(e.to_string()))?;
    Ok(B64.encode(&buf))
}
