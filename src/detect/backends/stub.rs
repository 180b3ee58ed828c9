use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::Labels;
use crate::detect::result::RawDetection;

/// Stub backend. Returns a fixed script of detections for every image.
///
/// Used when no model runtime is compiled in, and by tests that need a
/// detector with known outputs.
pub struct StubBackend {
    labels: Labels,
    script: Vec<RawDetection>,
    failure: Option<String>,
    latency: Duration,
    calls: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            labels: Labels::coco(),
            script: Vec::new(),
            failure: None,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Detections returned for every image, before the confidence floor.
    pub fn with_script(mut self, script: Vec<RawDetection>) -> Self {
        self.script = script;
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Make every `detect` call fail with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Sleep for `latency` inside every `detect` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_name(&self, class_id: u32) -> Option<&str> {
        self.labels.get(class_id)
    }

    fn detect(&self, _image: &RgbImage, confidence_floor: f32) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(self
            .script
            .iter()
            .filter(|det| det.confidence >= confidence_floor)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_backend_applies_floor_and_counts_calls() {
        let backend = StubBackend::new().with_script(vec![
            RawDetection::new(0, 0.9, [0.0, 0.0, 1.0, 1.0]),
            RawDetection::new(2, 0.1, [0.0, 0.0, 1.0, 1.0]),
        ]);
        let img = RgbImage::new(4, 4);

        let r1 = backend.detect(&img, 0.25).unwrap();
        assert_eq!(r1.len(), 1);
        assert_eq!(r1[0].class_id, Some(0));

        let r2 = backend.detect(&img, 0.0).unwrap();
        assert_eq!(r2.len(), 2);
        assert_eq!(backend.calls(), 2);
        assert_eq!(backend.class_name(2), Some("car"));
    }

    #[test]
    fn failing_stub_reports_error() {
        let backend = StubBackend::new().failing("model exploded");
        let err = backend.detect(&RgbImage::new(1, 1), 0.25).unwrap_err();
        assert!(err.to_string().contains("model exploded"));
        assert_eq!(backend.calls(), 1);
    }
}
