use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Confidence floor applied when none is configured.
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.25;

/// Object detector backend.
///
/// One instance is loaded at startup and shared by every request thread, so
/// `detect` takes `&self` and must be callable concurrently. Backends that keep
/// interior state synchronize it themselves; inference itself must not be
/// serialized behind a backend-wide lock.
pub trait DetectorBackend: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Human-readable label for a class id, if the vocabulary has one.
    fn class_name(&self, class_id: u32) -> Option<&str>;

    /// Run detection on a decoded RGB image.
    ///
    /// Detections with a confidence below `confidence_floor` are suppressed by
    /// the backend. Emission order is preserved by callers.
    fn detect(&self, image: &RgbImage, confidence_floor: f32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
