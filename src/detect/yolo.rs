//! YOLOv8 pre- and post-processing.
//!
//! Kept independent of the inference runtime: the tract backend feeds tensors
//! built here and hands the raw output slice back for decoding.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use image::{imageops::FilterType, Rgb, RgbImage};

use crate::detect::result::{BoundingBox, RawDetection};

/// IoU above which overlapping boxes of the same class are suppressed.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

const PAD_VALUE: u8 = 114;

/// Geometry of a letterboxed model input relative to its source image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub src_width: u32,
    pub src_height: u32,
}

impl Letterbox {
    pub fn new(src_width: u32, src_height: u32, target: u32) -> Self {
        let scale = (target as f32 / src_width.max(1) as f32)
            .min(target as f32 / src_height.max(1) as f32);
        let new_w = (src_width as f32 * scale).round();
        let new_h = (src_height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
            src_width,
            src_height,
        }
    }

    /// Map a model-space point back to source pixels, clamped to the image.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = ((x - self.pad_x) / self.scale).clamp(0.0, self.src_width as f32);
        let sy = ((y - self.pad_y) / self.scale).clamp(0.0, self.src_height as f32);
        (sx, sy)
    }
}

/// Resize into a `target`x`target` canvas with grey padding and return the
/// NCHW float tensor data in [0, 1].
pub fn letterbox_tensor(image: &RgbImage, target: u32) -> (Vec<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let geometry = Letterbox::new(width, height, target);
    let new_w = ((width as f32 * geometry.scale).round() as u32).clamp(1, target);
    let new_h = ((height as f32 * geometry.scale).round() as u32).clamp(1, target);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(target, target, Rgb([PAD_VALUE; 3]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        geometry.pad_x as i64,
        geometry.pad_y as i64,
    );

    let side = target as usize;
    let plane = side * side;
    let mut data = vec![0f32; plane * 3];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let idx = y as usize * side + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = pixel[c] as f32 / 255.0;
        }
    }
    (data, geometry)
}

/// Decode a YOLOv8 detection head output laid out as `[4 + classes, boxes]`
/// (batch dimension already stripped).
///
/// Returns detections at or above `confidence_floor` after per-class NMS,
/// ordered by descending confidence.
pub fn decode_output(
    output: &[f32],
    channels: usize,
    boxes: usize,
    geometry: &Letterbox,
    confidence_floor: f32,
    iou_threshold: f32,
) -> Result<Vec<RawDetection>> {
    if channels <= 4 {
        return Err(anyhow!("model output has {} channels; expected > 4", channels));
    }
    if output.len() != channels * boxes {
        return Err(anyhow!(
            "model output length {} does not match shape {}x{}",
            output.len(),
            channels,
            boxes
        ));
    }
    let at = |c: usize, i: usize| output[c * boxes + i];

    let mut candidates = Vec::new();
    for i in 0..boxes {
        let mut best_class = 0u32;
        let mut best_score = f32::NEG_INFINITY;
        for class_idx in 0..channels - 4 {
            let score = at(4 + class_idx, i);
            if score > best_score {
                best_score = score;
                best_class = class_idx as u32;
            }
        }
        if best_score.is_nan() || best_score < confidence_floor {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let (x1, y1) = geometry.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = geometry.to_source(cx + w / 2.0, cy + h / 2.0);
        let Some(bbox) = BoundingBox::from_corners([x1, y1, x2, y2]) else {
            continue;
        };
        candidates.push((best_class, best_score, bbox));
    }

    Ok(nms(candidates, iou_threshold)
        .into_iter()
        .map(|(class_id, confidence, b)| {
            RawDetection::new(class_id, confidence, [b.x1, b.y1, b.x2, b.y2])
        })
        .collect())
}

/// Per-class non-maximum suppression. Output is sorted by descending confidence.
pub fn nms(
    candidates: Vec<(u32, f32, BoundingBox)>,
    iou_threshold: f32,
) -> Vec<(u32, f32, BoundingBox)> {
    let mut by_class: HashMap<u32, Vec<(u32, f32, BoundingBox)>> = HashMap::new();
    for candidate in candidates {
        by_class.entry(candidate.0).or_default().push(candidate);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            kept.push(group[i]);
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].2.iou(&group[j].2) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }
    kept.sort_by(|a, b| b.1.total_cmp(&a.1));
    kept
}
