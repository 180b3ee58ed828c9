use serde::Serialize;

/// Detection as emitted by a backend. Every field is untrusted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDetection {
    pub class_id: Option<u32>,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in source-image pixels.
    pub bbox: Option<[f32; 4]>,
}

impl RawDetection {
    pub fn new(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_id: Some(class_id),
            confidence,
            bbox: Some(bbox),
        }
    }
}

/// Axis-aligned box in source-image pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Build a box from untrusted corners.
    ///
    /// Returns `None` if any coordinate is not finite. Swapped corners are
    /// reordered so that `x1 <= x2` and `y1 <= y2`.
    pub fn from_corners([x1, y1, x2, y2]: [f32; 4]) -> Option<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        })
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Normalized detection returned to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_reorders_swapped_corners() {
        let bbox = BoundingBox::from_corners([50.0, 40.0, 10.0, 5.0]).unwrap();
        assert_eq!(
            bbox,
            BoundingBox {
                x1: 10.0,
                y1: 5.0,
                x2: 50.0,
                y2: 40.0
            }
        );
    }

    #[test]
    fn bounding_box_rejects_non_finite() {
        assert!(BoundingBox::from_corners([0.0, f32::NAN, 1.0, 1.0]).is_none());
        assert!(BoundingBox::from_corners([0.0, 0.0, f32::INFINITY, 1.0]).is_none());
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = BoundingBox::from_corners([0.0, 0.0, 10.0, 10.0]).unwrap();
        let b = BoundingBox::from_corners([5.0, 0.0, 15.0, 10.0]).unwrap();
        let iou = a.iou(&b);
        assert!((iou - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn detection_serializes_bbox_fields() {
        let det = Detection {
            class_id: 0,
            class_name: "person".to_string(),
            confidence: 0.5,
            bbox: BoundingBox::from_corners([1.0, 2.0, 3.0, 4.0]).unwrap(),
        };
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["class_name"], "person");
        assert_eq!(value["bbox"]["x1"], 1.0);
        assert_eq!(value["bbox"]["y2"], 4.0);
    }
}
