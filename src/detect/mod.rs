mod backend;
mod backends;
mod labels;
mod registry;
mod result;
pub mod yolo;

pub use backend::{DetectorBackend, DEFAULT_CONFIDENCE_FLOOR};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use labels::{Labels, COCO_CLASSES};
pub use registry::BackendRegistry;
pub use result::{BoundingBox, Detection, RawDetection};
