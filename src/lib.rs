//! probe-detect
//!
//! A single-process HTTP service with two independent halves:
//!
//! 1. A background **clock probe** samples wall-clock time every few seconds
//!    and publishes an immutable snapshot into a shared **status cell**.
//! 2. A **detection pipeline** accepts uploaded images, decodes them to RGB,
//!    runs an object detector, and returns the detections together with the
//!    image re-encoded as base64 JPEG.
//!
//! The probe and request handlers meet only at the status cell, which is
//! swapped whole so readers never see a torn snapshot. The detector is
//! shared by all request threads and is never called under a global lock.
//!
//! # Module Structure
//!
//! - `status`: `StatusSnapshot`, `StatusCell`
//! - `probe`: `Clock`, `ClockProbe`, `ProbeHandle`
//! - `detect`: `DetectorBackend` trait, backends, YOLO post-processing
//! - `pipeline`: decode → detect → normalize → re-encode
//! - `lifecycle`: probe start and bounded shutdown
//! - `api`: HTTP server and routes
//! - `config`: JSON file + environment configuration

pub mod api;
pub mod config;
pub mod detect;
pub mod lifecycle;
pub mod pipeline;
pub mod probe;
pub mod status;

pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectorBackend, RawDetection, StubBackend,
};
pub use lifecycle::{LifecycleController, LifecycleState, ShutdownReport};
pub use pipeline::{DetectionPipeline, DetectionResponse, PipelineError};
pub use probe::{Clock, ClockProbe, ProbeHandle, SystemClock};
pub use status::{LastCheck, StatusCell, StatusSnapshot};
