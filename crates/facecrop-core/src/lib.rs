//! facecrop-core — Face-aware thumbnail pipeline.
//!
//! Detects the most prominent face in each source portrait (once, cached on
//! disk), plans a square crop that puts the face a third of the way down,
//! and renders fixed-size thumbnails plus optional debug highlights.

pub mod batch;
pub mod cache;
pub mod detector;
pub mod pipeline;
pub mod planner;
pub mod render;
pub mod types;

pub use cache::FaceCache;
pub use detector::{select_face, DetectError, FaceAnnotation, FaceDetector, DETECTION_BATCH_SIZE};
pub use pipeline::{Pipeline, PipelineError, PipelineOptions, RunReport};
pub use planner::{plan, CropPlan, CropRegion};
pub use render::{OutputFormat, ThumbnailRenderer, THUMBNAIL_SIZE};
pub use types::BoundingBox;
