//! Boundary to the external batch face-detection service.
//!
//! The service itself lives outside this crate; implementations of
//! [`FaceDetector`] translate its wire format into one [`BoundingBox`] per
//! submitted image, using [`select_face`] to pick the winning annotation.

use crate::types::BoundingBox;
use std::future::Future;
use thiserror::Error;

/// Largest batch the orchestrator submits in one detection call.
pub const DETECTION_BATCH_SIZE: usize = 10;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("detection request failed: {0}")]
    Transport(String),
    #[error("detection service error: {0}")]
    Service(String),
    #[error("detection returned {actual} results for {expected} images")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("detection unavailable: {0}")]
    Unavailable(String),
}

/// A single face annotation as reported by the detection service.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnnotation {
    /// Corner vertices of the face polygon, `(x, y)` in source pixels.
    pub vertices: Vec<(i32, i32)>,
    pub confidence: f32,
}

/// Batch face detector.
///
/// `detect` returns exactly one box per input image, in input order. A
/// result list of any other length is a contract violation the caller
/// treats as fatal. Chunking into [`DETECTION_BATCH_SIZE`] batches is the
/// caller's job.
pub trait FaceDetector {
    fn detect(
        &self,
        images: &[Vec<u8>],
    ) -> impl Future<Output = Result<Vec<BoundingBox>, DetectError>> + Send;
}

/// Reduce one image's annotations to a single box.
///
/// No annotations means no face. Otherwise the highest confidence wins and
/// ties keep the earliest annotation.
pub fn select_face(annotations: &[FaceAnnotation]) -> BoundingBox {
    let mut best: Option<&FaceAnnotation> = None;
    for annotation in annotations {
        match best {
            Some(current) if annotation.confidence <= current.confidence => {}
            _ => best = Some(annotation),
        }
    }

    match best {
        Some(face) => BoundingBox::from_vertices(&face.vertices),
        None => BoundingBox::no_face(),
    }
}
