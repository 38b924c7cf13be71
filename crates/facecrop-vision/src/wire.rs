//! JSON shapes for the `images:annotate` endpoint.
//!
//! Only the fields the face pass needs are modelled. The service omits
//! zero-valued vertex coordinates and empty annotation lists, hence the
//! defaults everywhere.

use facecrop_core::FaceAnnotation;
use serde::{Deserialize, Serialize};

pub const FACE_DETECTION: &str = "FACE_DETECTION";

#[derive(Debug, Serialize)]
pub struct AnnotateRequest {
    pub requests: Vec<ImageRequest>,
}

#[derive(Debug, Serialize)]
pub struct ImageRequest {
    pub image: ImageContent,
    pub features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
pub struct ImageContent {
    /// Base64-encoded file bytes.
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub max_results: u32,
}

#[derive(Debug, Deserialize)]
pub struct AnnotateResponse {
    #[serde(default)]
    pub responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResponse {
    #[serde(default)]
    pub face_annotations: Vec<WireFace>,
    pub error: Option<Status>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFace {
    #[serde(default)]
    pub bounding_poly: BoundingPoly,
    #[serde(default)]
    pub detection_confidence: f32,
}

#[derive(Debug, Default, Deserialize)]
pub struct BoundingPoly {
    #[serde(default)]
    pub vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize)]
pub struct Vertex {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

#[derive(Debug, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl From<&WireFace> for FaceAnnotation {
    fn from(face: &WireFace) -> Self {
        FaceAnnotation {
            vertices: face.bounding_poly.vertices.iter().map(|v| (v.x, v.y)).collect(),
            confidence: face.detection_confidence,
        }
    }
}
