//! HTTP client for the `images:annotate` face-detection endpoint.

use crate::wire::{AnnotateRequest, AnnotateResponse, Feature, ImageContent, ImageRequest, FACE_DETECTION};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use facecrop_core::{select_face, BoundingBox, DetectError, FaceAnnotation, FaceDetector};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com";
const ANNOTATE_PATH: &str = "/v1/images:annotate";
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Upper bound on faces returned per image; only the best one is used.
const MAX_FACES_PER_IMAGE: u32 = 10;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("HTTP client setup failed: {0}")]
    Client(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("image {index} rejected by service (code {code}): {message}")]
    Image {
        index: usize,
        code: i32,
        message: String,
    },
    #[error("service returned {actual} responses for {expected} images")]
    LengthMismatch { expected: usize, actual: usize },
}

impl VisionError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            VisionError::Request(e) => e.is_timeout() || e.is_connect(),
            VisionError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

impl From<VisionError> for DetectError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::LengthMismatch { expected, actual } => {
                DetectError::LengthMismatch { expected, actual }
            }
            VisionError::Request(e) => DetectError::Transport(e.to_string()),
            VisionError::Client(msg) => DetectError::Transport(msg),
            other => DetectError::Service(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Base URL, without the `/v1/...` path.
    pub endpoint: String,
    pub api_key: String,
    /// Extra attempts after the first for transient failures.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
}

impl VisionConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Batch face detector backed by the annotate endpoint.
pub struct VisionClient {
    client: Client,
    config: VisionConfig,
    url: String,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> Result<Self, VisionError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| VisionError::Client(e.to_string()))?;
        let url = format!("{}{ANNOTATE_PATH}", config.endpoint.trim_end_matches('/'));

        tracing::info!(url = %url, max_retries = config.max_retries, "vision client ready");
        Ok(Self { client, config, url })
    }

    /// Annotate `images` in a single request, retrying transient failures.
    ///
    /// Returns one annotation list per image, in request order.
    pub async fn annotate(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<FaceAnnotation>>, VisionError> {
        let request = AnnotateRequest {
            requests: images
                .iter()
                .map(|bytes| ImageRequest {
                    image: ImageContent {
                        content: STANDARD.encode(bytes),
                    },
                    features: vec![Feature {
                        kind: FACE_DETECTION,
                        max_results: MAX_FACES_PER_IMAGE,
                    }],
                })
                .collect(),
        };

        let mut attempt = 0;
        loop {
            match self.annotate_once(&request).await {
                Ok(response) => return collect_faces(response, images.len()),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient detection failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn annotate_once(&self, request: &AnnotateRequest) -> Result<AnnotateResponse, VisionError> {
        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Status { status, body });
        }

        Ok(response.json().await?)
    }
}

/// `base * 2^attempt`, saturating instead of overflowing.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Check the response lines up with the request and flatten it.
fn collect_faces(
    response: AnnotateResponse,
    expected: usize,
) -> Result<Vec<Vec<FaceAnnotation>>, VisionError> {
    if response.responses.len() != expected {
        return Err(VisionError::LengthMismatch {
            expected,
            actual: response.responses.len(),
        });
    }

    response
        .responses
        .into_iter()
        .enumerate()
        .map(|(index, image)| match image.error {
            Some(status) => Err(VisionError::Image {
                index,
                code: status.code,
                message: status.message,
            }),
            None => Ok(image.face_annotations.iter().map(FaceAnnotation::from).collect()),
        })
        .collect()
}

impl FaceDetector for VisionClient {
    async fn detect(&self, images: &[Vec<u8>]) -> Result<Vec<BoundingBox>, DetectError> {
        let annotations = self.annotate(images).await?;
        let boxes: Vec<BoundingBox> = annotations.iter().map(|faces| select_face(faces)).collect();
        tracing::debug!(
            images = images.len(),
            with_face = boxes.iter().filter(|b| !b.is_no_face()).count(),
            "detection batch complete"
        );
        Ok(boxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> VisionClient {
        let mut config = VisionConfig::new("test-key");
        config.endpoint = server.uri();
        config.retry_base_delay = Duration::from_millis(1);
        config.request_timeout = Duration::from_secs(5);
        VisionClient::new(config).unwrap()
    }

    fn face(x0: i32, y0: i32, x1: i32, y1: i32, confidence: f32) -> serde_json::Value {
        json!({
            "boundingPoly": {"vertices": [
                {"x": x0, "y": y0}, {"x": x1, "y": y0}, {"x": x1, "y": y1}, {"x": x0, "y": y1}
            ]},
            "detectionConfidence": confidence
        })
    }

    #[tokio::test]
    async fn test_detect_maps_responses_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({"requests": [
                {"features": [{"type": "FACE_DETECTION"}]},
                {"features": [{"type": "FACE_DETECTION"}]}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responses": [
                {"faceAnnotations": [face(0, 0, 10, 10, 0.5), face(400, 100, 600, 300, 0.97)]},
                {}
            ]})))
            .expect(1)
            .mount(&server)
            .await;

        let boxes = client_for(&server)
            .detect(&[b"first".to_vec(), b"second".to_vec()])
            .await
            .unwrap();

        assert_eq!(boxes, vec![BoundingBox::new(400, 100, 200, 200), BoundingBox::no_face()]);
    }

    #[tokio::test]
    async fn test_detect_length_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responses": [{}]})))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .detect(&[vec![1], vec![2]])
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::LengthMismatch { expected: 2, actual: 1 }));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responses": [
                {"faceAnnotations": [face(5, 5, 15, 25, 0.9)]}
            ]})))
            .expect(1)
            .mount(&server)
            .await;

        let boxes = client_for(&server).detect(&[vec![0]]).await.unwrap();
        assert_eq!(boxes, vec![BoundingBox::new(5, 5, 10, 20)]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let err = client_for(&server).detect(&[vec![0]]).await.unwrap_err();
        assert!(matches!(err, DetectError::Service(_)));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server).detect(&[vec![0]]).await.unwrap_err();
        assert!(err.to_string().contains("API key not valid"));
    }

    #[tokio::test]
    async fn test_per_image_error_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"responses": [
                {},
                {"error": {"code": 3, "message": "Bad image data."}}
            ]})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .detect(&[vec![0], vec![1]])
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Service(ref msg) if msg.contains("image 1")));
    }

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 40), base.saturating_mul(u32::MAX));
        assert_eq!(backoff_delay(Duration::MAX, 2), Duration::MAX);
    }

    #[test]
    fn test_transient_classification() {
        let status = |code: u16| VisionError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert!(status(429).is_transient());
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(403).is_transient());
        assert!(!VisionError::LengthMismatch { expected: 1, actual: 0 }.is_transient());
    }
}
