//! facecrop-vision — Batch client for the external face-detection service.
//!
//! Speaks the `images:annotate` JSON protocol: one request carries a batch of
//! base64-encoded images, one response entry comes back per image.

pub mod client;
pub mod wire;

pub use client::{VisionClient, VisionConfig, VisionError, DEFAULT_ENDPOINT};
