//! Thumbnail and debug-highlight rendering.
//!
//! Everything here works on in-memory images and returns encoded bytes;
//! writing files is left to the pipeline.

use crate::planner::CropPlan;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Deserialize;
use std::borrow::Cow;
use std::str::FromStr;
use thiserror::Error;

/// Side length of every thumbnail, in pixels.
pub const THUMBNAIL_SIZE: u32 = 256;

const JPEG_QUALITY: u8 = 95;
const SHARPEN_SIGMA: f32 = 0.5;
const HIGHLIGHT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const HIGHLIGHT_MIN_THICKNESS: u32 = 3;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
}

/// Encoding used for rendered assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Baseline JPEG at a fixed high quality.
    #[default]
    Jpeg,
    /// Lossless WebP.
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(format!("unknown output format '{other}' (expected jpeg or webp)")),
        }
    }
}

/// Decode raw file bytes into an image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, RenderError> {
    image::load_from_memory(bytes).map_err(|e| RenderError::Decode(e.to_string()))
}

/// Renders thumbnails and highlight previews in one output format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailRenderer {
    format: OutputFormat,
}

impl ThumbnailRenderer {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Crop to `plan`, resize to [`THUMBNAIL_SIZE`] square, sharpen lightly and encode.
    ///
    /// A [`CropPlan::FullImage`] plan skips cropping entirely; the whole image
    /// is resized to the square, squashing non-square sources.
    pub fn render_thumbnail(
        &self,
        image: &DynamicImage,
        plan: &CropPlan,
    ) -> Result<Vec<u8>, RenderError> {
        let source = match plan {
            CropPlan::Region(r) => Cow::Owned(image.crop_imm(r.x, r.y, r.size, r.size)),
            CropPlan::FullImage { .. } => Cow::Borrowed(image),
        };

        let thumb = source
            .resize_exact(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Lanczos3)
            .unsharpen(SHARPEN_SIGMA, 0);

        encode(&flatten_alpha(&thumb), self.format)
    }

    /// Draw the plan's rectangle onto a full-size copy of `image` and encode it.
    pub fn render_highlight(
        &self,
        image: &DynamicImage,
        plan: &CropPlan,
    ) -> Result<Vec<u8>, RenderError> {
        let mut canvas = flatten_alpha(image);

        let (x, y, width, height) = match *plan {
            CropPlan::Region(r) => (r.x, r.y, r.size, r.size),
            CropPlan::FullImage { width, height } => (0, 0, width, height),
        };
        let thickness = (canvas.width().min(canvas.height()) / 150).max(HIGHLIGHT_MIN_THICKNESS);
        draw_thick_rect(&mut canvas, x, y, width, height, thickness);

        encode(&canvas, self.format)
    }
}

/// Outline a rectangle `thickness` pixels wide, growing inward.
fn draw_thick_rect(canvas: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, thickness: u32) {
    for inset in 0..thickness {
        let (w, h) = match (width.checked_sub(inset * 2), height.checked_sub(inset * 2)) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => break,
        };
        let rect = Rect::at((x + inset) as i32, (y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, rect, HIGHLIGHT_COLOR);
    }
}

/// Composite any alpha channel onto white and drop it.
fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as f32 / 255.0;
        let over_white = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        Rgb([over_white(r), over_white(g), over_white(b)])
    })
}

/// Encode RGB pixels. Neither encoder is handed EXIF or ICC data, so the
/// output carries no metadata.
fn encode(image: &RgbImage, format: OutputFormat) -> Result<Vec<u8>, RenderError> {
    let mut buffer = Vec::new();
    let (width, height) = image.dimensions();

    match format {
        OutputFormat::Jpeg => JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
            .write_image(image.as_raw(), width, height, ExtendedColorType::Rgb8),
        OutputFormat::Webp => WebPEncoder::new_lossless(&mut buffer)
            .write_image(image.as_raw(), width, height, ExtendedColorType::Rgb8),
    }
    .map_err(|e| RenderError::Encode(e.to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::CropRegion;
    use image::{GenericImageView, Rgba, RgbaImage};

    /// Left half red, right half blue.
    fn split_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        }))
    }

    #[test]
    fn test_thumbnail_is_jpeg_256() {
        let image = split_image(1000, 800);
        let plan = CropPlan::Region(CropRegion { x: 200, y: 0, size: 600 });
        let bytes = ThumbnailRenderer::default().render_thumbnail(&image, &plan).unwrap();

        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
        let thumb = decode(&bytes).unwrap();
        assert_eq!(thumb.dimensions(), (THUMBNAIL_SIZE, THUMBNAIL_SIZE));
    }

    #[test]
    fn test_thumbnail_uses_crop_region() {
        let image = split_image(400, 200);
        // Square entirely within the blue half.
        let plan = CropPlan::Region(CropRegion { x: 250, y: 20, size: 100 });
        let renderer = ThumbnailRenderer::new(OutputFormat::Webp);
        let thumb = decode(&renderer.render_thumbnail(&image, &plan).unwrap()).unwrap();

        assert_eq!(thumb.get_pixel(128, 128), Rgba([0, 0, 255, 255]));
        assert_eq!(thumb.get_pixel(0, 0), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn test_no_face_thumbnail_squashes_full_image() {
        let image = split_image(640, 480);
        let plan = CropPlan::FullImage { width: 640, height: 480 };
        let renderer = ThumbnailRenderer::new(OutputFormat::Webp);
        let thumb = decode(&renderer.render_thumbnail(&image, &plan).unwrap()).unwrap();

        assert_eq!(thumb.dimensions(), (THUMBNAIL_SIZE, THUMBNAIL_SIZE));
        // Both halves survive: no crop happened.
        assert_eq!(thumb.get_pixel(10, 128), Rgba([255, 0, 0, 255]));
        assert_eq!(thumb.get_pixel(245, 128), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn test_thumbnail_is_deterministic() {
        let image = split_image(300, 300);
        let plan = CropPlan::Region(CropRegion { x: 50, y: 50, size: 200 });
        let renderer = ThumbnailRenderer::default();
        let a = renderer.render_thumbnail(&image, &plan).unwrap();
        let b = renderer.render_thumbnail(&image, &plan).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_highlight_keeps_size_and_draws_border() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([0, 255, 0])));
        let plan = CropPlan::Region(CropRegion { x: 50, y: 20, size: 100 });
        let renderer = ThumbnailRenderer::new(OutputFormat::Webp);
        let out = decode(&renderer.render_highlight(&image, &plan).unwrap()).unwrap();

        assert_eq!(out.dimensions(), (300, 200));
        assert_eq!(out.get_pixel(50, 20), Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(149, 119), Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(52, 70), Rgba([255, 0, 0, 255]));
        // Interior and exterior untouched.
        assert_eq!(out.get_pixel(100, 70), Rgba([0, 255, 0, 255]));
        assert_eq!(out.get_pixel(200, 150), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn test_highlight_full_image_border() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(500, 500, Rgb([0, 0, 0])));
        let plan = CropPlan::FullImage { width: 500, height: 500 };
        let renderer = ThumbnailRenderer::new(OutputFormat::Webp);
        let out = decode(&renderer.render_highlight(&image, &plan).unwrap()).unwrap();

        assert_eq!(out.dimensions(), (500, 500));
        assert_eq!(out.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(499, 250), Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(250, 250), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_flatten_alpha_over_white() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])));
        let flat = flatten_alpha(&image);
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(decode(b"definitely not an image"), Err(RenderError::Decode(_))));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("webp".parse::<OutputFormat>().unwrap(), OutputFormat::Webp);
        assert!("gif".parse::<OutputFormat>().is_err());
    }
}
