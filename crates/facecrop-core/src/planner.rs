//! Square crop placement around a detected face.

use crate::types::BoundingBox;

/// Crop side length as a multiple of the detected face height.
const FACE_HEIGHT_MULTIPLIER: i64 = 3;

/// Where the face's top edge should sit, as a fraction of the crop height.
const FACE_TOP_RATIO: f64 = 1.0 / 3.0;

/// Square region in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// How a source image maps onto its thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropPlan {
    /// Crop to this square before resizing.
    Region(CropRegion),
    /// No face: use the whole image as-is. Only the highlight path may treat
    /// this as a non-square rectangle.
    FullImage { width: u32, height: u32 },
}

/// Compute the crop for `face` inside a `image_width` × `image_height` image.
///
/// The square is three face-heights tall (capped by the shorter image side),
/// centered horizontally on the face, with the face top a third of the way
/// down. Out-of-bounds placements are shifted inward, never shrunk, so faces
/// near an edge end up off-center. The result always lies inside the image.
pub fn plan(face: &BoundingBox, image_width: u32, image_height: u32) -> CropPlan {
    if face.is_no_face() {
        return CropPlan::FullImage {
            width: image_width,
            height: image_height,
        };
    }

    let max_size = image_width.min(image_height) as i64;
    let target = face.height.max(0) as i64 * FACE_HEIGHT_MULTIPLIER;
    let size = target.min(max_size).max(1) as u32;
    let half = size as f64 / 2.0;

    let x = clamp_axis(face.center_x() - half, size, image_width);
    let y = clamp_axis(face.y as f64 - size as f64 * FACE_TOP_RATIO, size, image_height);

    CropPlan::Region(CropRegion { x, y, size })
}

/// Shift `start` so `[start, start + size)` fits in `[0, extent)`, then round.
fn clamp_axis(start: f64, size: u32, extent: u32) -> u32 {
    let max_start = extent.saturating_sub(size) as f64;
    start.clamp(0.0, max_start).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(plan: CropPlan) -> CropRegion {
        match plan {
            CropPlan::Region(r) => r,
            other => panic!("expected a region, got {other:?}"),
        }
    }

    #[test]
    fn test_centered_face_clamped_to_top() {
        let r = region(plan(&BoundingBox::new(400, 100, 200, 200), 1000, 800));
        assert_eq!(r, CropRegion { x: 200, y: 0, size: 600 });
    }

    #[test]
    fn test_face_top_lands_at_one_third() {
        // Room on every side: face top should sit size/3 below the crop top.
        let r = region(plan(&BoundingBox::new(900, 900, 100, 100), 2000, 2000));
        assert_eq!(r.size, 300);
        assert_eq!(r.x, 800);
        assert_eq!(r.y, 800);
    }

    #[test]
    fn test_no_face_spans_full_image() {
        let p = plan(&BoundingBox::no_face(), 500, 500);
        assert_eq!(p, CropPlan::FullImage { width: 500, height: 500 });
    }

    #[test]
    fn test_no_face_non_square_keeps_dimensions() {
        let p = plan(&BoundingBox::no_face(), 640, 480);
        assert_eq!(p, CropPlan::FullImage { width: 640, height: 480 });
    }

    #[test]
    fn test_corner_face_shifted_inward() {
        let r = region(plan(&BoundingBox::new(0, 0, 50, 50), 400, 300));
        assert_eq!(r, CropRegion { x: 0, y: 0, size: 150 });
    }

    #[test]
    fn test_bottom_right_face_shifted_inward() {
        let r = region(plan(&BoundingBox::new(350, 250, 50, 50), 400, 300));
        assert_eq!(r.size, 150);
        assert_eq!(r.x, 250);
        assert_eq!(r.y, 150);
    }

    #[test]
    fn test_large_face_capped_by_short_side() {
        let r = region(plan(&BoundingBox::new(10, 10, 300, 300), 320, 600));
        assert_eq!(r.size, 320);
        assert_eq!(r.x, 0);
    }

    #[test]
    fn test_fractional_center_rounds() {
        // center 100.5, size 99 -> start 51.0
        let r = region(plan(&BoundingBox::new(90, 200, 21, 33), 1000, 1000));
        assert_eq!(r.size, 99);
        assert_eq!(r.x, 51);
        assert_eq!(r.y, 167);
    }

    #[test]
    fn test_crop_always_contained() {
        let sizes = [(1u32, 1u32), (7, 3), (64, 64), (100, 37), (37, 100), (257, 199)];
        for &(w, h) in &sizes {
            for x in (0..w).step_by(((w / 6).max(1)) as usize) {
                for y in (0..h).step_by(((h / 6).max(1)) as usize) {
                    for bw in [1, (w - x) / 2, w - x] {
                        for bh in [1, (h - y) / 2, h - y] {
                            if bw == 0 || bh == 0 {
                                continue;
                            }
                            let face = BoundingBox::new(x as i32, y as i32, bw as i32, bh as i32);
                            let r = region(plan(&face, w, h));
                            assert!(r.size >= 1, "{face:?} in {w}x{h}");
                            assert!(r.size <= w.min(h), "{face:?} in {w}x{h}: {r:?}");
                            assert!(r.x + r.size <= w, "{face:?} in {w}x{h}: {r:?}");
                            assert!(r.y + r.size <= h, "{face:?} in {w}x{h}: {r:?}");
                        }
                    }
                }
            }
        }
    }
}
