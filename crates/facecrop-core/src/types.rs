use serde::{Deserialize, Serialize};

/// Face rectangle produced by detection, in source-image pixels.
///
/// `no_face` marks "detection ran and found nothing usable". When it is set
/// the geometry fields carry no meaning and must not reach crop math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub no_face: bool,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            no_face: false,
        }
    }

    /// The "detected, nothing found" sentinel.
    pub fn no_face() -> Self {
        Self {
            no_face: true,
            ..Self::default()
        }
    }

    /// Reduce a polygon to its axis-aligned bounds via min/max over x and y.
    ///
    /// An empty polygon yields the no-face sentinel.
    pub fn from_vertices(vertices: &[(i32, i32)]) -> Self {
        let Some(&(first_x, first_y)) = vertices.first() else {
            return Self::no_face();
        };

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first_x, first_y, first_x, first_y);
        for &(x, y) in &vertices[1..] {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        Self::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn is_no_face(&self) -> bool {
        self.no_face
    }

    /// Horizontal center of the face.
    pub fn center_x(&self) -> f64 {
        self.x as f64 + self.width as f64 / 2.0
    }
}
