use serde::{Deserialize, Serialize};

/// Coordinate system a bounding box is expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxSpace {
    /// Fixed-size classifier input.
    Model,
    /// Pixel coordinates of the original camera frame.
    Frame,
}

/// Axis-aligned rectangle stored as `left, top, right, bottom`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: left.max(right),
            bottom: top.max(bottom),
        }
    }

    pub fn from_size(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    /// Overlap with `other`, or `None` when the two do not intersect.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        (right > left && bottom > top).then_some(BoundingBox {
            left,
            top,
            right,
            bottom,
        })
    }

    /// Sub-rectangle given as fractions `[x0, y0, x1, y1]` of this box.
    pub fn window(&self, fractions: [f32; 4]) -> BoundingBox {
        let (w, h) = (self.width(), self.height());
        BoundingBox::new(
            self.left + fractions[0] * w,
            self.top + fractions[1] * h,
            self.left + fractions[2] * w,
            self.top + fractions[3] * h,
        )
    }

    pub fn corners(&self) -> [(f32, f32); 4] {
        [
            (self.left, self.top),
            (self.right, self.top),
            (self.right, self.bottom),
            (self.left, self.bottom),
        ]
    }
}

/// Single detection returned by a classifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub space: BoxSpace,
    pub class_id: u32,
    pub label: String,
    pub score: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, class_id: u32, score: f32, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            space: BoxSpace::Model,
            class_id,
            label: label.into(),
            score,
        }
    }
}

/// Keep detections whose score reaches `min_confidence`, preserving order.
pub fn filter_by_confidence(detections: Vec<Detection>, min_confidence: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|det| det.score >= min_confidence)
        .collect()
}

/// Highest-scoring detection; the first one wins ties.
pub fn best_detection<'a>(detections: impl IntoIterator<Item = &'a Detection>) -> Option<&'a Detection> {
    detections.into_iter().fold(None, |best: Option<&Detection>, det| match best {
        Some(current) if current.score >= det.score => Some(current),
        _ => Some(det),
    })
}
