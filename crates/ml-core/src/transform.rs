//! Affine mapping between camera-frame pixels and classifier input space.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detection::{BoundingBox, BoxSpace, Detection};

/// Clockwise rotation applied to a frame before it is scaled into model space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    None,
    #[serde(rename = "90")]
    Cw90,
    #[serde(rename = "180")]
    Cw180,
    #[serde(rename = "270")]
    Cw270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Cw90),
            180 => Some(Rotation::Cw180),
            270 => Some(Rotation::Cw270),
            _ => None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    /// Dimensions of a `width x height` image after this rotation.
    pub fn rotated_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Rotation::None | Rotation::Cw180 => (width, height),
            Rotation::Cw90 | Rotation::Cw270 => (height, width),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("degenerate geometry: frame {frame_width}x{frame_height}, model {model_width}x{model_height}")]
    Degenerate {
        frame_width: u32,
        frame_height: u32,
        model_width: u32,
        model_height: u32,
    },
}

/// Forward (frame to model) and inverse (model to frame) affine maps for one
/// frame geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinateTransform {
    frame_size: (u32, u32),
    model_size: (u32, u32),
    rotation: Rotation,
    forward: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl CoordinateTransform {
    pub fn new(
        frame_size: (u32, u32),
        model_size: (u32, u32),
        rotation: Rotation,
    ) -> Result<Self, TransformError> {
        let degenerate = || TransformError::Degenerate {
            frame_width: frame_size.0,
            frame_height: frame_size.1,
            model_width: model_size.0,
            model_height: model_size.1,
        };
        if frame_size.0 == 0 || frame_size.1 == 0 || model_size.0 == 0 || model_size.1 == 0 {
            return Err(degenerate());
        }

        let (w, h) = (frame_size.0 as f64, frame_size.1 as f64);
        let rotate = match rotation {
            Rotation::None => Matrix3::identity(),
            Rotation::Cw90 => Matrix3::new(0.0, -1.0, h, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0),
            Rotation::Cw180 => Matrix3::new(-1.0, 0.0, w, 0.0, -1.0, h, 0.0, 0.0, 1.0),
            Rotation::Cw270 => Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, w, 0.0, 0.0, 1.0),
        };
        let (rw, rh) = rotation.rotated_size(frame_size.0, frame_size.1);
        let scale = Matrix3::new_nonuniform_scaling(&nalgebra::Vector2::new(
            model_size.0 as f64 / rw as f64,
            model_size.1 as f64 / rh as f64,
        ));
        let forward = scale * rotate;
        let inverse = forward.try_inverse().ok_or_else(degenerate)?;

        Ok(Self {
            frame_size,
            model_size,
            rotation,
            forward,
            inverse,
        })
    }

    /// Whether this transform was built for the given geometry.
    pub fn matches(&self, frame_size: (u32, u32), model_size: (u32, u32), rotation: Rotation) -> bool {
        self.frame_size == frame_size && self.model_size == model_size && self.rotation == rotation
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    pub fn model_size(&self) -> (u32, u32) {
        self.model_size
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn forward(&self, p: (f64, f64)) -> (f64, f64) {
        apply(&self.forward, p)
    }

    pub fn inverse(&self, p: (f64, f64)) -> (f64, f64) {
        apply(&self.inverse, p)
    }

    /// Model-space box to the frame-space box bounding its mapped corners.
    pub fn inverse_box(&self, bbox: &BoundingBox) -> BoundingBox {
        map_box(&self.inverse, bbox)
    }

    /// Re-express a model-space detection in frame pixels.
    pub fn to_frame_space(&self, mut detection: Detection) -> Detection {
        if detection.space == BoxSpace::Model {
            detection.bbox = self.inverse_box(&detection.bbox);
            detection.space = BoxSpace::Frame;
        }
        detection
    }
}

fn apply(m: &Matrix3<f64>, (x, y): (f64, f64)) -> (f64, f64) {
    let v = m * Vector3::new(x, y, 1.0);
    (v[0], v[1])
}

fn map_box(m: &Matrix3<f64>, bbox: &BoundingBox) -> BoundingBox {
    let mut xs = [0.0f64; 4];
    let mut ys = [0.0f64; 4];
    for (i, (x, y)) in bbox.corners().into_iter().enumerate() {
        let (mx, my) = apply(m, (x as f64, y as f64));
        xs[i] = mx;
        ys[i] = my;
    }
    let min = |v: &[f64; 4]| v.iter().copied().fold(f64::INFINITY, f64::min);
    let max = |v: &[f64; 4]| v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    BoundingBox::new(
        min(&xs) as f32,
        min(&ys) as f32,
        max(&xs) as f32,
        max(&ys) as f32,
    )
}
