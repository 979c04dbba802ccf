use image::RgbImage;
use thiserror::Error;

use crate::detection::Detection;

/// Image handed to a classifier, already resampled to its input size.
#[derive(Clone, Copy, Debug)]
pub struct ModelInput<'a> {
    pub image: &'a RgbImage,
    /// Timestamp of the camera frame this input was derived from.
    pub source_timestamp_ms: i64,
}

impl ModelInput<'_> {
    pub fn input_size(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Object-detection backend used by both pipeline phases.
///
/// Implementations return boxes in model space; the caller filters by
/// confidence and maps coordinates. A backend is only ever invoked from one
/// worker at a time per phase, but must be shareable across threads.
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, input: ModelInput<'_>) -> Result<Vec<Detection>, ClassifierError>;
}
