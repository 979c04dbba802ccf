//! Phase-1 strip localization.

use std::sync::Arc;

use image::RgbImage;
use rdt_ml_core::{
    BoxSpace, Classifier, CoordinateTransform, Detection, ModelInput, best_detection,
    filter_by_confidence,
};

use crate::pipeline::{config::LocalizationConfig, error::VisionError, imaging};

/// Runs the strip classifier over a model-space copy of a frame.
///
/// Each worker owns its own localizer; the coordinate transform is rebuilt
/// only when the frame geometry changes.
pub struct StripLocalizer {
    classifier: Arc<dyn Classifier>,
    config: LocalizationConfig,
    transform: Option<CoordinateTransform>,
}

impl StripLocalizer {
    pub fn new(classifier: Arc<dyn Classifier>, config: LocalizationConfig) -> Self {
        Self {
            classifier,
            config,
            transform: None,
        }
    }

    pub fn config(&self) -> &LocalizationConfig {
        &self.config
    }

    /// Transform for a frame of `frame_size`, reusing the cached one when it still fits.
    pub fn transform_for(&mut self, frame_size: (u32, u32)) -> Result<CoordinateTransform, VisionError> {
        let model_size = (self.config.input_size, self.config.input_size);
        let rotation = self.config.rotation;
        if let Some(cached) = self
            .transform
            .as_ref()
            .filter(|t| t.matches(frame_size, model_size, rotation))
        {
            return Ok(cached.clone());
        }
        tracing::debug!(?frame_size, ?model_size, ?rotation, "rebuilding coordinate transform");
        let transform = CoordinateTransform::new(frame_size, model_size, rotation)?;
        self.transform = Some(transform.clone());
        Ok(transform)
    }

    /// Detections scoring at least `min_confidence`, in the requested space.
    ///
    /// An empty result means no strip was found; it is never an error.
    pub fn detect(
        &mut self,
        frame: &RgbImage,
        timestamp_ms: i64,
        min_confidence: f32,
        space: BoxSpace,
    ) -> Result<Vec<Detection>, VisionError> {
        let rotation = self.config.rotation;
        let transform = self.transform_for(frame.dimensions())?;
        let (mw, mh) = transform.model_size();
        let model_image = imaging::resize_rgb(&imaging::rotate_quarter(frame, rotation), mw, mh);

        let raw = self
            .classifier
            .detect(ModelInput {
                image: &model_image,
                source_timestamp_ms: timestamp_ms,
            })
            .map_err(|err| VisionError::classifier(self.classifier.name(), err))?;
        let raw_count = raw.len();

        let kept = filter_by_confidence(raw, min_confidence);
        tracing::debug!(raw = raw_count, kept = kept.len(), min_confidence, "strip localization");

        Ok(match space {
            BoxSpace::Model => kept,
            BoxSpace::Frame => kept
                .into_iter()
                .map(|det| transform.to_frame_space(det))
                .collect(),
        })
    }
}

/// Best strip candidate, ignoring detections that outline the test area.
pub fn best_strip<'a>(detections: &'a [Detection], test_area_label: &str) -> Option<&'a Detection> {
    best_detection(detections.iter().filter(|det| det.label != test_area_label))
}
