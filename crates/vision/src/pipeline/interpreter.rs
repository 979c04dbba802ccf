//! Phase-2 line interpretation on a captured still.

use std::sync::Arc;

use image::RgbImage;
use rdt_ingest::Frame;
use rdt_ml_core::{BoundingBox, BoxSpace, Classifier, Detection, ModelInput, filter_by_confidence};
use tracing::debug;

use crate::pipeline::{
    config::InterpretationConfig,
    error::VisionError,
    framing::FramingEvaluator,
    imaging,
    localizer::{StripLocalizer, best_strip},
};

/// Verdict for one still frame. Only ever built when the control line is present.
#[derive(Clone, Debug)]
pub struct InterpretationResult {
    pub control: bool,
    pub line_a: bool,
    pub line_b: bool,
    pub control_confidence: Option<f32>,
    pub line_a_confidence: Option<f32>,
    pub line_b_confidence: Option<f32>,
    /// Phase-2 detections that passed the confidence threshold, in test-area model space.
    pub detections: Vec<Detection>,
    /// Strip rectangle in still-frame pixels.
    pub strip: BoundingBox,
    pub still: Arc<RgbImage>,
    pub test_area: Arc<RgbImage>,
    pub timestamp_ms: i64,
}

#[derive(Clone, Debug)]
pub enum Interpretation {
    Read(Box<InterpretationResult>),
    /// Phase 1 found no strip on the still.
    NoStrip,
    /// The strip was found but no usable test-area region could be cut from it.
    NoTestArea,
    /// Lines were classified but the control line is missing.
    InvalidRead { detections: Vec<Detection> },
}

impl Interpretation {
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Interpretation::Read(_) => "read",
            Interpretation::NoStrip => "no_strip",
            Interpretation::NoTestArea => "no_test_area",
            Interpretation::InvalidRead { .. } => "invalid_read",
        }
    }
}

/// Highest score among detections carrying `label`.
fn line_confidence(detections: &[Detection], label: &str) -> Option<f32> {
    detections
        .iter()
        .filter(|det| det.label == label)
        .map(|det| det.score)
        .fold(None, |best, score| Some(best.map_or(score, |b: f32| b.max(score))))
}

pub struct ResultInterpreter {
    localizer: StripLocalizer,
    classifier: Arc<dyn Classifier>,
    framing: FramingEvaluator,
    config: InterpretationConfig,
}

impl ResultInterpreter {
    pub fn new(
        localizer: StripLocalizer,
        classifier: Arc<dyn Classifier>,
        framing: FramingEvaluator,
        config: InterpretationConfig,
    ) -> Self {
        Self {
            localizer,
            classifier,
            framing,
            config,
        }
    }

    pub fn interpret(&mut self, still: &Frame) -> Result<Interpretation, VisionError> {
        let rgb = still.to_rgb()?;
        let luma = image::imageops::grayscale(&rgb);
        let loc = self.localizer.config().clone();

        let detections =
            self.localizer
                .detect(&rgb, still.timestamp_ms, loc.min_confidence, BoxSpace::Frame)?;
        let Some(strip) = best_strip(&detections, &loc.test_area_label).map(|det| det.bbox) else {
            return Ok(Interpretation::NoStrip);
        };

        let explicit_area = detections
            .iter()
            .filter(|det| det.label == loc.test_area_label)
            .max_by(|a, b| a.score.total_cmp(&b.score))
            .map(|det| det.bbox);

        let test_area = match explicit_area {
            Some(area) => imaging::crop_rgb(&rgb, &area)
                .map(|crop| imaging::rotate_quarter(&crop, loc.rotation)),
            None => self.window_from_strip(&rgb, &luma, &strip),
        };
        let Some(test_area) = test_area else {
            return Ok(Interpretation::NoTestArea);
        };

        let size = self.config.input_size;
        let model_input = imaging::resize_rgb(&test_area, size, size);
        let raw = self
            .classifier
            .detect(ModelInput {
                image: &model_input,
                source_timestamp_ms: still.timestamp_ms,
            })
            .map_err(|err| VisionError::classifier(self.classifier.name(), err))?;
        let lines = filter_by_confidence(raw, self.config.min_confidence);
        debug!(kept = lines.len(), explicit_area = explicit_area.is_some(), "line detections");

        let control_confidence = line_confidence(&lines, &self.config.control_label);
        if control_confidence.is_none() {
            return Ok(Interpretation::InvalidRead { detections: lines });
        }
        let line_a_confidence = line_confidence(&lines, &self.config.line_a_label);
        let line_b_confidence = line_confidence(&lines, &self.config.line_b_label);

        Ok(Interpretation::Read(Box::new(InterpretationResult {
            control: true,
            line_a: line_a_confidence.is_some(),
            line_b: line_b_confidence.is_some(),
            control_confidence,
            line_a_confidence,
            line_b_confidence,
            detections: lines,
            strip,
            still: Arc::new(rgb),
            test_area: Arc::new(test_area),
            timestamp_ms: still.timestamp_ms,
        })))
    }

    /// Cut the configured window out of the strip crop, turned upright first.
    fn window_from_strip(
        &self,
        rgb: &RgbImage,
        luma: &image::GrayImage,
        strip: &BoundingBox,
    ) -> Option<RgbImage> {
        let crop = imaging::crop_rgb(rgb, strip)?;
        let upright = imaging::rotate_quarter(&crop, self.localizer.config().rotation);
        let upright = if self.config.rotation_correction {
            let luma_crop = imaging::crop_luma(luma, strip)?;
            let tilt = self.framing.strip_angle(&luma_crop, strip);
            imaging::rotate_about_center(&upright, -tilt)
        } else {
            upright
        };

        let (w, h) = upright.dimensions();
        let window = BoundingBox::from_size(w as f32, h as f32).window(self.config.test_area_window);
        imaging::crop_rgb(&upright, &window)
    }
}
