//! Framing evaluation: pose and image-quality checks on the localized strip.

use std::fmt;

use image::GrayImage;
use rdt_ml_core::{BoundingBox, Rotation};
use serde::{Deserialize, Serialize};

use crate::pipeline::{config::FramingConfig, imaging};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    TooClose,
    TooFar,
    Ok,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exposure {
    Under,
    Normal,
    Over,
}

/// Reason a frame was not good enough, with a coaching message for the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotSteady,
    StripNotFound,
    NotCentered,
    TooClose,
    TooFar,
    BadOrientation,
    Shadow,
    NotSharp,
    Underexposed,
    Overexposed,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::NotSteady => "not_steady",
            FailureReason::StripNotFound => "strip_not_found",
            FailureReason::NotCentered => "not_centered",
            FailureReason::TooClose => "too_close",
            FailureReason::TooFar => "too_far",
            FailureReason::BadOrientation => "bad_orientation",
            FailureReason::Shadow => "shadow",
            FailureReason::NotSharp => "not_sharp",
            FailureReason::Underexposed => "underexposed",
            FailureReason::Overexposed => "overexposed",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            FailureReason::NotSteady => "Hold the phone steady",
            FailureReason::StripNotFound => "Place the test strip inside the frame",
            FailureReason::NotCentered => "Center the test strip",
            FailureReason::TooClose => "Move the phone farther away",
            FailureReason::TooFar => "Move the phone closer",
            FailureReason::BadOrientation => "Turn the strip upright",
            FailureReason::Shadow => "Avoid casting a shadow on the strip",
            FailureReason::NotSharp => "Hold still while the camera focuses",
            FailureReason::Underexposed => "Find a brighter spot",
            FailureReason::Overexposed => "Reduce glare on the strip",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Placement of the best strip detection within the frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StripPose {
    /// Strip rectangle in frame pixels.
    pub strip: BoundingBox,
    /// Long-axis tilt from display vertical, degrees in `(-90, 90]`.
    pub angle_deg: f64,
    pub centered: bool,
    pub orientation_ok: bool,
    pub size: SizeClass,
    pub area_ratio: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub steady: bool,
    pub sharp: bool,
    pub sharpness: f32,
    pub exposure: Exposure,
    pub shadow: bool,
}

/// Outcome of every framing check for one preview frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FramingReport {
    pub pose: Option<StripPose>,
    pub quality: QualityVerdict,
    pub passed_all: bool,
    pub reasons: Vec<FailureReason>,
}

impl FramingReport {
    /// Report for a frame rejected by the steadiness gate before localization.
    pub fn not_steady() -> Self {
        Self {
            pose: None,
            quality: QualityVerdict {
                steady: false,
                sharp: false,
                sharpness: 0.0,
                exposure: Exposure::Normal,
                shadow: false,
            },
            passed_all: false,
            reasons: vec![FailureReason::NotSteady],
        }
    }
}

pub fn is_centered(strip: &BoundingBox, width: u32, height: u32, tolerance: f32) -> bool {
    let (cx, cy) = strip.center();
    let (w, h) = (width as f32, height as f32);
    (cx - w / 2.0).abs() <= tolerance * w && (cy - h / 2.0).abs() <= tolerance * h
}

pub fn classify_size(area_ratio: f32, config: &FramingConfig) -> SizeClass {
    if area_ratio > config.too_close_ratio {
        SizeClass::TooClose
    } else if area_ratio < config.too_far_ratio {
        SizeClass::TooFar
    } else {
        SizeClass::Ok
    }
}

pub fn classify_exposure(dark_fraction: f32, bright_fraction: f32, config: &FramingConfig) -> Exposure {
    if dark_fraction > config.max_dark_fraction {
        Exposure::Under
    } else if bright_fraction > config.max_bright_fraction {
        Exposure::Over
    } else {
        Exposure::Normal
    }
}

/// Fold an angle in degrees into `(-90, 90]`; an axis has no direction.
fn normalize_axis(deg: f64) -> f64 {
    let folded = deg.rem_euclid(180.0);
    if folded > 90.0 { folded - 180.0 } else { folded }
}

/// Runs every framing check; none short-circuits so the UI can list all failures.
#[derive(Clone, Debug)]
pub struct FramingEvaluator {
    config: FramingConfig,
    rotation: Rotation,
}

impl FramingEvaluator {
    pub fn new(config: FramingConfig, rotation: Rotation) -> Self {
        Self { config, rotation }
    }

    /// Tilt of the strip inside `crop`, falling back to the box aspect ratio
    /// when the bright region has no dominant axis.
    pub fn strip_angle(&self, crop: &GrayImage, strip: &BoundingBox) -> f64 {
        let frame_tilt = imaging::principal_tilt(crop)
            .unwrap_or(if strip.height() >= strip.width() { 0.0 } else { 90.0 });
        normalize_axis(frame_tilt + self.rotation.degrees() as f64)
    }

    fn quality(&self, region: &GrayImage, steady: bool, check_shadow: bool) -> QualityVerdict {
        let cfg = &self.config;
        let (dark, bright) = imaging::clip_fractions(region, cfg.dark_level, cfg.bright_level);
        let sharpness = imaging::laplacian_variance(region);
        let shadow = check_shadow && {
            let bands = imaging::band_means(region, cfg.shadow_bands);
            let max = bands.iter().copied().fold(0.0f32, f32::max);
            let min = bands.iter().copied().fold(f32::INFINITY, f32::min);
            max > 0.0 && min < cfg.shadow_ratio * max
        };
        QualityVerdict {
            steady,
            sharp: sharpness >= cfg.sharpness_threshold,
            sharpness,
            exposure: classify_exposure(dark, bright, cfg),
            shadow,
        }
    }

    /// Evaluate a frame in which no strip survived confidence filtering.
    pub fn evaluate_without_strip(&self, luma: &GrayImage, steady: bool) -> FramingReport {
        let quality = self.quality(luma, steady, false);
        let mut reasons = vec![FailureReason::StripNotFound];
        push_quality_reasons(&mut reasons, &quality);
        FramingReport {
            pose: None,
            quality,
            passed_all: false,
            reasons,
        }
    }

    /// Evaluate a frame given the frame-space box of the best strip detection.
    pub fn evaluate(&self, luma: &GrayImage, strip: &BoundingBox, steady: bool) -> FramingReport {
        let (width, height) = luma.dimensions();
        let frame_box = BoundingBox::from_size(width as f32, height as f32);
        let visible = strip.intersection(&frame_box);
        let area_ratio = visible.map_or(0.0, |b| b.area()) / frame_box.area();

        let crop = visible.and_then(|b| imaging::crop_luma(luma, &b));
        let Some(crop) = crop else {
            return self.evaluate_without_strip(luma, steady);
        };

        let angle_deg = self.strip_angle(&crop, strip);
        let pose = StripPose {
            strip: *strip,
            angle_deg,
            centered: is_centered(strip, width, height, self.config.center_tolerance),
            orientation_ok: angle_deg.abs() <= self.config.angle_tolerance_deg,
            size: classify_size(area_ratio, &self.config),
            area_ratio,
        };
        let quality = self.quality(&crop, steady, true);

        let mut reasons = Vec::new();
        if !steady {
            reasons.push(FailureReason::NotSteady);
        }
        if !pose.centered {
            reasons.push(FailureReason::NotCentered);
        }
        match pose.size {
            SizeClass::TooClose => reasons.push(FailureReason::TooClose),
            SizeClass::TooFar => reasons.push(FailureReason::TooFar),
            SizeClass::Ok => {}
        }
        if !pose.orientation_ok {
            reasons.push(FailureReason::BadOrientation);
        }
        push_quality_reasons(&mut reasons, &quality);

        FramingReport {
            pose: Some(pose),
            quality,
            passed_all: reasons.is_empty(),
            reasons,
        }
    }
}

fn push_quality_reasons(reasons: &mut Vec<FailureReason>, quality: &QualityVerdict) {
    if quality.shadow {
        reasons.push(FailureReason::Shadow);
    }
    if !quality.sharp {
        reasons.push(FailureReason::NotSharp);
    }
    match quality.exposure {
        Exposure::Under => reasons.push(FailureReason::Underexposed),
        Exposure::Over => reasons.push(FailureReason::Overexposed),
        Exposure::Normal => {}
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use image::Luma;

    use super::*;

    fn checker(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([if (x + y) % 2 == 0 { 200 } else { 120 }]))
    }

    fn evaluator() -> FramingEvaluator {
        FramingEvaluator::new(FramingConfig::default(), Rotation::None)
    }

    #[test]
    fn full_frame_box_is_always_centered() {
        let full = BoundingBox::from_size(640.0, 480.0);
        for tolerance in [0.0, 0.05, 0.5] {
            assert!(is_centered(&full, 640, 480, tolerance));
        }
    }

    #[test]
    fn offset_beyond_tolerance_is_never_centered() {
        // Centre shifted 70px right in a 640px frame: 0.109 of the width.
        let shifted = BoundingBox::new(320.0, 140.0, 460.0, 340.0);
        assert!(!is_centered(&shifted, 640, 480, 0.1));
        assert!(is_centered(&shifted, 640, 480, 0.11));
    }

    #[test]
    fn size_buckets_follow_the_ratio_thresholds() {
        let cfg = FramingConfig::default();
        assert_eq!(classify_size(0.5, &cfg), SizeClass::TooClose);
        assert_eq!(classify_size(0.01, &cfg), SizeClass::TooFar);
        assert_eq!(classify_size(0.2, &cfg), SizeClass::Ok);
    }

    #[test]
    fn well_framed_strip_passes_every_check() {
        let luma = checker(300, 600);
        let strip = BoundingBox::new(100.0, 200.0, 200.0, 400.0);
        let report = evaluator().evaluate(&luma, &strip, true);

        let pose = report.pose.as_ref().unwrap();
        assert!(pose.centered);
        assert!(pose.orientation_ok);
        assert_eq!(pose.size, SizeClass::Ok);
        assert_abs_diff_eq!(pose.area_ratio, 1.0 / 9.0, epsilon = 1e-4);
        assert!(report.quality.sharp);
        assert!(!report.quality.shadow);
        assert_eq!(report.quality.exposure, Exposure::Normal);
        assert!(report.passed_all, "reasons: {:?}", report.reasons);
    }

    #[test]
    fn every_failing_check_is_reported() {
        // Flat dark frame with a small off-centre box: blurred, underexposed, far, off-centre.
        let luma = GrayImage::from_pixel(300, 600, Luma([5]));
        let strip = BoundingBox::new(0.0, 0.0, 40.0, 80.0);
        let report = evaluator().evaluate(&luma, &strip, true);
        assert!(!report.passed_all);
        for reason in [
            FailureReason::NotCentered,
            FailureReason::TooFar,
            FailureReason::NotSharp,
            FailureReason::Underexposed,
        ] {
            assert!(report.reasons.contains(&reason), "missing {reason:?}");
        }
    }

    #[test]
    fn dark_band_across_the_strip_is_a_shadow() {
        let luma = GrayImage::from_fn(100, 300, |x, y| {
            let base = if y >= 150 && y < 200 { 60 } else { 180 };
            Luma([base + ((x + y) % 2) as u8 * 20])
        });
        let report = evaluator().evaluate(&luma, &BoundingBox::from_size(100.0, 300.0), true);
        assert!(report.quality.shadow);
        assert!(report.reasons.contains(&FailureReason::Shadow));
    }

    #[test]
    fn quarter_turn_sensor_shifts_the_reported_angle() {
        let luma = checker(300, 600);
        let strip = BoundingBox::new(100.0, 200.0, 200.0, 400.0);
        let rotated = FramingEvaluator::new(FramingConfig::default(), Rotation::Cw90);
        let report = rotated.evaluate(&luma, &strip, true);
        let pose = report.pose.unwrap();
        assert_abs_diff_eq!(pose.angle_deg.abs(), 90.0, epsilon = 1.0);
        assert!(report.reasons.contains(&FailureReason::BadOrientation));
    }

    #[test]
    fn missing_strip_reports_strip_not_found() {
        let report = evaluator().evaluate_without_strip(&checker(64, 64), true);
        assert_eq!(report.reasons, vec![FailureReason::StripNotFound]);
        assert!(report.pose.is_none());
    }

    #[test]
    fn reason_codes_match_their_serialized_form() {
        let json = serde_json::to_string(&FailureReason::BadOrientation).unwrap();
        assert_eq!(json, format!("\"{}\"", FailureReason::BadOrientation.code()));
    }
}
