//! Configuration for the scanning pipeline.
//!
//! Every threshold the pipeline applies lives here so call sites never carry
//! their own constants. The structs deserialize from partial JSON, with any
//! missing field falling back to its default.

use std::path::PathBuf;

use rdt_ml_core::Rotation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Canonical configuration shared by every stage in the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub localization: LocalizationConfig,
    pub interpretation: InterpretationConfig,
    pub steadiness: SteadinessConfig,
    pub framing: FramingConfig,
    pub capture: CaptureConfig,
    pub emitter: EmitterConfig,
}

/// Phase-1 strip localization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Square classifier input edge in pixels.
    pub input_size: u32,
    /// Detections scoring below this are discarded.
    pub min_confidence: f32,
    /// Sensor-to-display rotation applied before scaling into model space.
    pub rotation: Rotation,
    /// Label a phase-1 detection carries when it outlines the test area itself.
    pub test_area_label: String,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            input_size: 300,
            min_confidence: 0.5,
            rotation: Rotation::None,
            test_area_label: "test_area".to_string(),
        }
    }
}

/// Phase-2 line interpretation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpretationConfig {
    pub input_size: u32,
    pub min_confidence: f32,
    pub control_label: String,
    pub line_a_label: String,
    pub line_b_label: String,
    /// Test-area window `[x0, y0, x1, y1]` as fractions of the upright strip
    /// crop, used when phase 1 reports no explicit test-area box.
    pub test_area_window: [f32; 4],
    /// Rotate the strip crop upright before extracting the test area.
    pub rotation_correction: bool,
}

impl Default for InterpretationConfig {
    fn default() -> Self {
        Self {
            input_size: 300,
            min_confidence: 0.2,
            control_label: "control".to_string(),
            line_a_label: "lineA".to_string(),
            line_b_label: "lineB".to_string(),
            test_area_window: [0.0, 0.3, 1.0, 0.7],
            rotation_correction: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteadinessConfig {
    /// Consecutive below-threshold frame deltas required before a frame is steady.
    pub window: usize,
    /// Mean absolute luma difference (0-255) under which two frames count as still.
    pub motion_threshold: f32,
    /// Edge of the down-sampled signature compared between frames.
    pub signature_size: u32,
}

impl Default for SteadinessConfig {
    fn default() -> Self {
        Self {
            window: 2,
            motion_threshold: 6.0,
            signature_size: 32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Allowed offset of the strip centre, as a fraction of frame width/height.
    pub center_tolerance: f32,
    /// Strip/frame area ratio above which the strip is too close.
    pub too_close_ratio: f32,
    /// Strip/frame area ratio below which the strip is too far.
    pub too_far_ratio: f32,
    /// Maximum absolute tilt from vertical, in degrees.
    pub angle_tolerance_deg: f64,
    /// Luma at or below this counts as clipped dark.
    pub dark_level: u8,
    /// Luma at or above this counts as clipped bright.
    pub bright_level: u8,
    pub max_dark_fraction: f32,
    pub max_bright_fraction: f32,
    /// Number of bands along the strip's long axis compared for shadows.
    pub shadow_bands: u32,
    /// A band darker than this fraction of the brightest band signals a shadow.
    pub shadow_ratio: f32,
    /// Minimum Laplacian variance of the strip region.
    pub sharpness_threshold: f32,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            center_tolerance: 0.1,
            too_close_ratio: 0.35,
            too_far_ratio: 0.05,
            angle_tolerance_deg: 10.0,
            dark_level: 16,
            bright_level: 245,
            max_dark_fraction: 0.25,
            max_bright_fraction: 0.15,
            shadow_bands: 6,
            shadow_ratio: 0.6,
            sharpness_threshold: 100.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// How long to wait for a requested still before counting a camera error.
    pub still_timeout_ms: u64,
    /// Consecutive recoverable camera errors tolerated before the session fails.
    pub max_camera_errors: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            still_timeout_ms: 2_500,
            max_camera_errors: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Frame evaluations buffered for the sink before new ones are dropped.
    pub evaluation_queue: usize,
    /// Attach a JPEG of the strip region to each frame evaluation.
    pub encode_preview: bool,
    pub preview_jpeg_quality: u8,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            evaluation_queue: 8,
            encode_preview: true,
            preview_jpeg_quality: 80,
        }
    }
}

/// Optional telemetry knobs for tracing and metrics output.
#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Render the Prometheus metrics snapshot here when the run ends.
    pub metrics_path: Option<PathBuf>,
}

fn check(ok: bool, message: impl FnOnce() -> String) -> Result<(), ConfigError> {
    if ok { Ok(()) } else { Err(ConfigError(message())) }
}

fn is_fraction(value: f32) -> bool {
    (0.0..=1.0).contains(&value)
}

impl PipelineConfig {
    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let loc = &self.localization;
        check(loc.input_size > 0, || "localization.input_size must be positive".into())?;
        check(is_fraction(loc.min_confidence), || {
            format!("localization.min_confidence {} outside [0, 1]", loc.min_confidence)
        })?;

        let interp = &self.interpretation;
        check(interp.input_size > 0, || "interpretation.input_size must be positive".into())?;
        check(is_fraction(interp.min_confidence), || {
            format!("interpretation.min_confidence {} outside [0, 1]", interp.min_confidence)
        })?;
        let [x0, y0, x1, y1] = interp.test_area_window;
        check(
            interp.test_area_window.iter().all(|v| is_fraction(*v)) && x0 < x1 && y0 < y1,
            || format!("interpretation.test_area_window {:?} is not a sub-window", interp.test_area_window),
        )?;
        check(!interp.control_label.is_empty(), || "interpretation.control_label is empty".into())?;

        let steady = &self.steadiness;
        check(steady.window >= 1, || "steadiness.window must be at least 1".into())?;
        check(steady.motion_threshold > 0.0, || "steadiness.motion_threshold must be positive".into())?;
        check(steady.signature_size >= 2, || "steadiness.signature_size must be at least 2".into())?;

        let framing = &self.framing;
        check(is_fraction(framing.center_tolerance), || {
            format!("framing.center_tolerance {} outside [0, 1]", framing.center_tolerance)
        })?;
        check(
            is_fraction(framing.too_far_ratio)
                && is_fraction(framing.too_close_ratio)
                && framing.too_far_ratio < framing.too_close_ratio,
            || {
                format!(
                    "framing size ratios must satisfy 0 <= too_far ({}) < too_close ({}) <= 1",
                    framing.too_far_ratio, framing.too_close_ratio
                )
            },
        )?;
        check(framing.angle_tolerance_deg >= 0.0, || "framing.angle_tolerance_deg is negative".into())?;
        check(framing.dark_level < framing.bright_level, || {
            "framing.dark_level must be below framing.bright_level".into()
        })?;
        check(
            is_fraction(framing.max_dark_fraction) && is_fraction(framing.max_bright_fraction),
            || "framing clip fractions must lie in [0, 1]".into(),
        )?;
        check(framing.shadow_bands >= 2, || "framing.shadow_bands must be at least 2".into())?;
        check(is_fraction(framing.shadow_ratio), || "framing.shadow_ratio outside [0, 1]".into())?;

        check(self.capture.still_timeout_ms > 0, || "capture.still_timeout_ms must be positive".into())?;
        check(self.capture.max_camera_errors >= 1, || {
            "capture.max_camera_errors must be at least 1".into()
        })?;

        check(self.emitter.evaluation_queue >= 1, || "emitter.evaluation_queue must be at least 1".into())?;
        check((1..=100).contains(&self.emitter.preview_jpeg_quality), || {
            "emitter.preview_jpeg_quality must be between 1 and 100".into()
        })?;
        Ok(())
    }
}
