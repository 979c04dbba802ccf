//! Replay manifest: which frames to show, the focus state the camera reported
//! for each, and the detections both classifier phases recorded for them.
//!
//! ```json
//! {
//!   "camera": { "supports_torch": true, "view_width": 720, "view_height": 1280 },
//!   "frames": [
//!     { "file": "0001.png", "focus": "focusing" },
//!     { "file": "0002.png",
//!       "strip": [{ "label": "rdt", "score": 0.82, "bbox": [100, 40, 200, 260] }],
//!       "lines": [{ "label": "control", "score": 0.91, "bbox": [20, 80, 280, 100] }] }
//!   ]
//! }
//! ```
//!
//! Boxes are in classifier model space. Timestamps default to the frame's
//! position times the replay interval. Without a `frames` list every image in
//! the frames directory is replayed in name order, focused and without
//! detections.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use rdt_ingest::{CameraInfo, FocusState, ReplayEntry, list_frames};
use rdt_ml_core::{BoundingBox, Detection, ReplayClassifier};
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub camera: Option<CameraInfo>,
    #[serde(default)]
    pub frames: Vec<ManifestFrame>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestFrame {
    /// Image path relative to the frames directory.
    pub file: PathBuf,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default = "focused")]
    pub focus: FocusState,
    /// Phase-1 detections on this frame (and on a still captured from it).
    #[serde(default)]
    pub strip: Vec<RecordedDetection>,
    /// Phase-2 detections on the test area cut from a still of this frame.
    #[serde(default)]
    pub lines: Vec<RecordedDetection>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RecordedDetection {
    pub label: String,
    pub score: f32,
    #[serde(default)]
    pub class_id: u32,
    /// `[left, top, right, bottom]` in model pixels.
    pub bbox: [f32; 4],
}

fn focused() -> FocusState {
    FocusState::Focused
}

impl ManifestFrame {
    fn unannotated(file: PathBuf) -> Self {
        Self {
            file,
            timestamp_ms: None,
            focus: FocusState::Focused,
            strip: Vec::new(),
            lines: Vec::new(),
        }
    }
}

impl From<&RecordedDetection> for Detection {
    fn from(recorded: &RecordedDetection) -> Self {
        let [left, top, right, bottom] = recorded.bbox;
        Detection::new(
            recorded.label.clone(),
            recorded.class_id,
            recorded.score,
            BoundingBox::new(left, top, right, bottom),
        )
    }
}

/// Everything a replay run needs, resolved against the frames directory.
pub struct ReplayPlan {
    pub camera: Option<CameraInfo>,
    pub entries: Vec<ReplayEntry>,
    pub focus: HashMap<i64, FocusState>,
    pub localizer: ReplayClassifier,
    pub interpreter: ReplayClassifier,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn resolve(self, frames_dir: &Path, interval: Duration) -> Result<ReplayPlan> {
        let frames = if self.frames.is_empty() {
            list_frames(frames_dir)?
                .into_iter()
                .filter_map(|path| path.file_name().map(PathBuf::from))
                .map(ManifestFrame::unannotated)
                .collect()
        } else {
            self.frames
        };
        if frames.is_empty() {
            bail!("no frames to replay in {}", frames_dir.display());
        }

        let step = i64::try_from(interval.as_millis()).context("replay interval too large")?;
        let mut seen = HashSet::with_capacity(frames.len());
        let mut entries = Vec::with_capacity(frames.len());
        let mut focus = HashMap::with_capacity(frames.len());
        let mut localizer = ReplayClassifier::new("replay-strip");
        let mut interpreter = ReplayClassifier::new("replay-lines");

        for (idx, frame) in frames.into_iter().enumerate() {
            let path = frames_dir.join(&frame.file);
            if !path.is_file() {
                bail!("manifest frame {} not found in {}", frame.file.display(), frames_dir.display());
            }
            let timestamp_ms = frame.timestamp_ms.unwrap_or(idx as i64 * step);
            if !seen.insert(timestamp_ms) {
                bail!("timestamp {timestamp_ms} appears more than once in the manifest");
            }

            focus.insert(timestamp_ms, frame.focus);
            localizer = localizer.with_frame(timestamp_ms, frame.strip.iter().map(Detection::from).collect());
            interpreter = interpreter.with_frame(timestamp_ms, frame.lines.iter().map(Detection::from).collect());
            entries.push(ReplayEntry { path, timestamp_ms });
        }

        Ok(ReplayPlan {
            camera: self.camera,
            entries,
            focus,
            localizer,
            interpreter,
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn write_frames(dir: &Path, names: &[&str]) {
        for name in names {
            RgbImage::from_pixel(8, 8, Rgb([100, 100, 100]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    #[test]
    fn resolves_timestamps_focus_and_detections() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &["a.png", "b.png", "c.png"]);
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "frames": [
                    { "file": "a.png", "focus": "focusing" },
                    { "file": "b.png",
                      "strip": [{ "label": "rdt", "score": 0.8, "bbox": [200, 100, 100, 200] }] },
                    { "file": "c.png", "timestamp_ms": 500,
                      "lines": [{ "label": "control", "score": 0.9, "bbox": [0, 0, 10, 10] }] }
                ]
            }"#,
        )
        .unwrap();

        let plan = manifest
            .resolve(dir.path(), Duration::from_millis(40))
            .unwrap();
        let stamps: Vec<i64> = plan.entries.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, [0, 40, 500]);
        assert_eq!(plan.focus[&0], FocusState::Focusing);
        assert_eq!(plan.focus[&40], FocusState::Focused);
        assert_eq!(plan.localizer.len(), 3);
        assert_eq!(plan.interpreter.len(), 3);
        assert!(plan.camera.is_none());
    }

    #[test]
    fn recorded_boxes_are_normalised() {
        let recorded = RecordedDetection {
            label: "rdt".into(),
            score: 0.8,
            class_id: 0,
            bbox: [200.0, 100.0, 100.0, 200.0],
        };
        let detection = Detection::from(&recorded);
        assert_eq!(detection.bbox, BoundingBox::new(100.0, 100.0, 200.0, 200.0));
        assert_eq!(detection.bbox.left, 100.0);
    }

    #[test]
    fn duplicate_timestamps_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &["a.png", "b.png"]);
        let manifest: Manifest = serde_json::from_str(
            r#"{ "frames": [
                { "file": "a.png", "timestamp_ms": 7 },
                { "file": "b.png", "timestamp_ms": 7 }
            ] }"#,
        )
        .unwrap();
        let err = manifest
            .resolve(dir.path(), Duration::from_millis(40))
            .err()
            .unwrap();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn omitted_frame_list_replays_the_whole_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path(), &["b.png", "a.png"]);
        std::fs::write(dir.path().join("manifest.json"), "{}").unwrap();
        let manifest: Manifest = serde_json::from_str("{}").unwrap();

        let plan = manifest
            .resolve(dir.path(), Duration::from_millis(25))
            .unwrap();
        let files: Vec<_> = plan
            .entries
            .iter()
            .map(|e| (e.path.file_name().unwrap().to_str().unwrap().to_string(), e.timestamp_ms))
            .collect();
        assert_eq!(files, [("a.png".to_string(), 0), ("b.png".to_string(), 25)]);
        assert!(plan.focus.values().all(|f| *f == FocusState::Focused));
        assert_eq!(plan.localizer.len(), 2);
    }

    #[test]
    fn empty_directory_without_a_frame_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: Manifest = serde_json::from_str("{}").unwrap();
        let err = manifest
            .resolve(dir.path(), Duration::from_millis(25))
            .err()
            .unwrap();
        assert!(err.to_string().contains("no frames"));
    }

    #[test]
    fn missing_frame_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest: Manifest =
            serde_json::from_str(r#"{ "frames": [{ "file": "gone.png" }] }"#).unwrap();
        assert!(manifest.resolve(dir.path(), Duration::from_millis(40)).is_err());
    }
}
