//! JSON-lines rendering of pipeline events.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rdt_ingest::CameraInfo;
use rdt_ml_core::{BoundingBox, Detection};
use rdt_vision::{FrameEvaluation, InterpretationResult, PipelineEvent, TerminalFailure};
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventLine<'a> {
    CameraReady {
        camera: &'a CameraInfo,
    },
    FrameEvaluated {
        evaluation: &'a FrameEvaluation,
        preview_bytes: Option<usize>,
    },
    Interpreting,
    Interpreted {
        timestamp_ms: i64,
        control: bool,
        line_a: bool,
        line_b: bool,
        control_confidence: Option<f32>,
        line_a_confidence: Option<f32>,
        line_b_confidence: Option<f32>,
        strip: &'a BoundingBox,
        detections: &'a [Detection],
        test_area_png: Option<PathBuf>,
    },
    Failed {
        message: &'a str,
        camera_errors: u32,
    },
}

/// Writes one JSON object per event, stamped with the wall-clock time.
pub struct EventWriter<W: Write> {
    out: W,
    save_crops: Option<PathBuf>,
}

impl<W: Write> EventWriter<W> {
    pub fn new(out: W, save_crops: Option<PathBuf>) -> Self {
        Self { out, save_crops }
    }

    pub fn write(&mut self, event: &PipelineEvent) -> Result<()> {
        let line = match event {
            PipelineEvent::CameraReady(camera) => EventLine::CameraReady { camera },
            PipelineEvent::FrameEvaluated(evaluation) => EventLine::FrameEvaluated {
                evaluation,
                preview_bytes: evaluation.preview_jpeg.as_ref().map(Vec::len),
            },
            PipelineEvent::Interpreting => EventLine::Interpreting,
            PipelineEvent::Interpreted(result) => {
                let test_area_png = match &self.save_crops {
                    Some(dir) => Some(save_test_area(dir, result)?),
                    None => None,
                };
                EventLine::Interpreted {
                    timestamp_ms: result.timestamp_ms,
                    control: result.control,
                    line_a: result.line_a,
                    line_b: result.line_b,
                    control_confidence: result.control_confidence,
                    line_a_confidence: result.line_a_confidence,
                    line_b_confidence: result.line_b_confidence,
                    strip: &result.strip,
                    detections: &result.detections,
                    test_area_png,
                }
            }
            PipelineEvent::Failed(TerminalFailure {
                message,
                camera_errors,
            }) => EventLine::Failed {
                message,
                camera_errors: *camera_errors,
            },
        };

        let mut value = serde_json::to_value(&line).context("serialising event")?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "at".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        serde_json::to_writer(&mut self.out, &value).context("writing event")?;
        writeln!(self.out).context("writing event")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("flushing event output")
    }
}

fn save_test_area(dir: &Path, result: &InterpretationResult) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("test_area_{}.png", result.timestamp_ms));
    result
        .test_area
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
