use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use rdt_ml_core::Rotation;
use rdt_vision::{PipelineConfig, TelemetryOptions};

#[derive(Args, Clone, Debug)]
pub struct ReplayCliArgs {
    /// Directory holding the recorded frames.
    pub frames: PathBuf,
    /// JSON manifest with per-frame focus and recorded detections.
    #[arg(long)]
    pub manifest: PathBuf,
    /// JSON pipeline configuration; missing fields keep their defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Delay between preview frames, in milliseconds.
    #[arg(long, default_value_t = 33)]
    pub interval_ms: u64,
    /// Preview frames are downscaled so their longer side fits this.
    #[arg(long, default_value_t = 640)]
    pub preview_max_dim: u32,
    /// Sensor-to-display rotation in degrees (0, 90, 180 or 270).
    #[arg(long)]
    pub rotation: Option<i32>,
    /// Minimum strip localization confidence.
    #[arg(long)]
    pub strip_confidence: Option<f32>,
    /// Minimum line classification confidence.
    #[arg(long)]
    pub line_confidence: Option<f32>,
    /// Steady frame-to-frame deltas required before a capture.
    #[arg(long)]
    pub steady_window: Option<usize>,
    /// Milliseconds to wait for a requested still.
    #[arg(long)]
    pub still_timeout_ms: Option<u64>,
    /// Skip JPEG encoding of preview regions.
    #[arg(long)]
    pub no_preview: bool,
    /// Keep scanning after a successful read instead of stopping.
    #[arg(long)]
    pub rescan: bool,
    /// Write each interpreted test area as a PNG into this directory.
    #[arg(long)]
    pub save_crops: Option<PathBuf>,
    /// Write a Chrome trace of the pipeline spans to this file.
    #[arg(long)]
    pub chrome_trace: Option<PathBuf>,
    /// Write the Prometheus metrics snapshot to this file at exit.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// Fully resolved settings for one replay run.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    pub frames_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub pipeline: PipelineConfig,
    pub interval: Duration,
    pub preview_max_dim: u32,
    pub rescan: bool,
    pub save_crops: Option<PathBuf>,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<ReplayCliArgs> for ReplayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ReplayCliArgs) -> Result<Self> {
        if !args.frames.is_dir() {
            bail!("frames directory {} does not exist", args.frames.display());
        }

        let mut pipeline = match &args.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<PipelineConfig>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };

        if let Some(degrees) = args.rotation {
            pipeline.localization.rotation = Rotation::from_degrees(degrees)
                .ok_or_else(|| anyhow!("--rotation must be 0, 90, 180 or 270 (got {degrees})"))?;
        }
        if let Some(value) = args.strip_confidence {
            pipeline.localization.min_confidence = value;
        }
        if let Some(value) = args.line_confidence {
            pipeline.interpretation.min_confidence = value;
        }
        if let Some(value) = args.steady_window {
            pipeline.steadiness.window = value;
        }
        if let Some(value) = args.still_timeout_ms {
            pipeline.capture.still_timeout_ms = value;
        }
        if args.no_preview {
            pipeline.emitter.encode_preview = false;
        }
        pipeline.validate()?;

        if args.interval_ms == 0 {
            bail!("--interval-ms must be at least 1");
        }

        Ok(Self {
            frames_dir: args.frames,
            manifest_path: args.manifest,
            pipeline,
            interval: Duration::from_millis(args.interval_ms),
            preview_max_dim: args.preview_max_dim,
            rescan: args.rescan,
            save_crops: args.save_crops,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_path: args.metrics_out,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(frames: PathBuf) -> ReplayCliArgs {
        ReplayCliArgs {
            frames,
            manifest: PathBuf::from("manifest.json"),
            config: None,
            interval_ms: 33,
            preview_max_dim: 640,
            rotation: None,
            strip_confidence: None,
            line_confidence: None,
            steady_window: None,
            still_timeout_ms: None,
            no_preview: false,
            rescan: false,
            save_crops: None,
            chrome_trace: None,
            metrics_out: None,
        }
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pipeline.json");
        fs::write(
            &config_path,
            r#"{"localization": {"min_confidence": 0.7}, "capture": {"still_timeout_ms": 900}}"#,
        )
        .unwrap();

        let mut cli = args(dir.path().to_path_buf());
        cli.config = Some(config_path);
        cli.still_timeout_ms = Some(1_200);
        cli.rotation = Some(270);
        cli.no_preview = true;

        let config = ReplayConfig::try_from(cli).unwrap();
        assert_eq!(config.pipeline.localization.min_confidence, 0.7);
        assert_eq!(config.pipeline.localization.rotation, Rotation::Cw270);
        assert_eq!(config.pipeline.capture.still_timeout_ms, 1_200);
        assert_eq!(config.pipeline.interpretation.min_confidence, 0.2);
        assert!(!config.pipeline.emitter.encode_preview);
    }

    #[test]
    fn rejects_unsupported_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = args(dir.path().to_path_buf());
        cli.rotation = Some(45);
        let err = ReplayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("--rotation"));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = args(dir.path().to_path_buf());
        cli.line_confidence = Some(1.5);
        assert!(ReplayConfig::try_from(cli).is_err());
    }

    #[test]
    fn rejects_missing_frames_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ReplayConfig::try_from(args(dir.path().join("missing"))).is_err());
    }
}
