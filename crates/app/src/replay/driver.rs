//! Replay loop: feeds recorded frames into a [`Session`] the way a live
//! camera would and prints every pipeline event.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::{never, select};
use rdt_ingest::{CameraInfo, CaptureError, FocusState, Frame, ReplayEntry, spawn_directory_reader};
use rdt_vision::{
    Phase, PipelineBackends, PipelineEvent, Session, SubmitOutcome, pipeline::telemetry,
};
use tracing::{debug, info, warn};

use crate::replay::{ReplayConfig, manifest::Manifest, output::EventWriter};

/// No input for this long while the frames are exhausted ends the run.
const IDLE_TICK: Duration = Duration::from_millis(200);

enum Input {
    Preview(Option<Result<Frame, CaptureError>>),
    Still(Option<Result<Frame, CaptureError>>),
    Event(Option<PipelineEvent>),
    Idle,
}

#[derive(Debug, Default)]
struct ReplaySummary {
    submitted: u64,
    accepted: u64,
    dropped: BTreeMap<&'static str, u64>,
    reads: u64,
}

impl ReplaySummary {
    fn record(&mut self, outcome: SubmitOutcome) {
        self.submitted += 1;
        match outcome {
            SubmitOutcome::Accepted => self.accepted += 1,
            SubmitOutcome::Dropped(reason) => *self.dropped.entry(reason.label()).or_default() += 1,
        }
    }
}

fn interrupt_flag() -> Arc<AtomicBool> {
    static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    INTERRUPTED
        .get_or_init(|| {
            let flag = Arc::new(AtomicBool::new(false));
            let handler_flag = flag.clone();
            if let Err(err) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
                warn!("Failed to install Ctrl+C handler: {err}");
            }
            flag
        })
        .clone()
}

fn camera_from_first_frame(entries: &[ReplayEntry]) -> Result<CameraInfo> {
    let first = entries.first().context("replay has no frames")?;
    let (view_width, view_height) = image::image_dimensions(&first.path)
        .with_context(|| format!("reading dimensions of {}", first.path.display()))?;
    Ok(CameraInfo {
        supports_torch: false,
        view_width,
        view_height,
    })
}

/// Run one replay to completion, a terminal failure, or Ctrl+C.
pub fn run(config: ReplayConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    telemetry::init_metrics_recorder();
    let interrupted = interrupt_flag();

    let replay_span = tracing::info_span!(
        "replay",
        frames = %config.frames_dir.display(),
        interval_ms = config.interval.as_millis() as u64,
        rescan = config.rescan
    );
    let _replay_span_guard = replay_span.enter();

    let plan = Manifest::load(&config.manifest_path)?
        .resolve(&config.frames_dir, config.interval)?;
    let camera = match plan.camera {
        Some(camera) => camera,
        None => camera_from_first_frame(&plan.entries)?,
    };
    let focus_by_timestamp = plan.focus;
    info!(frames = plan.entries.len(), "replaying recorded session");

    let replay = spawn_directory_reader(plan.entries, config.preview_max_dim, config.interval)
        .context("starting directory replay")?;
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let backends = PipelineBackends {
        localizer: Arc::new(plan.localizer),
        interpreter: Arc::new(plan.interpreter),
    };
    let mut session = Session::new(config.pipeline.clone(), backends, replay.source.clone(), event_tx)?;
    session.start(camera)?;

    let mut writer = EventWriter::new(io::stdout().lock(), config.save_crops.clone());
    let mut summary = ReplaySummary::default();
    let mut previews = replay.frames;
    let mut stills = replay.stills;
    let mut frames_done = false;

    loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, stopping replay");
            break;
        }

        let input = select! {
            recv(event_rx) -> msg => Input::Event(msg.ok()),
            recv(stills) -> msg => Input::Still(msg.ok()),
            recv(previews) -> msg => Input::Preview(msg.ok()),
            default(IDLE_TICK) => Input::Idle,
        };

        match input {
            Input::Preview(Some(Ok(frame))) => {
                let focus = focus_by_timestamp
                    .get(&frame.timestamp_ms)
                    .copied()
                    .unwrap_or(FocusState::Focused);
                session.set_focus_state(focus);
                summary.record(session.submit_frame(frame));
            }
            Input::Preview(Some(Err(err))) => session.report_camera_error(err),
            Input::Preview(None) => {
                debug!("all recorded frames shown");
                frames_done = true;
                previews = never();
            }
            Input::Still(Some(Ok(still))) => {
                if !session.deliver_still(still) {
                    debug!("still arrived with no capture pending");
                }
            }
            Input::Still(Some(Err(err))) => session.report_camera_error(err),
            Input::Still(None) => stills = never(),
            Input::Event(Some(event)) => {
                writer.write(&event)?;
                match event {
                    PipelineEvent::Interpreted(_) => {
                        summary.reads += 1;
                        if !config.rescan {
                            break;
                        }
                        session.rescan();
                    }
                    PipelineEvent::Failed(_) => break,
                    _ => {}
                }
            }
            Input::Event(None) => break,
            Input::Idle => {
                let pending = matches!(session.phase(), Phase::CapturingStill | Phase::Interpreting);
                if frames_done && !pending {
                    break;
                }
            }
        }
    }

    session.stop();
    for event in event_rx.try_iter() {
        writer.write(&event)?;
    }
    writer.flush()?;

    if let Some(path) = &config.telemetry.metrics_path {
        telemetry::write_metrics_snapshot(path)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }

    info!(
        submitted = summary.submitted,
        accepted = summary.accepted,
        reads = summary.reads,
        dropped = ?summary.dropped,
        "replay finished"
    );
    Ok(())
}
