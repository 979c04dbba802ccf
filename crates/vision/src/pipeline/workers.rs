//! Background workers: the preview evaluator and the still capture/interpret loop.
//!
//! The preview worker scores one frame at a time and decides whether to
//! promote it to a still capture. The still worker owns the camera round trip
//! and phase-2 interpretation, so a slow interpretation never stalls preview
//! feedback. The two only share state through the [`CaptureController`].

use std::{
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, select};
use image::RgbImage;
use rdt_ingest::{CaptureError, Frame, FrameSource};
use rdt_ml_core::BoxSpace;
use tracing::{debug, error, info, trace, warn};

use crate::pipeline::{
    config::{CaptureConfig, EmitterConfig},
    events::{EventEmitter, FrameEvaluation, TerminalFailure},
    framing::{FramingEvaluator, FramingReport},
    imaging,
    ingest::PreviewTask,
    interpreter::{Interpretation, ResultInterpreter},
    localizer::{StripLocalizer, best_strip},
    state::{CaptureController, CaptureDecision, EpisodeOutcome, ErrorOrigin},
    steadiness::SteadinessGate,
    telemetry,
};

/// Ask the still worker to run one capture episode.
#[derive(Debug)]
pub(crate) struct StillRequest {
    pub(crate) trigger_timestamp_ms: i64,
    pub(crate) requested_at: Instant,
}

/// Everything the preview worker owns.
pub(crate) struct PreviewWorker {
    pub(crate) controller: Arc<CaptureController>,
    pub(crate) emitter: EventEmitter,
    pub(crate) still_requests: Sender<StillRequest>,
    pub(crate) localizer: StripLocalizer,
    pub(crate) framing: FramingEvaluator,
    pub(crate) steadiness: SteadinessGate,
    pub(crate) emitter_config: EmitterConfig,
}

/// Spawn the preview worker; it exits once the ingestor's sender is dropped.
pub(crate) fn spawn_preview_worker(
    mut worker: PreviewWorker,
    work_rx: Receiver<PreviewTask>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("rdt-preview", move || {
        while let Ok(task) = work_rx.recv() {
            let started = Instant::now();
            let span = tracing::info_span!(
                "preview.frame",
                timestamp = task.frame.timestamp_ms,
                width = task.frame.width,
                height = task.frame.height
            );
            span.in_scope(|| worker.process(&task));
            drop(task);
            metrics::histogram!("rdt_stage_latency_seconds", "stage" => "preview")
                .record(started.elapsed().as_secs_f64());
        }
        debug!("preview worker exiting");
    })
}

impl PreviewWorker {
    fn process(&mut self, task: &PreviewTask) {
        let frame = &task.frame;
        self.steadiness.sync_epoch(task.epoch);

        let luma = match frame.to_luma() {
            Ok(luma) => luma,
            Err(err) => {
                warn!("dropping unreadable preview frame: {err}");
                return;
            }
        };
        let steady = self.steadiness.is_steady(&luma);

        let mut rgb: Option<RgbImage> = None;
        let report = if steady {
            let image = match frame.to_rgb() {
                Ok(image) => rgb.insert(image),
                Err(err) => {
                    warn!("dropping unreadable preview frame: {err}");
                    return;
                }
            };
            let min_confidence = self.localizer.config().min_confidence;
            let detections =
                match self
                    .localizer
                    .detect(image, frame.timestamp_ms, min_confidence, BoxSpace::Frame)
                {
                    Ok(detections) => detections,
                    Err(err) => {
                        metrics::counter!("rdt_frames_dropped_total", "reason" => "classifier")
                            .increment(1);
                        warn!("strip localization failed, frame dropped: {err}");
                        return;
                    }
                };
            let label = &self.localizer.config().test_area_label;
            match best_strip(&detections, label) {
                Some(strip) => self.framing.evaluate(&luma, &strip.bbox, true),
                None => self.framing.evaluate_without_strip(&luma, true),
            }
        } else {
            FramingReport::not_steady()
        };

        let decision = self.controller.decide(steady, &report);
        let triggered = decision.is_trigger();
        if let CaptureDecision::Hold(reason) = &decision {
            trace!(%reason, "capture held");
        }

        // The triggering frame's evaluation must reach the sink before any
        // verdict the still episode produces.
        let preview_jpeg = if self.emitter_config.encode_preview {
            self.encode_preview(frame, rgb, &report)
        } else {
            None
        };
        metrics::counter!("rdt_frames_evaluated_total").increment(1);
        self.emitter.frame_evaluated(FrameEvaluation::from_report(
            frame.timestamp_ms,
            &report,
            triggered,
            preview_jpeg,
        ));

        if triggered {
            metrics::counter!("rdt_captures_triggered_total").increment(1);
            info!(timestamp = frame.timestamp_ms, "good frame, requesting still capture");
            let request = StillRequest {
                trigger_timestamp_ms: frame.timestamp_ms,
                requested_at: Instant::now(),
            };
            if self.still_requests.send(request).is_err() {
                error!("still worker is gone; releasing capture slot");
                self.controller.finish(EpisodeOutcome::Retry);
            }
        }
    }

    fn encode_preview(
        &self,
        frame: &Frame,
        rgb: Option<RgbImage>,
        report: &FramingReport,
    ) -> Option<Vec<u8>> {
        let rgb = match rgb {
            Some(rgb) => rgb,
            None => frame.to_rgb().ok()?,
        };
        let region = report
            .pose
            .as_ref()
            .and_then(|pose| imaging::crop_rgb(&rgb, &pose.strip))
            .unwrap_or(rgb);
        match imaging::encode_jpeg(&region, self.emitter_config.preview_jpeg_quality) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                debug!("preview encoding failed: {err}");
                None
            }
        }
    }
}

/// Everything the still worker owns.
pub(crate) struct StillWorker {
    pub(crate) controller: Arc<CaptureController>,
    pub(crate) emitter: EventEmitter,
    pub(crate) source: Arc<dyn FrameSource>,
    pub(crate) interpreter: ResultInterpreter,
    pub(crate) capture: CaptureConfig,
}

enum StillWait {
    Delivered(Frame),
    TimedOut,
    Shutdown,
}

/// Spawn the still worker; it exits when `shutdown_rx` disconnects or the
/// request channel closes.
pub(crate) fn spawn_still_worker(
    mut worker: StillWorker,
    requests: Receiver<StillRequest>,
    stills: Receiver<Frame>,
    shutdown_rx: Receiver<()>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("rdt-still", move || {
        loop {
            let request = select! {
                recv(requests) -> msg => msg.ok(),
                recv(shutdown_rx) -> _ => None,
            };
            let Some(request) = request else {
                break;
            };
            if !worker.run_episode(request, &stills, &shutdown_rx) {
                break;
            }
        }
        debug!("still worker exiting");
    })
}

impl StillWorker {
    /// One capture episode. Returns `false` when shutdown was observed.
    fn run_episode(
        &mut self,
        request: StillRequest,
        stills: &Receiver<Frame>,
        shutdown_rx: &Receiver<()>,
    ) -> bool {
        let span = tracing::info_span!("still.capture", trigger = request.trigger_timestamp_ms);
        let _guard = span.enter();

        // A still that arrived after an earlier timeout belongs to no episode.
        for stale in stills.try_iter() {
            debug!(timestamp = stale.timestamp_ms, "discarding stale still");
        }

        if let Err(err) = self.source.request_still() {
            handle_camera_error(
                &self.controller,
                &self.emitter,
                err,
                ErrorOrigin::Episode,
                self.capture.max_camera_errors,
            );
            return true;
        }

        let timeout = Duration::from_millis(self.capture.still_timeout_ms);
        let wait = select! {
            recv(stills) -> msg => match msg {
                Ok(frame) => StillWait::Delivered(frame),
                Err(_) => StillWait::Shutdown,
            },
            recv(shutdown_rx) -> _ => StillWait::Shutdown,
            default(timeout) => StillWait::TimedOut,
        };

        match wait {
            StillWait::Shutdown => false,
            StillWait::TimedOut => {
                let err = CaptureError::StillTimeout {
                    waited_ms: self.capture.still_timeout_ms,
                };
                handle_camera_error(
                    &self.controller,
                    &self.emitter,
                    err,
                    ErrorOrigin::Episode,
                    self.capture.max_camera_errors,
                );
                true
            }
            StillWait::Delivered(still) => {
                metrics::histogram!("rdt_stage_latency_seconds", "stage" => "still_capture")
                    .record(request.requested_at.elapsed().as_secs_f64());
                self.interpret(still);
                true
            }
        }
    }

    fn interpret(&mut self, still: Frame) {
        if !self.controller.begin_interpreting() {
            debug!(timestamp = still.timestamp_ms, "no capture pending, still ignored");
            return;
        }
        self.emitter.interpreting();

        let started = Instant::now();
        let span = tracing::info_span!("still.interpret", timestamp = still.timestamp_ms);
        let verdict = span.in_scope(|| self.interpreter.interpret(&still));
        drop(still);
        metrics::histogram!("rdt_stage_latency_seconds", "stage" => "interpret")
            .record(started.elapsed().as_secs_f64());

        match verdict {
            Ok(Interpretation::Read(result)) => {
                metrics::counter!("rdt_interpretations_total", "outcome" => "read").increment(1);
                self.controller.finish(EpisodeOutcome::Success);
                info!(
                    control = result.control,
                    line_a = result.line_a,
                    line_b = result.line_b,
                    "strip interpreted"
                );
                if !self.emitter.interpreted(*result) {
                    debug!("session closing, result withheld");
                }
            }
            Ok(other) => {
                let outcome = other.outcome_label();
                metrics::counter!("rdt_interpretations_total", "outcome" => outcome).increment(1);
                info!(outcome, "no valid read, resuming scan");
                self.controller.finish(EpisodeOutcome::Retry);
            }
            Err(err) => {
                metrics::counter!("rdt_interpretations_total", "outcome" => "error").increment(1);
                warn!("interpretation failed, resuming scan: {err}");
                self.controller.finish(EpisodeOutcome::Retry);
            }
        }
    }
}

/// Apply the fatal-vs-retry policy to a camera error.
pub(crate) fn handle_camera_error(
    controller: &CaptureController,
    emitter: &EventEmitter,
    err: CaptureError,
    origin: ErrorOrigin,
    max_camera_errors: u32,
) {
    let fatal = err.is_fatal();
    let kind = if fatal { "fatal" } else { "recoverable" };
    metrics::counter!("rdt_camera_errors_total", "kind" => kind).increment(1);
    let newly_terminal = if fatal {
        controller.fail()
    } else {
        let was_terminal = controller.is_terminal();
        controller.record_camera_error(origin, max_camera_errors) && !was_terminal
    };

    if newly_terminal {
        error!("camera failure ends the session: {err}");
        emitter.failed(TerminalFailure {
            message: err.to_string(),
            camera_errors: controller.snapshot().consecutive_camera_errors,
        });
    } else {
        warn!("camera error, scanning continues: {err}");
    }
}
