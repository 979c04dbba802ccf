//! Session lifecycle: wires ingestion, workers and the emitter together and
//! tears them down in order.

use std::{sync::Arc, thread};

use crossbeam_channel::{Sender, TrySendError};
use rdt_ingest::{CameraInfo, CaptureError, FocusState, Frame, FrameSource};
use rdt_ml_core::Classifier;
use tracing::{debug, info, warn};

use crate::pipeline::{
    config::PipelineConfig,
    error::VisionError,
    events::{Dispatcher, EventEmitter, ResultSink, spawn_dispatcher},
    framing::FramingEvaluator,
    ingest::{FrameIngestor, SubmitOutcome},
    interpreter::ResultInterpreter,
    localizer::StripLocalizer,
    state::{CaptureController, DropReason, ErrorOrigin, Phase, PipelineState},
    steadiness::SteadinessGate,
    workers::{
        PreviewWorker, StillWorker, handle_camera_error, spawn_preview_worker, spawn_still_worker,
    },
};

/// Detection backends for the two pipeline phases.
#[derive(Clone)]
pub struct PipelineBackends {
    /// Phase 1: strip localization.
    pub localizer: Arc<dyn Classifier>,
    /// Phase 2: line interpretation on the test area.
    pub interpreter: Arc<dyn Classifier>,
}

struct Running {
    ingestor: FrameIngestor,
    emitter: EventEmitter,
    still_tx: Sender<Frame>,
    shutdown_tx: Sender<()>,
    workers: Vec<(&'static str, thread::JoinHandle<()>)>,
    dispatcher: Dispatcher,
}

/// One scanning session between camera-ready and teardown.
///
/// The frame source owner pushes preview frames, focus changes and stills in;
/// verdicts come out through the [`ResultSink`] on its own thread.
pub struct Session {
    config: PipelineConfig,
    backends: PipelineBackends,
    source: Arc<dyn FrameSource>,
    controller: Arc<CaptureController>,
    sink: Option<Box<dyn ResultSink>>,
    running: Option<Running>,
}

impl Session {
    pub fn new(
        config: PipelineConfig,
        backends: PipelineBackends,
        source: Arc<dyn FrameSource>,
        sink: impl ResultSink,
    ) -> Result<Self, VisionError> {
        config.validate()?;
        Ok(Self {
            config,
            backends,
            source,
            controller: Arc::new(CaptureController::new()),
            sink: Some(Box::new(sink)),
            running: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Camera is ready: announce it and start scanning.
    pub fn start(&mut self, camera: CameraInfo) -> Result<(), VisionError> {
        if self.running.is_some() {
            return Err(VisionError::AlreadyRunning);
        }
        let Some(sink) = self.sink.take() else {
            return Err(VisionError::SinkUnavailable);
        };

        let (emitter, dispatcher) = spawn_dispatcher(sink, self.config.emitter.evaluation_queue)
            .map_err(|source| VisionError::Spawn {
                name: "dispatcher",
                source,
            })?;
        emitter.camera_ready(camera);
        self.controller.begin_session();

        let (work_tx, work_rx) = crossbeam_channel::bounded(1);
        let (request_tx, request_rx) = crossbeam_channel::bounded(1);
        let (still_tx, still_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let rotation = self.config.localization.rotation;
        let preview = PreviewWorker {
            controller: self.controller.clone(),
            emitter: emitter.clone(),
            still_requests: request_tx,
            localizer: StripLocalizer::new(
                self.backends.localizer.clone(),
                self.config.localization.clone(),
            ),
            framing: FramingEvaluator::new(self.config.framing.clone(), rotation),
            steadiness: SteadinessGate::new(self.config.steadiness.clone()),
            emitter_config: self.config.emitter.clone(),
        };
        let still = StillWorker {
            controller: self.controller.clone(),
            emitter: emitter.clone(),
            source: self.source.clone(),
            interpreter: ResultInterpreter::new(
                StripLocalizer::new(
                    self.backends.localizer.clone(),
                    self.config.localization.clone(),
                ),
                self.backends.interpreter.clone(),
                FramingEvaluator::new(self.config.framing.clone(), rotation),
                self.config.interpretation.clone(),
            ),
            capture: self.config.capture.clone(),
        };

        let mut running = Running {
            ingestor: FrameIngestor::new(self.controller.clone(), work_tx),
            emitter,
            still_tx,
            shutdown_tx,
            workers: Vec::with_capacity(2),
            dispatcher,
        };

        let spawned = spawn_preview_worker(preview, work_rx)
            .map_err(|source| VisionError::Spawn {
                name: "preview",
                source,
            })
            .and_then(|handle| {
                running.workers.push(("preview", handle));
                spawn_still_worker(still, request_rx, still_rx, shutdown_rx).map_err(|source| {
                    VisionError::Spawn {
                        name: "still",
                        source,
                    }
                })
            });
        match spawned {
            Ok(handle) => running.workers.push(("still", handle)),
            Err(err) => {
                self.sink = shutdown(running, &self.controller, self.source.as_ref());
                return Err(err);
            }
        }

        info!(
            torch = camera.supports_torch,
            view_width = camera.view_width,
            view_height = camera.view_height,
            "scanning session started"
        );
        self.running = Some(running);
        Ok(())
    }

    /// Offer a preview frame. Never blocks; a refused frame is released at once.
    pub fn submit_frame(&self, frame: Frame) -> SubmitOutcome {
        match &self.running {
            Some(running) => running.ingestor.submit(frame),
            None => {
                drop(frame);
                SubmitOutcome::Dropped(DropReason::Stopped)
            }
        }
    }

    pub fn set_focus_state(&self, focus: FocusState) {
        debug!(?focus, "focus state changed");
        self.controller.set_focus(focus);
    }

    /// Hand over a still requested from the frame source. Returns `false`
    /// (and releases the frame) when no capture is waiting for one.
    pub fn deliver_still(&self, frame: Frame) -> bool {
        let Some(running) = &self.running else {
            return false;
        };
        if !self.controller.awaiting_still() {
            debug!(timestamp = frame.timestamp_ms, "unexpected still released");
            return false;
        }
        match running.still_tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame) | TrySendError::Disconnected(frame)) => {
                debug!(timestamp = frame.timestamp_ms, "still slot occupied, released");
                false
            }
        }
    }

    /// Camera-level error reported by the frame source owner. Counts toward
    /// the error budget but leaves a capture the still worker is running alone.
    pub fn report_camera_error(&self, err: CaptureError) {
        match &self.running {
            Some(running) => handle_camera_error(
                &self.controller,
                &running.emitter,
                err,
                ErrorOrigin::External,
                self.config.capture.max_camera_errors,
            ),
            None => warn!("camera error outside a running session: {err}"),
        }
    }

    /// Re-arm scanning after a successful read.
    pub fn rescan(&self) -> bool {
        self.running.is_some() && self.controller.rescan()
    }

    pub fn phase(&self) -> Phase {
        self.controller.phase()
    }

    pub fn state(&self) -> PipelineState {
        self.controller.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Tear down: no result is emitted once this begins. Joins every worker,
    /// releases held frames and shuts the frame source down.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            self.sink = shutdown(running, &self.controller, self.source.as_ref());
            info!("scanning session stopped");
        }
    }
}

fn shutdown(
    running: Running,
    controller: &CaptureController,
    source: &dyn FrameSource,
) -> Option<Box<dyn ResultSink>> {
    let Running {
        ingestor,
        emitter,
        still_tx,
        shutdown_tx,
        workers,
        dispatcher,
    } = running;

    emitter.close();
    controller.end_session();
    drop(ingestor);
    drop(shutdown_tx);
    for (name, handle) in workers {
        if handle.join().is_err() {
            warn!("{name} worker panicked during shutdown");
        }
    }
    drop(still_tx);
    source.shutdown();
    drop(emitter);
    dispatcher.join()
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
