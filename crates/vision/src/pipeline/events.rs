//! Result emitter: the event contract towards the UI layer and the thread
//! that delivers events without ever blocking the pipeline.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender};
use rdt_ingest::CameraInfo;
use rdt_ml_core::BoundingBox;
use serde::Serialize;
use tracing::{debug, warn};

use crate::pipeline::{
    framing::{Exposure, FailureReason, FramingReport, SizeClass},
    interpreter::InterpretationResult,
    telemetry,
};

/// Per-frame framing feedback for the UI.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameEvaluation {
    pub timestamp_ms: i64,
    pub passed_all: bool,
    pub steady: bool,
    pub centered: bool,
    /// `None` when no strip was found.
    pub size: Option<SizeClass>,
    pub shadow: bool,
    pub sharp: bool,
    pub orientation_ok: bool,
    pub angle_deg: f64,
    pub exposure: Exposure,
    pub reasons: Vec<FailureReason>,
    pub strip: Option<BoundingBox>,
    /// Whether this frame triggered a still capture.
    pub capture_triggered: bool,
    /// JPEG of the strip region, or of the whole frame when no strip was found.
    #[serde(skip)]
    pub preview_jpeg: Option<Vec<u8>>,
}

impl FrameEvaluation {
    pub fn from_report(
        timestamp_ms: i64,
        report: &FramingReport,
        capture_triggered: bool,
        preview_jpeg: Option<Vec<u8>>,
    ) -> Self {
        let pose = report.pose.as_ref();
        Self {
            timestamp_ms,
            passed_all: report.passed_all,
            steady: report.quality.steady,
            centered: pose.is_some_and(|p| p.centered),
            size: pose.map(|p| p.size),
            shadow: report.quality.shadow,
            sharp: report.quality.sharp,
            orientation_ok: pose.is_some_and(|p| p.orientation_ok),
            angle_deg: pose.map_or(0.0, |p| p.angle_deg),
            exposure: report.quality.exposure,
            reasons: report.reasons.clone(),
            strip: pose.map(|p| p.strip),
            capture_triggered,
            preview_jpeg,
        }
    }
}

/// Blocking error that ends the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TerminalFailure {
    pub message: String,
    pub camera_errors: u32,
}

#[derive(Debug)]
pub enum PipelineEvent {
    CameraReady(CameraInfo),
    FrameEvaluated(FrameEvaluation),
    Interpreting,
    Interpreted(Box<InterpretationResult>),
    Failed(TerminalFailure),
}

/// Consumer of pipeline output. Called only from the dispatcher thread.
pub trait ResultSink: Send + 'static {
    fn on_camera_ready(&mut self, info: CameraInfo);

    fn on_frame_evaluated(&mut self, evaluation: FrameEvaluation);

    fn on_interpreting(&mut self);

    fn on_interpreted(&mut self, result: InterpretationResult);

    fn on_failure(&mut self, failure: TerminalFailure);
}

impl ResultSink for Sender<PipelineEvent> {
    fn on_camera_ready(&mut self, info: CameraInfo) {
        forward(self, PipelineEvent::CameraReady(info));
    }

    fn on_frame_evaluated(&mut self, evaluation: FrameEvaluation) {
        forward(self, PipelineEvent::FrameEvaluated(evaluation));
    }

    fn on_interpreting(&mut self) {
        forward(self, PipelineEvent::Interpreting);
    }

    fn on_interpreted(&mut self, result: InterpretationResult) {
        forward(self, PipelineEvent::Interpreted(Box::new(result)));
    }

    fn on_failure(&mut self, failure: TerminalFailure) {
        forward(self, PipelineEvent::Failed(failure));
    }
}

fn forward(tx: &Sender<PipelineEvent>, event: PipelineEvent) {
    if tx.send(event).is_err() {
        debug!("event receiver dropped");
    }
}

enum Queued {
    CameraReady(CameraInfo),
    Evaluation(FrameEvaluation),
    Interpreting,
    Interpreted(Box<InterpretationResult>),
    Failed(TerminalFailure),
}

/// Producer side of the emitter, cloned into every worker.
///
/// Every event goes through one FIFO queue, so the sink sees them in the
/// order they were emitted. Frame evaluations may only occupy
/// `evaluation_budget` slots and are dropped when the sink falls behind;
/// verdicts are never dropped except after teardown began. Once a terminal
/// failure was emitted no further evaluations are queued.
#[derive(Clone)]
pub struct EventEmitter {
    queue: Sender<Queued>,
    pending_evaluations: Arc<AtomicUsize>,
    evaluation_budget: usize,
    closed: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn camera_ready(&self, info: CameraInfo) {
        self.enqueue(Queued::CameraReady(info));
    }

    pub fn frame_evaluated(&self, evaluation: FrameEvaluation) {
        if self.is_closed() || self.failed.load(Ordering::SeqCst) {
            return;
        }
        if self.pending_evaluations.fetch_add(1, Ordering::SeqCst) >= self.evaluation_budget {
            self.pending_evaluations.fetch_sub(1, Ordering::SeqCst);
            metrics::counter!("rdt_events_dropped_total").increment(1);
            debug!("sink is behind, dropping frame evaluation");
            return;
        }
        self.enqueue(Queued::Evaluation(evaluation));
    }

    pub fn interpreting(&self) {
        self.enqueue(Queued::Interpreting);
    }

    /// Queue a verdict; refused once teardown has begun.
    pub fn interpreted(&self, result: InterpretationResult) -> bool {
        if self.is_closed() {
            return false;
        }
        self.enqueue(Queued::Interpreted(Box::new(result)));
        true
    }

    pub fn failed(&self, failure: TerminalFailure) {
        self.failed.store(true, Ordering::SeqCst);
        self.enqueue(Queued::Failed(failure));
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, event: Queued) {
        if self.queue.send(event).is_err() {
            debug!("dispatcher gone, event discarded");
        }
    }
}

/// Dispatcher thread handle; joining it hands the sink back.
pub struct Dispatcher {
    handle: thread::JoinHandle<Box<dyn ResultSink>>,
}

impl Dispatcher {
    /// Wait until every emitter clone is gone and the queue is drained.
    pub fn join(self) -> Option<Box<dyn ResultSink>> {
        match self.handle.join() {
            Ok(sink) => Some(sink),
            Err(_) => {
                warn!("result dispatcher panicked; sink lost");
                None
            }
        }
    }
}

/// Start the dispatcher thread feeding `sink`.
pub fn spawn_dispatcher(
    sink: Box<dyn ResultSink>,
    evaluation_queue: usize,
) -> std::io::Result<(EventEmitter, Dispatcher)> {
    let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
    let pending_evaluations = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    let emitter = EventEmitter {
        queue: queue_tx,
        pending_evaluations: pending_evaluations.clone(),
        evaluation_budget: evaluation_queue.max(1),
        closed: closed.clone(),
        failed: Arc::new(AtomicBool::new(false)),
    };
    let handle = telemetry::spawn_thread("rdt-dispatch", move || {
        dispatch_loop(sink, queue_rx, pending_evaluations, closed)
    })?;
    Ok((emitter, Dispatcher { handle }))
}

fn dispatch_loop(
    mut sink: Box<dyn ResultSink>,
    queue: Receiver<Queued>,
    pending_evaluations: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
) -> Box<dyn ResultSink> {
    let mut failed = false;
    for event in queue.iter() {
        match event {
            Queued::CameraReady(info) => sink.on_camera_ready(info),
            Queued::Evaluation(evaluation) => {
                pending_evaluations.fetch_sub(1, Ordering::SeqCst);
                // An evaluation racing the failure flag is still dropped here.
                if !failed {
                    sink.on_frame_evaluated(evaluation);
                }
            }
            Queued::Interpreting => sink.on_interpreting(),
            Queued::Interpreted(result) => {
                if closed.load(Ordering::SeqCst) {
                    debug!("session closed, withholding interpretation result");
                } else {
                    sink.on_interpreted(*result);
                }
            }
            Queued::Failed(failure) => {
                failed = true;
                sink.on_failure(failure);
            }
        }
    }
    debug!("result dispatcher drained");
    sink
}
