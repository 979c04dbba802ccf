use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use image::{Rgb, RgbImage};
use rdt_ingest::{CameraInfo, CaptureError, FocusState, Frame, FrameSource};
use rdt_ml_core::{BoundingBox, Detection, ReplayClassifier};
use rdt_vision::{
    DropReason, FrameEvaluation, InterpretationResult, Phase, PipelineBackends, PipelineConfig,
    PipelineEvent, Session, SubmitOutcome, TerminalFailure,
};

const WAIT: Duration = Duration::from_secs(5);
const STILL_TS: i64 = 10_000;

const CAMERA: CameraInfo = CameraInfo {
    supports_torch: true,
    view_width: 300,
    view_height: 600,
};

/// Frame source that records still requests instead of talking to a camera.
#[derive(Default)]
struct RecordingSource {
    requests: AtomicUsize,
    shutdowns: AtomicUsize,
    notify: Option<Sender<()>>,
    fail_with_lock_timeout: bool,
}

impl FrameSource for RecordingSource {
    fn request_still(&self) -> Result<(), CaptureError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_lock_timeout {
            return Err(CaptureError::LockTimeout { waited_ms: 2_500 });
        }
        if let Some(notify) = &self.notify {
            let _ = notify.send(());
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    session: Session,
    events: Receiver<PipelineEvent>,
    requests: Receiver<()>,
    source: Arc<RecordingSource>,
    released: Arc<AtomicUsize>,
    created: AtomicUsize,
}

fn checker_frame() -> RgbImage {
    RgbImage::from_fn(300, 600, |x, y| {
        let v = if (x + y) % 2 == 0 { 200 } else { 120 };
        Rgb([v, v, v])
    })
}

fn strip(score: f32) -> Detection {
    // Model-space box that maps to a centred 100x200 strip in a 300x600 frame.
    Detection::new("rdt", 0, score, BoundingBox::new(100.0, 100.0, 200.0, 200.0))
}

fn line(label: &str, score: f32) -> Detection {
    Detection::new(label, 0, score, BoundingBox::new(10.0, 100.0, 290.0, 120.0))
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.steadiness.window = 1;
    config.capture.still_timeout_ms = 2_000;
    config
}

fn phase1(preview_frames: i64) -> ReplayClassifier {
    (1..=preview_frames)
        .fold(ReplayClassifier::new("strip"), |c, ts| c.with_frame(ts, vec![strip(0.8)]))
        .with_frame(STILL_TS, vec![strip(0.8)])
}

impl Harness {
    fn new(config: PipelineConfig, phase2: ReplayClassifier, source: RecordingSource) -> Self {
        Self::with_localizer(config, phase1(50), phase2, source)
    }

    fn with_localizer(
        config: PipelineConfig,
        localizer: ReplayClassifier,
        phase2: ReplayClassifier,
        source: RecordingSource,
    ) -> Self {
        let (notify_tx, requests) = crossbeam_channel::unbounded();
        let source = Arc::new(RecordingSource {
            notify: Some(notify_tx),
            ..source
        });
        let (event_tx, events) = crossbeam_channel::unbounded();
        let backends = PipelineBackends {
            localizer: Arc::new(localizer),
            interpreter: Arc::new(phase2),
        };
        let session = Session::new(config, backends, source.clone(), event_tx).unwrap();
        Self {
            session,
            events,
            requests,
            source,
            released: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
        }
    }

    fn started(mut self) -> Self {
        self.session.start(CAMERA).unwrap();
        assert!(matches!(self.next_event(), PipelineEvent::CameraReady(info) if info == CAMERA));
        self.session.set_focus_state(FocusState::Focused);
        self
    }

    fn frame(&self, ts: i64) -> Frame {
        self.created.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        Frame::from_rgb(checker_frame(), ts).with_release_hook(move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Submit, retrying while the previous frame still holds the slot.
    fn submit(&self, ts: i64) -> SubmitOutcome {
        let deadline = Instant::now() + WAIT;
        loop {
            let outcome = self.session.submit_frame(self.frame(ts));
            if outcome != SubmitOutcome::Dropped(DropReason::Busy) || Instant::now() > deadline {
                return outcome;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn next_event(&self) -> PipelineEvent {
        self.events.recv_timeout(WAIT).expect("pipeline event")
    }

    fn evaluation(&self) -> FrameEvaluation {
        loop {
            if let PipelineEvent::FrameEvaluated(evaluation) = self.next_event() {
                return evaluation;
            }
        }
    }

    fn evaluate(&self, ts: i64) -> FrameEvaluation {
        assert_eq!(self.submit(ts), SubmitOutcome::Accepted);
        let evaluation = self.evaluation();
        assert_eq!(evaluation.timestamp_ms, ts);
        evaluation
    }

    fn interpreted(&self) -> InterpretationResult {
        loop {
            match self.next_event() {
                PipelineEvent::Interpreted(result) => return *result,
                PipelineEvent::Failed(failure) => panic!("session failed: {failure:?}"),
                _ => {}
            }
        }
    }

    fn failure(&self) -> TerminalFailure {
        loop {
            if let PipelineEvent::Failed(failure) = self.next_event() {
                return failure;
            }
        }
    }

    fn wait_for_phase(&self, phase: Phase) {
        let deadline = Instant::now() + WAIT;
        while self.session.phase() != phase {
            assert!(Instant::now() < deadline, "phase stuck at {:?}", self.session.phase());
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Drive two identical frames so the second is steady and triggers a capture.
    fn trigger_capture(&self, first_ts: i64) {
        let first = self.evaluate(first_ts);
        let second = self.evaluate(first_ts + 1);
        assert!(first.capture_triggered || second.capture_triggered);
        self.requests.recv_timeout(WAIT).expect("still request");
    }
}

#[test]
fn steady_centered_strip_is_read_end_to_end() {
    let phase2 = ReplayClassifier::new("lines")
        .with_frame(STILL_TS, vec![line("control", 0.9), line("lineA", 0.3)]);
    let harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();

    let first = harness.evaluate(1);
    assert!(!first.steady);
    assert!(!first.capture_triggered);

    let second = harness.evaluate(2);
    assert!(second.steady);
    assert!(second.centered);
    assert!(second.sharp);
    assert!(second.orientation_ok);
    assert!(!second.shadow);
    assert_eq!(second.size, Some(rdt_vision::SizeClass::Ok));
    assert_eq!(second.exposure, rdt_vision::Exposure::Normal);
    assert!(second.passed_all, "reasons: {:?}", second.reasons);
    assert!(second.capture_triggered);
    assert!(second.preview_jpeg.is_some());

    harness.requests.recv_timeout(WAIT).expect("still request");
    assert_eq!(harness.session.phase(), Phase::CapturingStill);

    assert!(harness.session.deliver_still(harness.frame(STILL_TS)));
    let result = harness.interpreted();
    assert!(result.control);
    assert!(result.line_a);
    assert!(!result.line_b);
    assert_eq!(result.line_a_confidence, Some(0.3));

    assert_eq!(harness.session.phase(), Phase::Idle);
    assert_eq!(harness.submit(3), SubmitOutcome::Dropped(DropReason::Idle));
    assert!(harness.session.rescan());
    assert_eq!(harness.session.phase(), Phase::AwaitingSteadyFrame);
}

#[test]
fn only_one_still_is_requested_per_capture_episode() {
    let harness = Harness::new(test_config(), ReplayClassifier::new("lines"), RecordingSource::default())
        .started();
    harness.trigger_capture(1);

    // More good frames while the capture is pending never trigger again.
    for ts in 3..8 {
        let evaluation = harness.evaluate(ts);
        assert!(evaluation.passed_all);
        assert!(!evaluation.capture_triggered);
    }
    assert!(harness.requests.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(harness.source.requests.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_control_line_resumes_scanning_without_a_result() {
    let phase2 = ReplayClassifier::new("lines").with_frame(STILL_TS, vec![line("lineA", 0.9)]);
    let harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();
    harness.trigger_capture(1);

    assert!(harness.session.deliver_still(harness.frame(STILL_TS)));
    loop {
        match harness.next_event() {
            PipelineEvent::Interpreting => break,
            PipelineEvent::Interpreted(_) => panic!("invalid read must not be emitted"),
            _ => {}
        }
    }
    harness.wait_for_phase(Phase::AwaitingSteadyFrame);

    // Scanning is live again: the next steady frame triggers a fresh capture.
    harness.trigger_capture(20);
    assert_eq!(harness.source.requests.load(Ordering::SeqCst), 2);
    assert!(
        harness
            .events
            .try_iter()
            .all(|event| !matches!(event, PipelineEvent::Interpreted(_)))
    );
}

#[test]
fn frames_are_dropped_while_the_camera_is_not_focused() {
    let harness = Harness::new(test_config(), ReplayClassifier::new("lines"), RecordingSource::default())
        .started();
    for focus in [FocusState::Inactive, FocusState::Focusing, FocusState::Unfocused] {
        harness.session.set_focus_state(focus);
        assert_eq!(harness.submit(1), SubmitOutcome::Dropped(DropReason::NotFocused));
    }
    assert!(harness.events.recv_timeout(Duration::from_millis(100)).is_err());

    harness.session.set_focus_state(FocusState::Focused);
    assert_eq!(harness.submit(2), SubmitOutcome::Accepted);
}

#[test]
fn every_frame_is_released_exactly_once() {
    let phase2 = ReplayClassifier::new("lines").with_frame(STILL_TS, vec![line("control", 0.9)]);
    let mut harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();

    // Burst without waiting: most of these are dropped as busy.
    for ts in 1..20 {
        harness.session.submit_frame(harness.frame(ts));
    }
    harness.session.set_focus_state(FocusState::Unfocused);
    harness.session.submit_frame(harness.frame(30));
    harness.session.set_focus_state(FocusState::Focused);
    // No capture pending yet for this one, unless the burst already triggered.
    harness.session.deliver_still(harness.frame(STILL_TS));

    harness.session.stop();
    assert!(!harness.session.is_running());
    assert_eq!(harness.session.submit_frame(harness.frame(40)), SubmitOutcome::Dropped(DropReason::Stopped));
    assert_eq!(
        harness.released.load(Ordering::SeqCst),
        harness.created.load(Ordering::SeqCst)
    );
    assert_eq!(harness.source.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn teardown_during_capture_withholds_the_result() {
    let phase2 = ReplayClassifier::new("lines").with_frame(STILL_TS, vec![line("control", 0.9)]);
    let mut harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();
    harness.trigger_capture(1);

    harness.session.stop();
    assert!(!harness.session.deliver_still(harness.frame(STILL_TS)));
    assert!(
        harness
            .events
            .try_iter()
            .all(|event| !matches!(event, PipelineEvent::Interpreted(_)))
    );
    assert_eq!(harness.session.phase(), Phase::Idle);
}

#[test]
fn repeated_still_timeouts_end_the_session() {
    let mut config = test_config();
    config.capture.still_timeout_ms = 100;
    config.capture.max_camera_errors = 2;
    let harness = Harness::new(config, ReplayClassifier::new("lines"), RecordingSource::default())
        .started();

    harness.trigger_capture(1);
    harness.wait_for_phase(Phase::AwaitingSteadyFrame);
    assert_eq!(harness.session.state().consecutive_camera_errors, 1);

    // The steadiness history survives a retry, so the next frame triggers at once.
    assert!(harness.evaluate(3).capture_triggered);
    harness.requests.recv_timeout(WAIT).expect("still request");

    let failure = harness.failure();
    assert_eq!(failure.camera_errors, 2);
    assert!(harness.session.state().terminal);
    assert_eq!(harness.submit(20), SubmitOutcome::Dropped(DropReason::Stopped));
}

#[test]
fn lock_timeout_is_fatal_on_the_first_occurrence() {
    let source = RecordingSource {
        fail_with_lock_timeout: true,
        ..RecordingSource::default()
    };
    let harness = Harness::new(test_config(), ReplayClassifier::new("lines"), source).started();

    harness.evaluate(1);
    let second = harness.evaluate(2);
    assert!(second.capture_triggered);

    let failure = harness.failure();
    assert!(failure.message.contains("lock"));
    assert!(harness.session.state().terminal);
    assert!(!harness.session.rescan());

    // Reported errors after the session failed are not surfaced again.
    harness
        .session
        .report_camera_error(CaptureError::Disconnected);
    assert!(harness.events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn terminal_failure_follows_the_triggering_evaluation() {
    let source = RecordingSource {
        fail_with_lock_timeout: true,
        ..RecordingSource::default()
    };
    let harness = Harness::new(test_config(), ReplayClassifier::new("lines"), source).started();
    harness.evaluate(1);
    assert_eq!(harness.submit(2), SubmitOutcome::Accepted);

    let mut order = Vec::new();
    loop {
        match harness.next_event() {
            PipelineEvent::FrameEvaluated(evaluation) => order.push(format!(
                "evaluated {} triggered={}",
                evaluation.timestamp_ms, evaluation.capture_triggered
            )),
            PipelineEvent::Failed(_) => {
                order.push("failed".to_string());
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(order, ["evaluated 2 triggered=true", "failed"]);

    assert_eq!(harness.submit(3), SubmitOutcome::Dropped(DropReason::Stopped));
    assert!(harness.events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn camera_error_reported_during_capture_keeps_the_episode() {
    let phase2 = ReplayClassifier::new("lines").with_frame(STILL_TS, vec![line("control", 0.9)]);
    let harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();
    harness.trigger_capture(1);

    harness
        .session
        .report_camera_error(CaptureError::StillTimeout { waited_ms: 2_000 });
    assert_eq!(harness.session.phase(), Phase::CapturingStill);
    assert_eq!(harness.session.state().consecutive_camera_errors, 1);

    // The still worker still owns the capture, so a good frame cannot start another.
    let third = harness.evaluate(3);
    assert!(third.passed_all);
    assert!(!third.capture_triggered);

    assert!(harness.session.deliver_still(harness.frame(STILL_TS)));
    assert!(harness.interpreted().control);
    assert!(harness.requests.recv_timeout(Duration::from_millis(800)).is_err());
    assert_eq!(harness.source.requests.load(Ordering::SeqCst), 1);
    let state = harness.session.state();
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.consecutive_camera_errors, 0);
    assert!(!state.terminal);
}

#[test]
fn rescan_after_a_read_needs_a_fresh_steady_run() {
    let phase2 = ReplayClassifier::new("lines").with_frame(STILL_TS, vec![line("control", 0.9)]);
    let harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();
    harness.trigger_capture(1);
    assert!(harness.session.deliver_still(harness.frame(STILL_TS)));
    harness.interpreted();
    assert_eq!(harness.session.phase(), Phase::Idle);

    assert!(harness.session.rescan());
    // Identical to the frames before the read, yet history was reset on entering Idle.
    let first = harness.evaluate(3);
    assert!(!first.steady);
    assert!(!first.capture_triggered);

    let second = harness.evaluate(4);
    assert!(second.steady);
    assert!(second.capture_triggered);
    harness.requests.recv_timeout(WAIT).expect("still request");
    assert_eq!(harness.source.requests.load(Ordering::SeqCst), 2);
}

#[test]
fn classifier_error_on_a_preview_frame_drops_it_silently() {
    let localizer = phase1(50).failing_at(2);
    let harness = Harness::with_localizer(
        test_config(),
        localizer,
        ReplayClassifier::new("lines"),
        RecordingSource::default(),
    )
    .started();

    assert!(!harness.evaluate(1).steady);
    assert_eq!(harness.submit(2), SubmitOutcome::Accepted);
    assert!(harness.events.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(harness.session.phase(), Phase::AwaitingSteadyFrame);
    assert!(!harness.session.state().terminal);

    // Scanning carries on: the next identical frame is steady and triggers.
    let third = harness.evaluate(3);
    assert!(third.steady);
    assert!(third.capture_triggered);
    harness.requests.recv_timeout(WAIT).expect("still request");
}

#[test]
fn session_can_restart_after_stop() {
    let phase2 = ReplayClassifier::new("lines").with_frame(STILL_TS, vec![line("control", 0.9)]);
    let mut harness = Harness::new(test_config(), phase2, RecordingSource::default()).started();
    harness.session.stop();

    harness.session.start(CAMERA).unwrap();
    assert!(matches!(harness.next_event(), PipelineEvent::CameraReady(_)));
    assert_eq!(harness.session.phase(), Phase::AwaitingSteadyFrame);
    assert!(harness.session.start(CAMERA).is_err());
}
