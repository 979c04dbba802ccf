//! Capture controller: the per-session state machine gating still captures.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use rdt_ingest::FocusState;
use serde::{Deserialize, Serialize};

use crate::pipeline::framing::{FailureReason, FramingReport};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    AwaitingSteadyFrame,
    CapturingStill,
    Interpreting,
}

/// Fields shared between the preview worker, the still worker and the
/// session's callers. Only ever touched through [`CaptureController`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineState {
    pub phase: Phase,
    pub focus: FocusState,
    pub capture_in_progress: bool,
    /// Bumped on every transition into `Idle`; consumers drop history from older epochs.
    pub epoch: u64,
    pub consecutive_camera_errors: u32,
    pub terminal: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HoldReason {
    NotScanning(Phase),
    CaptureInProgress,
    NotSteady,
    FocusNotReady(FocusState),
    Framing(Vec<FailureReason>),
    Terminal,
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::NotScanning(phase) => write!(f, "not scanning (phase {phase:?})"),
            HoldReason::CaptureInProgress => f.write_str("a capture is already in progress"),
            HoldReason::NotSteady => f.write_str(FailureReason::NotSteady.message()),
            HoldReason::FocusNotReady(focus) => write!(f, "camera not focused ({focus:?})"),
            HoldReason::Framing(reasons) => {
                let messages: Vec<&str> = reasons.iter().map(|r| r.message()).collect();
                f.write_str(&messages.join("; "))
            }
            HoldReason::Terminal => f.write_str("session has failed"),
        }
    }
}

/// Whether a preview frame is promoted to a still capture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureDecision {
    Trigger,
    Hold(HoldReason),
}

impl CaptureDecision {
    pub fn is_trigger(&self) -> bool {
        matches!(self, CaptureDecision::Trigger)
    }
}

/// Why the ingestor refused a preview frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Busy,
    NotFocused,
    Idle,
    Stopped,
    Malformed,
}

impl DropReason {
    pub fn label(self) -> &'static str {
        match self {
            DropReason::Busy => "busy",
            DropReason::NotFocused => "not_focused",
            DropReason::Idle => "idle",
            DropReason::Stopped => "stopped",
            DropReason::Malformed => "malformed",
        }
    }
}

/// How an interpretation episode ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpisodeOutcome {
    /// A result was emitted; wait in `Idle` for a rescan.
    Success,
    /// No test area, no control line or a transient error; keep scanning.
    Retry,
}

/// Where a camera error was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// The still worker's own request or wait failed; its episode is over.
    Episode,
    /// Reported by the frame source owner. Never ends an episode the still
    /// worker is running; that episode finishes through delivery or timeout.
    External,
}

/// Owns [`PipelineState`] behind a single mutex.
///
/// Critical sections only read or update fields; no inference or I/O ever
/// runs with the lock held.
#[derive(Debug, Default)]
pub struct CaptureController {
    state: Mutex<PipelineState>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> PipelineState {
        self.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn set_focus(&self, focus: FocusState) {
        self.lock().focus = focus;
    }

    /// `Idle -> AwaitingSteadyFrame` at session start. Clears any earlier failure.
    pub fn begin_session(&self) {
        let mut state = self.lock();
        state.phase = Phase::AwaitingSteadyFrame;
        state.capture_in_progress = false;
        state.consecutive_camera_errors = 0;
        state.terminal = false;
    }

    /// Whether a preview frame should reach the worker; returns the current epoch.
    pub fn admit_preview(&self) -> Result<u64, DropReason> {
        let state = self.lock();
        if state.terminal {
            return Err(DropReason::Stopped);
        }
        if state.phase == Phase::Idle {
            return Err(DropReason::Idle);
        }
        if state.focus != FocusState::Focused {
            return Err(DropReason::NotFocused);
        }
        Ok(state.epoch)
    }

    /// Decide whether this evaluated frame triggers a still capture.
    ///
    /// On `Trigger` the controller has already moved to `CapturingStill` and
    /// set the in-progress flag, so no other caller can trigger until the
    /// episode ends.
    pub fn decide(&self, steady: bool, report: &FramingReport) -> CaptureDecision {
        let mut state = self.lock();
        let hold = if state.terminal {
            Some(HoldReason::Terminal)
        } else if state.capture_in_progress {
            Some(HoldReason::CaptureInProgress)
        } else if state.phase != Phase::AwaitingSteadyFrame {
            Some(HoldReason::NotScanning(state.phase))
        } else if !steady {
            Some(HoldReason::NotSteady)
        } else if !report.passed_all {
            Some(HoldReason::Framing(report.reasons.clone()))
        } else if state.focus != FocusState::Focused {
            Some(HoldReason::FocusNotReady(state.focus))
        } else {
            None
        };

        match hold {
            Some(reason) => CaptureDecision::Hold(reason),
            None => {
                state.capture_in_progress = true;
                state.phase = Phase::CapturingStill;
                CaptureDecision::Trigger
            }
        }
    }

    /// `CapturingStill -> Interpreting` when the requested still arrives.
    pub fn begin_interpreting(&self) -> bool {
        let mut state = self.lock();
        if state.phase == Phase::CapturingStill && state.capture_in_progress && !state.terminal {
            state.phase = Phase::Interpreting;
            state.consecutive_camera_errors = 0;
            true
        } else {
            false
        }
    }

    pub fn finish(&self, outcome: EpisodeOutcome) {
        let mut state = self.lock();
        state.capture_in_progress = false;
        let in_episode = matches!(state.phase, Phase::CapturingStill | Phase::Interpreting);
        if state.terminal || !in_episode {
            return;
        }
        match outcome {
            EpisodeOutcome::Success => {
                state.phase = Phase::Idle;
                state.epoch += 1;
                state.consecutive_camera_errors = 0;
            }
            EpisodeOutcome::Retry => state.phase = Phase::AwaitingSteadyFrame,
        }
    }

    /// Count a recoverable camera error. An episode-level error also releases
    /// the capture slot.
    /// Returns `true` once the error budget is exhausted and the session is terminal.
    pub fn record_camera_error(&self, origin: ErrorOrigin, max_consecutive: u32) -> bool {
        let mut state = self.lock();
        state.consecutive_camera_errors = state.consecutive_camera_errors.saturating_add(1);
        if state.consecutive_camera_errors >= max_consecutive {
            mark_terminal(&mut state);
        } else if origin == ErrorOrigin::Episode {
            state.capture_in_progress = false;
            if matches!(state.phase, Phase::CapturingStill | Phase::Interpreting) {
                state.phase = Phase::AwaitingSteadyFrame;
            }
        }
        state.terminal
    }

    /// Whether the still worker is waiting for a still right now.
    pub fn awaiting_still(&self) -> bool {
        let state = self.lock();
        state.phase == Phase::CapturingStill && state.capture_in_progress && !state.terminal
    }

    /// Enter the terminal state. Returns `false` if the session had already failed.
    pub fn fail(&self) -> bool {
        let mut state = self.lock();
        let first = !state.terminal;
        mark_terminal(&mut state);
        first
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().terminal
    }

    /// `Idle -> AwaitingSteadyFrame` after a successful read.
    pub fn rescan(&self) -> bool {
        let mut state = self.lock();
        if state.phase == Phase::Idle && !state.terminal {
            state.phase = Phase::AwaitingSteadyFrame;
            true
        } else {
            false
        }
    }

    /// Return to `Idle` on teardown.
    pub fn end_session(&self) {
        let mut state = self.lock();
        if state.phase != Phase::Idle {
            state.epoch += 1;
        }
        state.phase = Phase::Idle;
        state.capture_in_progress = false;
    }
}

fn mark_terminal(state: &mut PipelineState) {
    state.terminal = true;
    state.capture_in_progress = false;
    if state.phase != Phase::Idle {
        state.epoch += 1;
    }
    state.phase = Phase::Idle;
}
