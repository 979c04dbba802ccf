//! RDT strip reading: quality gating, two-phase detection and result
//! interpretation over a live camera feed.

pub mod pipeline;

/// Re-export the session surface so callers can run a scan without reaching
/// into submodules.
pub use pipeline::{
    config::{PipelineConfig, TelemetryOptions},
    error::VisionError,
    events::{FrameEvaluation, PipelineEvent, ResultSink, TerminalFailure},
    framing::{Exposure, FailureReason, SizeClass},
    ingest::SubmitOutcome,
    interpreter::InterpretationResult,
    session::{PipelineBackends, Session},
    state::{DropReason, Phase},
};
