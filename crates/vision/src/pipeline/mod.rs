//! Frame-processing pipeline that gates preview frames, localizes the strip,
//! evaluates framing, captures a still and interprets its result lines.
//!
//! The module is split into focused submodules:
//! - `config`: thresholds and options for every stage.
//! - `ingest`: depth-1 frame slot in front of the preview worker.
//! - `steadiness`: frame-to-frame stability gate.
//! - `localizer`: phase-1 strip detection and coordinate mapping.
//! - `framing`: centering, orientation, size, exposure, shadow and sharpness checks.
//! - `state`: capture controller guarding single-flight captures.
//! - `interpreter`: phase-2 line detection on a still.
//! - `events`: result sink contract and the non-blocking dispatcher.
//! - `workers`: preview and still background threads.
//! - `session`: lifecycle wiring.
//! - `imaging`: pixel statistics shared by the stages.
//! - `telemetry`: tracing subscribers and the Prometheus recorder.

pub mod config;
pub mod error;
pub mod events;
pub mod framing;
pub mod imaging;
pub mod ingest;
pub mod interpreter;
pub mod localizer;
pub mod session;
pub mod state;
pub mod steadiness;
pub mod telemetry;
mod workers;
