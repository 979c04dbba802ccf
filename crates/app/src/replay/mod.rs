//! `replay` subcommand: drive a scanning session from recorded frames.
//!
//! - `config`: CLI flags and the resolved run configuration.
//! - `manifest`: per-frame focus and recorded classifier output.
//! - `driver`: the frame/still/event loop around a `Session`.
//! - `output`: JSON-lines event rendering.

pub use config::{ReplayCliArgs, ReplayConfig};
pub use driver::run;

mod config;
mod driver;
mod manifest;
mod output;
