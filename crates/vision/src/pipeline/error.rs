use std::io;

use rdt_ingest::FrameError;
use rdt_ml_core::{ClassifierError, TransformError};
use thiserror::Error;

use crate::pipeline::config::ConfigError;

/// Errors raised inside the pipeline stages.
///
/// Per-frame errors are transient from the session's point of view: the
/// frame is dropped and scanning continues. Camera errors go through the
/// capture controller instead.
#[derive(Debug, Error)]
pub enum VisionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("classifier {name} failed: {source}")]
    Classifier {
        name: String,
        #[source]
        source: ClassifierError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("session is already running")]
    AlreadyRunning,
    #[error("result sink was lost when a previous run panicked")]
    SinkUnavailable,
}

impl VisionError {
    pub fn classifier(name: &str, source: ClassifierError) -> Self {
        VisionError::Classifier {
            name: name.to_string(),
            source,
        }
    }
}
