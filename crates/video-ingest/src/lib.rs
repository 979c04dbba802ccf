//! Frame model and frame sources feeding the RDT reader pipeline.

mod directory;
mod source;
mod types;

pub use directory::{DirectoryReplay, DirectorySource, ReplayEntry, list_frames, spawn_directory_reader};
pub use source::FrameSource;
pub use types::{CameraInfo, CaptureError, FocusState, Frame, FrameError, FrameFormat, ReleaseHook};
