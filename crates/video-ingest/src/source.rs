//! Boundary between the pipeline and whatever owns the camera.

use crate::types::CaptureError;

/// Camera-side collaborator consumed by the pipeline.
///
/// Preview frames, focus updates and still frames are pushed into the
/// pipeline by the owner of the source; the pipeline only ever calls back to
/// ask for a still capture and to release the device on teardown.
pub trait FrameSource: Send + Sync {
    /// Ask the camera for one higher-resolution still. Must not block on the
    /// capture itself; the frame arrives later through the session.
    fn request_still(&self) -> Result<(), CaptureError>;

    /// Release the device once all pipeline work has been joined.
    fn shutdown(&self) {}
}
