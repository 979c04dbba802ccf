use std::fmt;

use anyhow::Error;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Callback returning a frame buffer to whoever produced it.
pub type ReleaseHook = Box<dyn FnOnce() + Send + 'static>;

/// Image-plane buffer delivered by a frame source.
///
/// A frame is owned by exactly one pipeline stage at a time. Dropping it runs
/// the optional release hook, so every exit path releases the buffer once.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
    release: Option<ReleaseHook>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    /// Planar YUV 4:2:0: full Y plane followed by quarter-size U and V planes.
    I420,
    Rgb8,
    Rgba8,
    Bgr8,
    Luma8,
}

impl FrameFormat {
    /// Number of bytes a buffer of this format needs for the given geometry.
    pub fn expected_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            FrameFormat::I420 => {
                let chroma = w.div_ceil(2) * h.div_ceil(2);
                w * h + 2 * chroma
            }
            FrameFormat::Rgb8 | FrameFormat::Bgr8 => w * h * 3,
            FrameFormat::Rgba8 => w * h * 4,
            FrameFormat::Luma8 => w * h,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("frame buffer holds {actual} bytes, {format:?} {width}x{height} needs {expected}")]
    Malformed {
        format: FrameFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: FrameFormat, timestamp_ms: i64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms,
            format,
            release: None,
        }
    }

    /// Attach a callback that runs when the pipeline lets go of this frame.
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    /// Build an RGB frame from an already decoded image.
    pub fn from_rgb(image: RgbImage, timestamp_ms: i64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, FrameFormat::Rgb8, timestamp_ms)
    }

    /// Check that the buffer length matches the declared geometry.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty {
                width: self.width,
                height: self.height,
            });
        }
        let expected = self.format.expected_len(self.width, self.height);
        if self.data.len() != expected {
            return Err(FrameError::Malformed {
                format: self.format,
                width: self.width,
                height: self.height,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Convert the buffer to packed RGB (BT.601 for YUV input).
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        self.validate()?;
        let (w, h) = (self.width as usize, self.height as usize);
        let mut out = Vec::with_capacity(w * h * 3);
        match self.format {
            FrameFormat::Rgb8 => out.extend_from_slice(&self.data),
            FrameFormat::Rgba8 => {
                for px in self.data.chunks_exact(4) {
                    out.extend_from_slice(&px[..3]);
                }
            }
            FrameFormat::Bgr8 => {
                for px in self.data.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            FrameFormat::Luma8 => {
                for &y in &self.data {
                    out.extend_from_slice(&[y, y, y]);
                }
            }
            FrameFormat::I420 => {
                let chroma_w = w.div_ceil(2);
                let chroma_len = chroma_w * h.div_ceil(2);
                let (y_plane, rest) = self.data.split_at(w * h);
                let (u_plane, v_plane) = rest.split_at(chroma_len);
                for row in 0..h {
                    for col in 0..w {
                        let y = y_plane[row * w + col];
                        let idx = (row / 2) * chroma_w + col / 2;
                        out.extend_from_slice(&yuv_to_rgb(y, u_plane[idx], v_plane[idx]));
                    }
                }
            }
        }
        RgbImage::from_raw(self.width, self.height, out).ok_or(FrameError::Malformed {
            format: self.format,
            width: self.width,
            height: self.height,
            expected: self.format.expected_len(self.width, self.height),
            actual: self.data.len(),
        })
    }

    /// Extract the luminance plane, reading Y directly for YUV input.
    pub fn to_luma(&self) -> Result<GrayImage, FrameError> {
        match self.format {
            FrameFormat::Luma8 | FrameFormat::I420 => {
                self.validate()?;
                let len = (self.width as usize) * (self.height as usize);
                GrayImage::from_raw(self.width, self.height, self.data[..len].to_vec()).ok_or(
                    FrameError::Empty {
                        width: self.width,
                        height: self.height,
                    },
                )
            }
            _ => Ok(image::imageops::grayscale(&self.to_rgb()?)),
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("bytes", &self.data.len())
            .finish()
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Autofocus state reported asynchronously by the camera.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusState {
    #[default]
    Inactive,
    Focusing,
    Focused,
    Unfocused,
}

/// Camera properties announced once the source is ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub supports_torch: bool,
    pub view_width: u32,
    pub view_height: u32,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("timed out after {waited_ms} ms waiting to lock the camera")]
    LockTimeout { waited_ms: u64 },
    #[error("camera device disconnected")]
    Disconnected,
    #[error("no still frame delivered within {waited_ms} ms")]
    StillTimeout { waited_ms: u64 },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Resource-acquisition failures end the session; the rest may be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::Open { .. } | CaptureError::LockTimeout { .. } | CaptureError::Disconnected
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn i420_length_rounds_chroma_up() {
        assert_eq!(FrameFormat::I420.expected_len(4, 4), 16 + 2 * 4);
        assert_eq!(FrameFormat::I420.expected_len(5, 3), 15 + 2 * 6);
    }

    #[test]
    fn malformed_buffer_is_rejected() {
        let frame = Frame::new(vec![0; 10], 4, 4, FrameFormat::Rgb8, 0);
        assert!(matches!(
            frame.to_rgb(),
            Err(FrameError::Malformed { expected: 48, actual: 10, .. })
        ));
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let frame = Frame::new(vec![1, 2, 3], 1, 1, FrameFormat::Bgr8, 0);
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [3, 2, 1]);
    }

    #[test]
    fn i420_grey_converts_to_neutral_rgb() {
        let mut data = vec![128u8; 4];
        data.extend_from_slice(&[128, 128]);
        let frame = Frame::new(data, 2, 2, FrameFormat::I420, 0);
        let rgb = frame.to_rgb().unwrap();
        let px = rgb.get_pixel(1, 1).0;
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
        assert_eq!(frame.to_luma().unwrap().get_pixel(0, 0).0, [128]);
    }

    #[test]
    fn release_hook_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let frame = Frame::new(vec![0; 3], 1, 1, FrameFormat::Rgb8, 0).with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_timeout_is_fatal_but_still_timeout_is_not() {
        assert!(CaptureError::LockTimeout { waited_ms: 2500 }.is_fatal());
        assert!(!CaptureError::StillTimeout { waited_ms: 2500 }.is_fatal());
    }
}
