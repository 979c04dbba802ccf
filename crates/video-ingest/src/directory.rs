//! Directory-backed capture used to replay recorded scanning sessions.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{Context, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select};
use image::imageops::{self, FilterType};
use tracing::{debug, warn};

use crate::{
    source::FrameSource,
    types::{CaptureError, Frame},
};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One recorded frame on disk and the timestamp it is replayed under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayEntry {
    pub path: PathBuf,
    pub timestamp_ms: i64,
}

/// Channels and still-capture handle for a running directory replay.
pub struct DirectoryReplay {
    pub frames: Receiver<Result<Frame, CaptureError>>,
    pub stills: Receiver<Result<Frame, CaptureError>>,
    pub source: Arc<DirectorySource>,
}

/// Still-capture side of a directory replay.
///
/// A still request re-reads the most recently shown preview file at full
/// resolution, mirroring how a camera serves a larger capture of the scene
/// currently in the viewfinder.
pub struct DirectorySource {
    current: Arc<Mutex<Option<ReplayEntry>>>,
    still_tx: Sender<Result<Frame, CaptureError>>,
    /// Dropping the sender stops the reader thread.
    stop_tx: Mutex<Option<Sender<()>>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// List image files in `dir`, sorted by file name.
pub fn list_frames(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Spawns a background thread that replays `entries` as preview frames.
///
/// Frames larger than `preview_max_dim` on their longer side are downscaled.
/// The preview channel is small so the reader is paced by its consumer as
/// well as by `interval`.
pub fn spawn_directory_reader(
    entries: Vec<ReplayEntry>,
    preview_max_dim: u32,
    interval: Duration,
) -> Result<DirectoryReplay, CaptureError> {
    if entries.is_empty() {
        return Err(CaptureError::Open {
            uri: "<empty replay>".to_string(),
        });
    }

    let (tx, rx) = bounded(2);
    let (still_tx, still_rx) = bounded(1);
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let current = Arc::new(Mutex::new(None));
    let shown = current.clone();

    let reader = thread::Builder::new()
        .name("replay-reader".into())
        .spawn(move || {
            if let Err(err) = replay_loop(entries, preview_max_dim, interval, &shown, &tx, &stop_rx) {
                forward(&tx, &stop_rx, Err(err));
            }
            debug!("replay reader exiting");
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(DirectoryReplay {
        frames: rx,
        stills: still_rx,
        source: Arc::new(DirectorySource {
            current,
            still_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            reader: Mutex::new(Some(reader)),
        }),
    })
}

/// Send unless a stop was requested first. Returns `false` when the reader
/// should exit.
fn forward(
    tx: &Sender<Result<Frame, CaptureError>>,
    stop: &Receiver<()>,
    msg: Result<Frame, CaptureError>,
) -> bool {
    select! {
        send(tx, msg) -> res => res.is_ok(),
        recv(stop) -> _ => false,
    }
}

/// Main replay loop executed on the background thread.
fn replay_loop(
    entries: Vec<ReplayEntry>,
    preview_max_dim: u32,
    interval: Duration,
    shown: &Mutex<Option<ReplayEntry>>,
    tx: &Sender<Result<Frame, CaptureError>>,
    stop: &Receiver<()>,
) -> Result<(), CaptureError> {
    for entry in entries {
        let image = load_rgb(&entry.path)?;
        let preview = downscale(image, preview_max_dim);
        *lock(shown) = Some(entry.clone());
        if !forward(tx, stop, Ok(Frame::from_rgb(preview, entry.timestamp_ms))) {
            break;
        }
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }
    Ok(())
}

fn load_rgb(path: &Path) -> Result<image::RgbImage, CaptureError> {
    let image = image::open(path)
        .with_context(|| format!("decoding {}", path.display()))
        .map_err(CaptureError::Other)?;
    Ok(image.to_rgb8())
}

fn downscale(image: image::RgbImage, max_dim: u32) -> image::RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if max_dim == 0 || longest <= max_dim {
        return image;
    }
    let scale = max_dim as f32 / longest as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    imageops::resize(&image, new_w, new_h, FilterType::Triangle)
}

impl FrameSource for DirectorySource {
    fn request_still(&self) -> Result<(), CaptureError> {
        let entry = lock(&self.current)
            .clone()
            .ok_or_else(|| CaptureError::Other(anyhow!("no preview frame shown yet")))?;

        let still_tx = self.still_tx.clone();
        thread::Builder::new()
            .name("replay-still".into())
            .spawn(move || {
                debug!(path = %entry.path.display(), "Serving still capture");
                let still = load_rgb(&entry.path).map(|image| Frame::from_rgb(image, entry.timestamp_ms));
                let _ = still_tx.try_send(still);
            })
            .map_err(|err| CaptureError::Other(err.into()))?;
        Ok(())
    }

    /// Stop the reader thread and wait for it. Safe to call more than once.
    fn shutdown(&self) {
        drop(lock(&self.stop_tx).take());
        if let Some(reader) = lock(&self.reader).take() {
            if reader.join().is_err() {
                warn!("replay reader panicked");
            }
        }
    }
}
