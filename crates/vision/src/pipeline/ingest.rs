//! Frame ingestion: a depth-1 slot in front of the preview worker.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_channel::{Sender, TrySendError};
use rdt_ingest::Frame;
use tracing::debug;

use crate::pipeline::state::{CaptureController, DropReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Dropped(DropReason),
}

impl SubmitOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// Frees the ingestion slot when the task carrying it is dropped.
pub(crate) struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Unit of work handed to the preview worker.
///
/// Field order matters: the frame is released before the slot reopens.
pub(crate) struct PreviewTask {
    pub(crate) frame: Frame,
    pub(crate) epoch: u64,
    _slot: SlotGuard,
}

/// Accepts a frame only while no other frame is being analysed.
///
/// Overflow is dropped newest-first: the incoming frame is released right
/// away and the in-flight one keeps its slot.
pub struct FrameIngestor {
    controller: Arc<CaptureController>,
    busy: Arc<AtomicBool>,
    work_tx: Sender<PreviewTask>,
}

impl FrameIngestor {
    pub(crate) fn new(controller: Arc<CaptureController>, work_tx: Sender<PreviewTask>) -> Self {
        Self {
            controller,
            busy: Arc::new(AtomicBool::new(false)),
            work_tx,
        }
    }

    /// Whether a frame is currently being analysed.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        if let Err(err) = frame.validate() {
            debug!(timestamp = frame.timestamp_ms, "malformed frame: {err}");
            return dropped(frame, DropReason::Malformed);
        }
        let epoch = match self.controller.admit_preview() {
            Ok(epoch) => epoch,
            Err(reason) => return dropped(frame, reason),
        };
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return dropped(frame, DropReason::Busy);
        }

        let task = PreviewTask {
            frame,
            epoch,
            _slot: SlotGuard(self.busy.clone()),
        };
        match self.work_tx.try_send(task) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(TrySendError::Full(task)) => dropped(task.frame, DropReason::Busy),
            Err(TrySendError::Disconnected(task)) => dropped(task.frame, DropReason::Stopped),
        }
    }
}

fn dropped(frame: Frame, reason: DropReason) -> SubmitOutcome {
    metrics::counter!("rdt_frames_dropped_total", "reason" => reason.label()).increment(1);
    debug!(timestamp = frame.timestamp_ms, reason = reason.label(), "frame dropped");
    drop(frame);
    SubmitOutcome::Dropped(reason)
}
