//! Frame-to-frame stability gate.

use image::GrayImage;

use crate::pipeline::{config::SteadinessConfig, imaging};

/// Rolling comparison of consecutive frame signatures.
///
/// A frame is steady once `window` consecutive frame deltas have stayed below
/// the motion threshold. The history belongs to one scanning episode and is
/// cleared whenever the capture controller returns to idle.
#[derive(Debug)]
pub struct SteadinessGate {
    config: SteadinessConfig,
    previous: Option<GrayImage>,
    calm_run: usize,
    epoch: u64,
}

impl SteadinessGate {
    pub fn new(config: SteadinessConfig) -> Self {
        Self {
            config,
            previous: None,
            calm_run: 0,
            epoch: 0,
        }
    }

    /// Record `luma` and report whether the scene has been still long enough.
    pub fn is_steady(&mut self, luma: &GrayImage) -> bool {
        let signature = imaging::signature(luma, self.config.signature_size);
        let delta = self
            .previous
            .as_ref()
            .and_then(|prev| imaging::mean_abs_diff(prev, &signature));
        self.previous = Some(signature);

        match delta {
            Some(delta) if delta < self.config.motion_threshold => {
                self.calm_run = self.calm_run.saturating_add(1);
            }
            _ => self.calm_run = 0,
        }
        tracing::trace!(?delta, run = self.calm_run, "steadiness");
        self.calm_run >= self.config.window
    }

    /// Forget history if the controller has entered a new episode since the last frame.
    pub fn sync_epoch(&mut self, epoch: u64) {
        if epoch != self.epoch {
            self.epoch = epoch;
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.calm_run = 0;
    }
}
