use std::sync::Arc;
use std::time::Duration;

use flume::{Sender, TrySendError};
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use super::cancel::CancelToken;
use super::device::{lock, ActiveSource};
use super::stats::PipelineStats;
use crate::capture::{Frame, SourceError};

/// Pulls frames from whatever source is active and offers copies downstream.
pub(crate) struct Acquisition {
    pub(crate) active: Arc<ActiveSource>,
    pub(crate) frames: Sender<Frame>,
    pub(crate) preview: Option<Sender<Frame>>,
    pub(crate) backoff: Duration,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) cancel: CancelToken,
}

impl Acquisition {
    pub(crate) async fn run(self) {
        let mut failure_streak = 0u64;

        while !self.cancel.is_cancelled() {
            let mut capture = self.spawn_capture();

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                joined = &mut capture => Some(joined),
            };

            let Some(joined) = joined else {
                // The read is bounded; wait for it so its frame is released here.
                if let Ok(Ok(frame)) = capture.await {
                    frame.release();
                }
                break;
            };

            match joined {
                Ok(Ok(frame)) => {
                    if failure_streak > 0 {
                        info!(failures = failure_streak, "capture recovered");
                        failure_streak = 0;
                    }
                    if self.cancel.is_cancelled() {
                        frame.release();
                        break;
                    }
                    self.forward(frame);
                }
                Ok(Err(err)) => {
                    failure_streak += 1;
                    self.stats.capture_failed();
                    self.report_failure(&err, failure_streak);
                    self.back_off().await;
                }
                Err(join_err) => {
                    failure_streak += 1;
                    self.stats.capture_failed();
                    error!("capture job failed: {join_err}");
                    self.back_off().await;
                }
            }
        }

        debug!("acquisition loop exited");
    }

    fn spawn_capture(&self) -> JoinHandle<Result<Frame, SourceError>> {
        let cell = self.active.snapshot();
        task::spawn_blocking(move || lock(&cell).capture_frame())
    }

    /// Offer a copy to detection (and one to the preview if attached), then
    /// release the captured frame. Full queues drop the copy.
    fn forward(&self, frame: Frame) {
        self.stats.frame_captured();
        let meta = frame.meta();
        trace!(sequence = meta.sequence, device = meta.device_id, "frame captured");

        match self.frames.try_send(frame.duplicate()) {
            Ok(()) => {}
            Err(TrySendError::Full(copy)) => {
                self.stats.frame_dropped();
                trace!("detection queue full, frame dropped");
                copy.release();
            }
            Err(TrySendError::Disconnected(copy)) => copy.release(),
        }

        if let Some(preview) = &self.preview {
            if let Err(err) = preview.try_send(frame.duplicate()) {
                err.into_inner().release();
            }
        }

        frame.release();
    }

    fn report_failure(&self, err: &SourceError, streak: u64) {
        if streak == 1 {
            warn!("Error capturing frame: {err}");
        } else if !err.is_transient() {
            warn!(streak, "Error capturing frame: {err}");
        } else {
            debug!(streak, "Error capturing frame: {err}");
        }
    }

    async fn back_off(&self) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.backoff) => {}
        }
    }
}
