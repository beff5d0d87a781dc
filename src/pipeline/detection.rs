use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::task;
use tracing::{debug, error, trace, warn};

use super::cancel::{CancelToken, StopReason};
use super::dedup::{DedupOutcome, Deduplicator};
use super::stats::PipelineStats;
use crate::capture::encode::encode_still;
use crate::capture::Frame;
use crate::detect::{DetectionResult, Detector, DetectorError};

/// Encodes queued frames and runs the detector over them.
///
/// Owns the detector and closes it before exiting. On cancellation the frames
/// already queued are still processed; nothing new arrives once acquisition has
/// stopped.
pub(crate) struct Detection {
    pub(crate) frames: Receiver<Frame>,
    pub(crate) results: Sender<DetectionResult>,
    pub(crate) detector: Box<dyn Detector>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) cancel: CancelToken,
}

enum Next {
    Frame(Frame),
    Drain,
    Closed,
}

impl Detection {
    pub(crate) async fn run(self) {
        let Detection {
            frames,
            results,
            detector,
            stats,
            cancel,
        } = self;
        let mut detector = Some(detector);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Drain,
                recv = frames.recv_async() => match recv {
                    Ok(frame) => Next::Frame(frame),
                    Err(_) => Next::Closed,
                },
            };

            match next {
                Next::Frame(frame) => {
                    detector = process(detector, frame, &results, &stats, &cancel).await;
                }
                Next::Drain => {
                    let mut drained = 0usize;
                    while let Ok(frame) = frames.try_recv() {
                        drained += 1;
                        detector = process(detector, frame, &results, &stats, &cancel).await;
                    }
                    debug!(drained, "detection queue drained");
                    break;
                }
                Next::Closed => break,
            }
        }

        if let Some(mut detector) = detector {
            detector.close();
        }
        debug!("detection loop exited");
    }
}

/// Run one frame through encode + detect on the blocking pool. The frame is
/// released right after encoding. Returns the detector for the next frame, or
/// `None` if the job panicked and took it down.
async fn process(
    detector: Option<Box<dyn Detector>>,
    frame: Frame,
    results: &Sender<DetectionResult>,
    stats: &PipelineStats,
    cancel: &CancelToken,
) -> Option<Box<dyn Detector>> {
    let Some(mut detector) = detector else {
        frame.release();
        return None;
    };
    let sequence = frame.meta().sequence;

    let job = task::spawn_blocking(move || {
        let encoded = encode_still(&frame);
        frame.release();
        let outcome = match encoded {
            Ok(bytes) => detector.detect(&bytes),
            Err(err) => Err(DetectorError::DecodeFailure(err.to_string())),
        };
        (detector, outcome)
    });

    let (detector, outcome) = match job.await {
        Ok(done) => done,
        Err(join_err) => {
            error!("detection job failed: {join_err}");
            stats.detect_failed();
            cancel.cancel_with(StopReason::DetectorLost);
            return None;
        }
    };

    match outcome {
        Ok(payloads) => {
            stats.frame_detected(payloads.len());
            trace!(sequence, markers = payloads.len(), "frame scanned");
            for payload in payloads.into_iter().filter(|p| !p.is_empty()) {
                if results.send_async(DetectionResult::new(payload)).await.is_err() {
                    warn!("dedup stage gone, detection result discarded");
                }
            }
        }
        Err(err) => {
            // Misreads are expected on live video; the next frame is the retry.
            stats.detect_failed();
            debug!(sequence, "detection failed: {err}");
        }
    }

    Some(detector)
}

/// Feeds detection results through the deduplicator until detection closes
/// the results queue.
pub(crate) async fn run_dedup(results: Receiver<DetectionResult>, dedup: Arc<Deduplicator>) {
    while let Ok(result) = results.recv_async().await {
        let dedup = dedup.clone();
        // Write failures are logged by the deduplicator and retried by the next
        // detection of the same payload.
        match task::spawn_blocking(move || dedup.offer(&result)).await {
            Ok(Ok(DedupOutcome::Duplicate)) => trace!("duplicate marker suppressed"),
            Ok(_) => {}
            Err(join_err) => error!("dedup job failed: {join_err}"),
        }
    }
    debug!("dedup stage exited");
}
