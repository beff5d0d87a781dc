use std::sync::{Arc, Mutex};

use tracing::{error, info};

use super::stats::PipelineStats;
use crate::detect::DetectionResult;
use crate::sink::{OutputMode, Sink, SinkError};

/// Last payload successfully written. Empty means nothing written yet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupState {
    pub last_written_payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Written,
    Duplicate,
    /// Empty payloads never count as a marker.
    Empty,
}

/// Compare-and-write against [`DedupState`].
///
/// The whole compare, write, update sequence runs under one lock, so two
/// detections of the same new payload produce one write. The state only
/// advances after a successful write; a failed write is retried by the next
/// detection of the same payload.
pub struct Deduplicator {
    state: Mutex<DedupState>,
    sink: Arc<dyn Sink>,
    mode: OutputMode,
    stats: Arc<PipelineStats>,
}

impl Deduplicator {
    pub fn new(sink: Arc<dyn Sink>, mode: OutputMode, stats: Arc<PipelineStats>) -> Self {
        Self {
            state: Mutex::new(DedupState::default()),
            sink,
            mode,
            stats,
        }
    }

    pub fn offer(&self, result: &DetectionResult) -> Result<DedupOutcome, SinkError> {
        if result.payload.is_empty() {
            return Ok(DedupOutcome::Empty);
        }

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.last_written_payload == result.payload {
            self.stats.duplicate();
            return Ok(DedupOutcome::Duplicate);
        }

        match self.mode.record(self.sink.as_ref(), &result.payload) {
            Ok(()) => {
                state.last_written_payload.clone_from(&result.payload);
                self.stats.written();
                info!(payload = %result.payload, "new marker recorded");
                Ok(DedupOutcome::Written)
            }
            Err(err) => {
                self.stats.write_failed();
                error!("failed to record marker: {err}");
                Err(err)
            }
        }
    }

    pub fn state(&self) -> DedupState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
