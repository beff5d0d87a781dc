//! Acquisition → detection → dedup → sink, with device hot-swap and
//! cancellation.
//!
//! A run moves through `Idle → Running → Draining → Stopped`:
//!
//! - [`Pipeline::start`] opens the initial source, initialises the detector and
//!   spawns the acquisition, detection and dedup tasks (`Running`).
//! - Cancellation (interrupt, stop stimulus, or loss of every source) moves the
//!   run to `Draining`: acquisition stops accepting frames, detection finishes
//!   what is already queued, the dedup stage finishes what detection produced.
//! - [`RunningPipeline::wait`] joins the tasks, runs the release actions in
//!   reverse acquisition order and reports `Stopped`.

mod acquisition;
mod cancel;
mod dedup;
mod detection;
mod device;
mod signal;
mod stats;
mod teardown;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::Receiver;
use thiserror::Error;
use tokio::task::{self, JoinHandle};
use tracing::{info, instrument, warn};

pub use cancel::{CancelToken, StopReason};
pub use dedup::{DedupOutcome, DedupState, Deduplicator};
pub use device::{ActiveSource, DeviceController, SwitchError, SwitchOutcome};
pub use signal::listen_for_interrupt;
pub use stats::{PipelineStats, StatsSnapshot};

use acquisition::Acquisition;
use detection::Detection;
use teardown::Teardown;

use crate::capture::{DeviceHandle, DeviceId, Frame, FrameLedger, SourceError, SourceProvider};
use crate::detect::{Detector, DetectorError};
use crate::sink::{OutputMode, Sink};
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Idle,
            1 => PipelineState::Running,
            2 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }
}

/// Forward-only state cell.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(PipelineState::Idle as u8))
    }

    fn get(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is later than the current state.
    fn advance(&self, next: PipelineState) -> bool {
        let previous = self.0.fetch_max(next as u8, Ordering::AcqRel);
        let moved = previous < next as u8;
        if moved {
            info!(from = ?PipelineState::from_u8(previous), to = ?next, "pipeline state");
        }
        moved
    }
}

/// External stimuli the pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stimulus {
    /// Switch to device `0..=9`.
    SelectDevice(u8),
    Stop,
}

impl Stimulus {
    /// Number keys select a device, `q` stops.
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            '0'..='9' => key.to_digit(10).map(|d| Stimulus::SelectDevice(d as u8)),
            'q' | 'Q' => Some(Stimulus::Stop),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open capture device {device}")]
    SourceOpen {
        device: DeviceId,
        #[source]
        source: SourceError,
    },
    #[error("failed to initialise marker detector")]
    DetectorInit(#[source] DetectorError),
    #[error("pipeline already cancelled before start")]
    CancelledBeforeStart,
    #[error("pipeline stopped: {0}")]
    Aborted(StopReason),
}

/// Pipeline tuning, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub device_id: DeviceId,
    pub queue_capacity: usize,
    pub result_capacity: usize,
    pub capture_backoff: Duration,
    pub drain_timeout: Duration,
    pub output_mode: OutputMode,
    /// Whether a display collaborator is attached. Decided once, before start.
    pub preview: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_id: config.capture.device_id,
            queue_capacity: config.pipeline.queue_capacity.max(1),
            result_capacity: config.pipeline.result_capacity.max(1),
            capture_backoff: Duration::from_millis(config.pipeline.capture_backoff_ms),
            drain_timeout: Duration::from_millis(config.pipeline.drain_timeout_ms),
            output_mode: config.output.mode,
            preview: false,
        }
    }
}

/// An `Idle` pipeline.
pub struct Pipeline {
    provider: Arc<dyn SourceProvider>,
    detector: Box<dyn Detector>,
    sink: Arc<dyn Sink>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        detector: Box<dyn Detector>,
        sink: Arc<dyn Sink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            provider,
            detector,
            sink,
            settings,
        }
    }

    /// `Idle → Running`. Opening the initial source or initialising the detector
    /// failing is fatal and returned here; anything acquired so far is released.
    #[instrument(skip_all, fields(device = self.settings.device_id))]
    pub async fn start(self, cancel: CancelToken) -> Result<RunningPipeline, PipelineError> {
        let Pipeline {
            provider,
            mut detector,
            sink,
            settings,
        } = self;

        if cancel.is_cancelled() {
            return Err(PipelineError::CancelledBeforeStart);
        }

        let state = StateCell::new();
        let ledger = provider.ledger().clone();
        let mut teardown = Teardown::new();

        let controller =
            DeviceController::open_initial(provider, settings.device_id, cancel.clone())
                .await
                .map_err(|source| PipelineError::SourceOpen {
                    device: settings.device_id,
                    source,
                })?;
        let active = controller.active();
        {
            let active = active.clone();
            teardown.push("capture device", move || Ok(active.close()?));
        }

        if let Err(err) = detector.initialize() {
            task::spawn_blocking(move || teardown.run()).await.ok();
            return Err(PipelineError::DetectorInit(err));
        }

        let stats = Arc::new(PipelineStats::new());
        let dedup = Arc::new(Deduplicator::new(sink, settings.output_mode, stats.clone()));

        let (frame_tx, frame_rx) = flume::bounded(settings.queue_capacity);
        let (result_tx, result_rx) = flume::bounded(settings.result_capacity);
        let (preview_tx, preview_rx) = if settings.preview {
            let (tx, rx) = flume::bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let acquisition = tokio::spawn(
            Acquisition {
                active: active.clone(),
                frames: frame_tx,
                preview: preview_tx,
                backoff: settings.capture_backoff,
                stats: stats.clone(),
                cancel: cancel.clone(),
            }
            .run(),
        );
        let detection = tokio::spawn(
            Detection {
                frames: frame_rx,
                results: result_tx,
                detector,
                stats: stats.clone(),
                cancel: cancel.clone(),
            }
            .run(),
        );
        let dedup_task = tokio::spawn(detection::run_dedup(result_rx, dedup.clone()));

        state.advance(PipelineState::Running);
        info!(
            queue = settings.queue_capacity,
            mode = ?settings.output_mode,
            preview = settings.preview,
            "pipeline running"
        );

        let shared = Arc::new(Shared {
            cancel,
            state,
            controller,
            stats,
            dedup,
            preview: preview_rx,
            ledger,
        });

        let draining = {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.cancel.cancelled().await;
                shared.state.advance(PipelineState::Draining);
            })
        };

        Ok(RunningPipeline {
            handle: PipelineHandle { shared },
            tasks: vec![
                ("acquisition", acquisition),
                ("detection", detection),
                ("dedup", dedup_task),
                ("state", draining),
            ],
            teardown,
            drain_timeout: settings.drain_timeout,
        })
    }
}

struct Shared {
    cancel: CancelToken,
    state: StateCell,
    controller: DeviceController,
    stats: Arc<PipelineStats>,
    dedup: Arc<Deduplicator>,
    preview: Option<Receiver<Frame>>,
    ledger: FrameLedger,
}

/// Cloneable control surface of a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Request a normal shutdown.
    pub fn stop(&self) {
        self.shared.cancel.cancel_with(StopReason::Requested);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub async fn switch_device(&self, device_id: DeviceId) -> Result<SwitchOutcome, SwitchError> {
        self.shared.controller.switch_to(device_id).await
    }

    pub async fn dispatch(&self, stimulus: Stimulus) -> Result<(), SwitchError> {
        match stimulus {
            Stimulus::SelectDevice(id) => self.switch_device(DeviceId::from(id)).await.map(|_| ()),
            Stimulus::Stop => {
                self.stop();
                Ok(())
            }
        }
    }

    /// The active device binding.
    pub fn device(&self) -> DeviceHandle {
        self.shared.controller.active().handle()
    }

    /// Next frame for the display collaborator; `None` when nothing new has been
    /// captured or no display is attached.
    pub fn next_display_frame(&self) -> Option<Frame> {
        self.shared.preview.as_ref()?.try_recv().ok()
    }

    pub fn has_display(&self) -> bool {
        self.shared.preview.is_some()
    }

    /// Last payload written to the sink, if any.
    pub fn last_marker(&self) -> Option<String> {
        let state = self.shared.dedup.state();
        (!state.last_written_payload.is_empty()).then_some(state.last_written_payload)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn frames_outstanding(&self) -> usize {
        self.shared.ledger.outstanding()
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("state", &self.state())
            .field("device", &self.device())
            .finish()
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub reason: StopReason,
    pub stats: StatsSnapshot,
    pub release_failures: usize,
}

/// A `Running` pipeline.
pub struct RunningPipeline {
    handle: PipelineHandle,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    teardown: Teardown,
    drain_timeout: Duration,
}

impl RunningPipeline {
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Wait for cancellation, drain, release everything and stop.
    pub async fn wait(self) -> PipelineReport {
        let RunningPipeline {
            handle,
            tasks,
            teardown,
            drain_timeout,
        } = self;
        let shared = &handle.shared;

        shared.cancel.cancelled().await;
        shared.state.advance(PipelineState::Draining);

        let deadline = tokio::time::Instant::now() + drain_timeout;
        for (name, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(task = name, "task ended abnormally: {err}"),
                Err(_) => {
                    warn!(task = name, "task did not drain in time, aborting");
                    task.abort();
                }
            }
        }

        // Drop whatever the display collaborator never picked up.
        if let Some(preview) = &shared.preview {
            preview.drain().for_each(Frame::release);
        }

        let switching = shared.controller.quiesce().await;
        let release_failures = task::spawn_blocking(move || teardown.run())
            .await
            .unwrap_or(1);
        drop(switching);

        shared.state.advance(PipelineState::Stopped);
        let reason = shared.cancel.reason().unwrap_or(StopReason::Requested);
        let stats = shared.stats.snapshot();
        info!(%reason, ?stats, outstanding = shared.ledger.outstanding(), "pipeline stopped");

        PipelineReport {
            reason,
            stats,
            release_failures,
        }
    }

    /// Like [`RunningPipeline::wait`], but an unintentional stop is an error.
    pub async fn run_to_completion(self) -> Result<PipelineReport, PipelineError> {
        let report = self.wait().await;
        if report.reason.is_intentional() {
            Ok(report)
        } else {
            Err(PipelineError::Aborted(report.reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_moves_forward() {
        let state = StateCell::new();
        assert!(state.advance(PipelineState::Running));
        assert!(state.advance(PipelineState::Stopped));
        assert!(!state.advance(PipelineState::Draining));
        assert_eq!(state.get(), PipelineState::Stopped);
    }

    #[test]
    fn keys_map_to_stimuli() {
        assert_eq!(Stimulus::from_key('0'), Some(Stimulus::SelectDevice(0)));
        assert_eq!(Stimulus::from_key('9'), Some(Stimulus::SelectDevice(9)));
        assert_eq!(Stimulus::from_key('q'), Some(Stimulus::Stop));
        assert_eq!(Stimulus::from_key('x'), None);
    }
}
