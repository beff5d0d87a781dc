//! Active source ownership and hot-swap.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, instrument, warn};

use super::cancel::{CancelToken, StopReason};
use crate::capture::{DeviceHandle, DeviceId, Source, SourceError, SourceProvider};

pub type SourceCell = Mutex<Box<dyn Source>>;

/// The current source. Readers take a snapshot and keep using it even if the
/// slot is swapped underneath them.
pub struct ActiveSource {
    slot: ArcSwap<SourceCell>,
}

impl ActiveSource {
    pub(crate) fn new(source: Box<dyn Source>) -> Self {
        Self {
            slot: ArcSwap::from_pointee(Mutex::new(source)),
        }
    }

    pub fn snapshot(&self) -> Arc<SourceCell> {
        self.slot.load_full()
    }

    fn replace(&self, source: Box<dyn Source>) {
        self.slot.store(Arc::new(Mutex::new(source)));
    }

    pub fn handle(&self) -> DeviceHandle {
        lock(&self.snapshot()).handle()
    }

    /// Close the current source if it is open.
    pub(crate) fn close(&self) -> Result<(), SourceError> {
        let cell = self.snapshot();
        let mut source = lock(&cell);
        if source.is_open() {
            source.close()?;
            info!(device = source.handle().id, "capture device closed");
        }
        Ok(())
    }
}

/// Lock a source cell. A panic during a previous capture leaves the source
/// usable for `close`, so poisoning is ignored.
pub(crate) fn lock(cell: &SourceCell) -> MutexGuard<'_, Box<dyn Source>> {
    cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("switch to device {requested} failed; device {restored} restored")]
    SwitchFailed {
        requested: DeviceId,
        restored: DeviceId,
        #[source]
        cause: SourceError,
    },
    #[error("switch to device {requested} failed and device {previous} could not be reopened")]
    SourceLost {
        requested: DeviceId,
        previous: DeviceId,
        #[source]
        cause: SourceError,
        rollback: SourceError,
    },
    #[error("pipeline is shutting down")]
    ShuttingDown,
    #[error("device switch job panicked")]
    Panicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Unchanged,
    Switched { from: DeviceId, to: DeviceId },
}

/// Serializes device switches and owns the [`ActiveSource`] slot.
pub struct DeviceController {
    provider: Arc<dyn SourceProvider>,
    active: Arc<ActiveSource>,
    current: AtomicU32,
    switching: tokio::sync::Mutex<()>,
    cancel: CancelToken,
}

impl DeviceController {
    /// Open `device_id` and make it the active source.
    pub async fn open_initial(
        provider: Arc<dyn SourceProvider>,
        device_id: DeviceId,
        cancel: CancelToken,
    ) -> Result<Self, SourceError> {
        let job_provider = provider.clone();
        let source = task::spawn_blocking(move || open_source(job_provider.as_ref(), device_id))
            .await
            .map_err(|e| SourceError::DeviceUnavailable {
                id: device_id,
                reason: e.to_string(),
            })??;

        info!(device = device_id, backend = source.name(), "capture device opened");
        Ok(Self {
            provider,
            active: Arc::new(ActiveSource::new(source)),
            current: AtomicU32::new(device_id),
            switching: tokio::sync::Mutex::new(()),
            cancel,
        })
    }

    pub fn active(&self) -> Arc<ActiveSource> {
        self.active.clone()
    }

    pub fn current_id(&self) -> DeviceId {
        self.current.load(Ordering::Acquire)
    }

    /// Hot-swap to `device_id`.
    ///
    /// The current source is closed first (a failed close is logged and the
    /// switch continues), then a new source is opened. The slot is replaced only
    /// once the new source is open. If the open fails the previous device is
    /// reopened; if that fails too the pipeline is cancelled with
    /// [`StopReason::SourceLost`].
    #[instrument(skip(self), fields(from = self.current_id()))]
    pub async fn switch_to(&self, device_id: DeviceId) -> Result<SwitchOutcome, SwitchError> {
        let _guard = self.switching.lock().await;
        if self.cancel.is_cancelled() {
            return Err(SwitchError::ShuttingDown);
        }

        let previous = self.current_id();
        if device_id == previous {
            return Ok(SwitchOutcome::Unchanged);
        }
        info!("Switching from device ID {} to {}", previous, device_id);

        let old = self.active.snapshot();
        let provider = self.provider.clone();
        let attempt = task::spawn_blocking(move || {
            {
                let mut source = lock(&old);
                if source.is_open() {
                    if let Err(err) = source.close() {
                        warn!(device = previous, "error closing current camera: {err}");
                    }
                }
            }

            match open_source(provider.as_ref(), device_id) {
                Ok(source) => SwapAttempt::Opened(source),
                Err(cause) => {
                    warn!("Failed to open camera with device ID {}: {}", device_id, cause);
                    match open_source(provider.as_ref(), previous) {
                        Ok(source) => SwapAttempt::RolledBack(source, cause),
                        Err(rollback) => SwapAttempt::Lost(cause, rollback),
                    }
                }
            }
        })
        .await
        .map_err(|_| SwitchError::Panicked)?;

        if self.cancel.is_cancelled() {
            return self.discard(attempt).await;
        }

        match attempt {
            SwapAttempt::Opened(source) => {
                self.active.replace(source);
                self.current.store(device_id, Ordering::Release);
                info!("Successfully switched to camera device ID: {}", device_id);
                Ok(SwitchOutcome::Switched {
                    from: previous,
                    to: device_id,
                })
            }
            SwapAttempt::RolledBack(source, cause) => {
                self.active.replace(source);
                info!("Reopened original camera (device ID: {})", previous);
                Err(SwitchError::SwitchFailed {
                    requested: device_id,
                    restored: previous,
                    cause,
                })
            }
            SwapAttempt::Lost(cause, rollback) => {
                error!("Failed to reopen original camera {}: {}", previous, rollback);
                self.cancel.cancel_with(StopReason::SourceLost);
                Err(SwitchError::SourceLost {
                    requested: device_id,
                    previous,
                    cause,
                    rollback,
                })
            }
        }
    }
}

impl DeviceController {
    /// Wait for an in-flight switch and hold off new ones. Teardown runs under
    /// the returned guard so no source is installed after it.
    pub(crate) async fn quiesce(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.switching.lock().await
    }

    /// Close whatever a switch opened after the run was cancelled.
    async fn discard(&self, attempt: SwapAttempt) -> Result<SwitchOutcome, SwitchError> {
        let opened = match attempt {
            SwapAttempt::Opened(source) | SwapAttempt::RolledBack(source, _) => source,
            SwapAttempt::Lost(..) => return Err(SwitchError::ShuttingDown),
        };
        let closed = task::spawn_blocking(move || {
            let mut source = opened;
            let id = source.handle().id;
            source.close().map(|()| id)
        })
        .await;
        match closed {
            Ok(Ok(id)) => info!(device = id, "switch finished during shutdown, device closed"),
            Ok(Err(err)) => warn!("error closing device opened during shutdown: {err}"),
            Err(join_err) => error!("close job failed: {join_err}"),
        }
        Err(SwitchError::ShuttingDown)
    }
}

enum SwapAttempt {
    Opened(Box<dyn Source>),
    RolledBack(Box<dyn Source>, SourceError),
    Lost(SourceError, SourceError),
}

fn open_source(provider: &dyn SourceProvider, device_id: DeviceId) -> Result<Box<dyn Source>, SourceError> {
    let mut source = provider.create(device_id);
    source.open(device_id)?;
    Ok(source)
}
