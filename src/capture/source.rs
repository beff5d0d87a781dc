//! Capture device contract and backend selection.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::frame::{Frame, FrameLedger};
use super::synthetic::SyntheticSource;
use crate::CaptureConfig;

/// Small integer naming a capture device (`/dev/video{id}` for the hardware backend).
pub type DeviceId = u32;

/// The binding between a [`Source`] and a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub is_open: bool,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("capture device is already open")]
    AlreadyOpen,
    #[error("capture device is not open")]
    NotOpen,
    #[error("capture device {id} is unavailable: {reason}")]
    DeviceUnavailable { id: DeviceId, reason: String },
    #[error("frame read failed: {0}")]
    ReadFailure(String),
    #[error("captured frame is empty")]
    EmptyFrame,
    #[error("{0} capture backend is not compiled into this build")]
    BackendMissing(&'static str),
}

impl SourceError {
    /// Failures a capture loop is expected to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::ReadFailure(_) | SourceError::EmptyFrame | SourceError::NotOpen
        )
    }
}

/// A video capture device.
///
/// Lifecycle misuse is reported, never ignored: `open` on an open source fails
/// with [`SourceError::AlreadyOpen`] and `close` on a closed one with
/// [`SourceError::NotOpen`]. Callers consult [`Source::is_open`] first.
pub trait Source: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Acquire `device_id`. The id becomes the source's current id even when the
    /// open fails.
    fn open(&mut self, device_id: DeviceId) -> Result<(), SourceError>;

    fn close(&mut self) -> Result<(), SourceError>;

    /// Read one frame. Bounded in time; a failure here is recoverable.
    fn capture_frame(&mut self) -> Result<Frame, SourceError>;

    /// Select the device used by the next [`Source::open_selected`].
    fn set_device_id(&mut self, device_id: DeviceId);

    fn handle(&self) -> DeviceHandle;

    fn is_open(&self) -> bool {
        self.handle().is_open
    }

    fn open_selected(&mut self) -> Result<(), SourceError> {
        let id = self.handle().id;
        self.open(id)
    }
}

/// Which capture backend to build sources with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    /// V4L2 devices (`v4l2` feature).
    Hardware,
    /// Deterministic generated frames.
    Synthetic,
}

/// Creates unopened sources bound to a device id.
pub trait SourceProvider: Send + Sync {
    fn create(&self, device_id: DeviceId) -> Box<dyn Source>;

    /// Ledger every frame from this provider's sources is registered with.
    fn ledger(&self) -> &FrameLedger;
}

/// The one place the capture backend is chosen.
pub struct SourceFactory {
    backend: SourceBackend,
    config: CaptureConfig,
    ledger: FrameLedger,
}

impl SourceFactory {
    pub fn new(config: CaptureConfig) -> Result<Self, SourceError> {
        let backend = config.backend;
        if backend == SourceBackend::Hardware && !cfg!(feature = "v4l2") {
            return Err(SourceError::BackendMissing("v4l2"));
        }
        info!(?backend, width = config.width, height = config.height, fps = config.fps, "capture backend selected");
        Ok(Self {
            backend,
            config,
            ledger: FrameLedger::new(),
        })
    }

    pub fn backend(&self) -> SourceBackend {
        self.backend
    }
}

impl SourceProvider for SourceFactory {
    fn create(&self, device_id: DeviceId) -> Box<dyn Source> {
        let mut source: Box<dyn Source> = match self.backend {
            SourceBackend::Synthetic => {
                Box::new(SyntheticSource::new(&self.config, self.ledger.clone()))
            }
            #[cfg(feature = "v4l2")]
            SourceBackend::Hardware => Box::new(super::v4l2::V4l2Source::new(
                self.config.clone(),
                self.ledger.clone(),
            )),
            // `new` rejects the hardware backend in builds without it; this arm
            // only keeps the match exhaustive.
            #[cfg(not(feature = "v4l2"))]
            SourceBackend::Hardware => {
                Box::new(SyntheticSource::new(&self.config, self.ledger.clone()))
            }
        };
        source.set_device_id(device_id);
        source
    }

    fn ledger(&self) -> &FrameLedger {
        &self.ledger
    }
}
