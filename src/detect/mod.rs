//! Marker recognition.

mod qr;

use std::time::SystemTime;

use thiserror::Error;

pub use qr::QrDetector;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector initialisation failed: {0}")]
    InitFailure(String),
    #[error("detector used before initialize() or after close()")]
    NotInitialized,
    #[error("image could not be decoded: {0}")]
    DecodeFailure(String),
}

/// Marker recognition over compressed still images.
///
/// "No marker" is `Ok(vec![])`, distinct from an error.
pub trait Detector: Send {
    fn initialize(&mut self) -> Result<(), DetectorError>;

    /// Decode every marker found in one pass over `encoded`.
    fn detect(&mut self, encoded: &[u8]) -> Result<Vec<String>, DetectorError>;

    /// Drop reader state. `detect` fails with [`DetectorError::NotInitialized`]
    /// until the next `initialize`.
    fn close(&mut self);

    fn is_initialized(&self) -> bool;
}

/// One decoded marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    pub payload: String,
    pub observed_at: SystemTime,
}

impl DetectionResult {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            observed_at: SystemTime::now(),
        }
    }
}
