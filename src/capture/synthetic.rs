//! Deterministic generated frames.
//!
//! Frames are a diagonal gradient with a checkerboard block in the centre, shifted
//! by the device id and sequence number so consecutive frames differ. Device
//! [`UNAVAILABLE_DEVICE`] always refuses to open, which lets callers exercise the
//! failure paths of device selection.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use super::frame::{Frame, FrameLedger, FrameMetadata, PixelFormat};
use super::source::{DeviceHandle, DeviceId, Source, SourceError};
use crate::CaptureConfig;

/// Device id the synthetic backend never opens.
pub const UNAVAILABLE_DEVICE: DeviceId = 99;

pub struct SyntheticSource {
    device_id: DeviceId,
    open: bool,
    width: u32,
    height: u32,
    frame_interval: Option<Duration>,
    sequence: u64,
    empty_every: Option<u64>,
    ledger: FrameLedger,
}

impl SyntheticSource {
    pub fn new(config: &CaptureConfig, ledger: FrameLedger) -> Self {
        Self {
            device_id: config.device_id,
            open: false,
            width: config.width.max(1),
            height: config.height.max(1),
            frame_interval: config.frame_interval(),
            sequence: 0,
            empty_every: None,
            ledger,
        }
    }

    /// Report every `n`th capture as [`SourceError::EmptyFrame`].
    pub fn with_empty_every(mut self, n: u64) -> Self {
        self.empty_every = (n > 0).then_some(n);
        self
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = self.sequence as usize + self.device_id as usize * 37;
        let block = (w.min(h) / 4).max(1);
        let (cx, cy) = (w / 2, h / 2);
        let cell = (block / 5).max(1);

        let mut pixels = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                let in_block = x + block / 2 >= cx
                    && x < cx + block / 2
                    && y + block / 2 >= cy
                    && y < cy + block / 2;
                let value = if in_block {
                    if (x / cell + y / cell) % 2 == 0 {
                        0
                    } else {
                        255
                    }
                } else {
                    ((x + y + shift) % 256) as u8
                };
                pixels.extend_from_slice(&[value, value, value]);
            }
        }
        pixels
    }
}

impl Source for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&mut self, device_id: DeviceId) -> Result<(), SourceError> {
        if self.open {
            return Err(SourceError::AlreadyOpen);
        }
        self.device_id = device_id;
        if device_id == UNAVAILABLE_DEVICE {
            return Err(SourceError::DeviceUnavailable {
                id: device_id,
                reason: "device not found".into(),
            });
        }
        self.open = true;
        debug!(device = device_id, "synthetic source opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        self.open = false;
        debug!(device = self.device_id, "synthetic source closed");
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        if let Some(interval) = self.frame_interval {
            std::thread::sleep(interval);
        }

        self.sequence += 1;
        if let Some(n) = self.empty_every {
            if self.sequence % n == 0 {
                return Err(SourceError::EmptyFrame);
            }
        }

        let meta = FrameMetadata {
            sequence: self.sequence,
            device_id: self.device_id,
            width: self.width,
            height: self.height,
            stride: self.width * 3,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        };
        Ok(Frame::new(Bytes::from(self.render()), meta, &self.ledger))
    }

    fn set_device_id(&mut self, device_id: DeviceId) {
        self.device_id = device_id;
    }

    fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.device_id,
            is_open: self.open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceBackend;

    fn source() -> SyntheticSource {
        let config = CaptureConfig {
            backend: SourceBackend::Synthetic,
            width: 40,
            height: 30,
            fps: 0,
            ..CaptureConfig::default()
        };
        SyntheticSource::new(&config, FrameLedger::new())
    }

    #[test]
    fn open_twice_is_rejected() {
        let mut source = source();
        source.open(0).unwrap();
        assert!(matches!(source.open(0), Err(SourceError::AlreadyOpen)));
    }

    #[test]
    fn close_without_open_is_rejected() {
        let mut source = source();
        assert!(matches!(source.close(), Err(SourceError::NotOpen)));
    }

    #[test]
    fn open_then_close_reports_closed() {
        let mut source = source();
        source.open(1).unwrap();
        source.close().unwrap();
        assert_eq!(source.handle(), DeviceHandle { id: 1, is_open: false });
        assert!(matches!(source.close(), Err(SourceError::NotOpen)));
    }

    #[test]
    fn reserved_device_never_opens() {
        let mut source = source();
        let err = source.open(UNAVAILABLE_DEVICE).unwrap_err();
        assert!(matches!(err, SourceError::DeviceUnavailable { id: 99, .. }));
        assert!(!source.is_open());
        source.open(0).unwrap();
    }

    #[test]
    fn capture_requires_open() {
        let mut source = source();
        assert!(matches!(source.capture_frame(), Err(SourceError::NotOpen)));
    }

    #[test]
    fn frames_match_configured_geometry() {
        let mut source = source();
        source.open(0).unwrap();
        let first = source.capture_frame().unwrap();
        let second = source.capture_frame().unwrap();
        assert_eq!(first.meta().width, 40);
        assert_eq!(first.meta().height, 30);
        assert_eq!(first.data().len(), 40 * 30 * 3);
        assert_eq!(second.meta().sequence, first.meta().sequence + 1);
        assert_ne!(first.data(), second.data());
    }

    #[test]
    fn empty_frames_are_injected() {
        let mut source = source().with_empty_every(2);
        source.open(0).unwrap();
        assert!(source.capture_frame().is_ok());
        assert!(matches!(source.capture_frame(), Err(SourceError::EmptyFrame)));
        assert!(source.capture_frame().is_ok());
    }
}
