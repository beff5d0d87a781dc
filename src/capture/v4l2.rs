//! V4L2 capture through memory-mapped buffers

use std::io;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, FrameLedger, FrameMetadata, PixelFormat};
use super::source::{DeviceHandle, DeviceId, Source, SourceError};
use crate::CaptureConfig;

/// Hardware-backed source for `/dev/video{id}`
pub struct V4l2Source {
    config: CaptureConfig,
    device_id: DeviceId,
    sequence: u64,
    ledger: FrameLedger,
    session: Option<Session>,
}

/// Resources held while the device is open. The stream is declared first so it
/// is unmapped before the device handle closes.
struct Session {
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
}

impl V4l2Source {
    pub fn new(config: CaptureConfig, ledger: FrameLedger) -> Self {
        Self {
            device_id: config.device_id,
            config,
            sequence: 0,
            ledger,
            session: None,
        }
    }

    fn start_session(&self, device_id: DeviceId) -> Result<Session, SourceError> {
        let unavailable = |reason: String| SourceError::DeviceUnavailable {
            id: device_id,
            reason,
        };

        let device = Device::new(device_id as usize).map_err(|e| unavailable(e.to_string()))?;

        let caps = device.query_caps().map_err(|e| unavailable(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(unavailable("device doesn't support video capture".into()));
        }

        // MJPEG keeps the per-frame copy small; the driver may still pick another format
        let mut fmt = device.format().map_err(|e| unavailable(e.to_string()))?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = FourCC::new(b"MJPG");
        let fmt = device
            .set_format(&fmt)
            .map_err(|e| unavailable(e.to_string()))?;

        let format = pixel_format(fmt.fourcc)
            .ok_or_else(|| unavailable(format!("unsupported pixel format {}", fmt.fourcc)))?;

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, self.config.buffer_count)
                .map_err(|e| unavailable(e.to_string()))?;
        stream.set_timeout(self.config.capture_timeout());

        info!(
            device = device_id,
            width = fmt.width,
            height = fmt.height,
            ?format,
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );

        Ok(Session {
            stream,
            _device: device,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format,
        })
    }
}

impl Source for V4l2Source {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    #[instrument(skip(self))]
    fn open(&mut self, device_id: DeviceId) -> Result<(), SourceError> {
        if self.session.is_some() {
            return Err(SourceError::AlreadyOpen);
        }
        self.device_id = device_id;
        self.session = Some(self.start_session(device_id)?);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        match self.session.take() {
            Some(session) => {
                drop(session);
                debug!(device = self.device_id, "capture stream stopped");
                Ok(())
            }
            None => Err(SourceError::NotOpen),
        }
    }

    fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        let session = self.session.as_mut().ok_or(SourceError::NotOpen)?;

        let (buf, meta) = session.stream.next().map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => SourceError::ReadFailure("timed out waiting for frame".into()),
            _ => SourceError::ReadFailure(e.to_string()),
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Err(SourceError::EmptyFrame);
        }
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        let frame_meta = FrameMetadata {
            sequence: self.sequence,
            device_id: self.device_id,
            width: session.width,
            height: session.height,
            stride: session.stride,
            format: session.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        };

        Ok(Frame::new(data, frame_meta, &self.ledger))
    }

    fn set_device_id(&mut self, device_id: DeviceId) {
        self.device_id = device_id;
    }

    fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.device_id,
            is_open: self.session.is_some(),
        }
    }
}

fn pixel_format(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"GREY" => Some(PixelFormat::Gray8),
        _ => None,
    }
}

/// A capture-capable device node found while probing.
#[derive(Debug, Clone)]
pub struct ProbedDevice {
    pub id: DeviceId,
    pub card: String,
    pub format: PixelFormat,
}

/// List capture devices `/dev/video0` through `/dev/video9`, the ids reachable
/// from the number keys. MJPEG is reported over YUYV when a device offers both.
pub fn probe_devices() -> Vec<ProbedDevice> {
    info!("Probing capture devices...");

    let mut found = Vec::new();
    for id in 0..10u32 {
        let path = format!("/dev/video{}", id);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        let mut best = None;
        for fmt in formats {
            match pixel_format(fmt.fourcc) {
                Some(PixelFormat::Mjpeg) => {
                    best = Some(PixelFormat::Mjpeg);
                    break;
                }
                Some(other) if best.is_none() => best = Some(other),
                _ => {}
            }
        }
        if let Some(format) = best {
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            found.push(ProbedDevice {
                id,
                card: caps.card,
                format,
            });
        }
    }
    found
}
