use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::DeviceId;

/// One captured raster image.
///
/// A frame is owned by exactly one pipeline stage at a time. It is not `Clone`:
/// handing a frame to a second consumer goes through [`Frame::duplicate`], which
/// copies the pixels into a new, independently released frame.
pub struct Frame {
    data: Bytes,
    meta: FrameMetadata,

    /// Capture timestamp for latency tracking
    timestamp: Instant,

    _lease: FrameLease,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub device_id: DeviceId,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv,
    Gray8,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed raw formats, `None` for compressed ones.
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv => Some(2),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Mjpeg => None,
        }
    }
}

impl Frame {
    /// Wrap captured bytes in a frame registered with `ledger`.
    pub fn new(data: Bytes, meta: FrameMetadata, ledger: &FrameLedger) -> Self {
        Self {
            data,
            meta,
            timestamp: Instant::now(),
            _lease: ledger.lease(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn captured_at(&self) -> Instant {
        self.timestamp
    }

    /// Deep copy suitable for transfer to another stage.
    pub fn duplicate(&self) -> Frame {
        Frame {
            data: Bytes::copy_from_slice(&self.data),
            meta: self.meta.clone(),
            timestamp: self.timestamp,
            _lease: self._lease.ledger.lease(),
        }
    }

    /// Release the frame. Consumes it, so a released frame cannot be read again.
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Accounting for live frames.
///
/// Every [`Frame`] holds a lease on the ledger it was created from; the lease is
/// returned when the frame is dropped. `outstanding() == 0` therefore means every
/// frame ever captured or copied has been released.
#[derive(Clone, Default)]
pub struct FrameLedger {
    inner: Arc<LedgerCounters>,
}

#[derive(Default)]
struct LedgerCounters {
    live: AtomicUsize,
    allocated: AtomicU64,
}

impl FrameLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames currently alive.
    pub fn outstanding(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Frames created over the ledger's lifetime, copies included.
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    fn lease(&self) -> FrameLease {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        FrameLease {
            ledger: self.clone(),
        }
    }
}

impl fmt::Debug for FrameLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLedger")
            .field("outstanding", &self.outstanding())
            .field("allocated", &self.allocated())
            .finish()
    }
}

struct FrameLease {
    ledger: FrameLedger,
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        self.ledger.inner.live.fetch_sub(1, Ordering::AcqRel);
    }
}
