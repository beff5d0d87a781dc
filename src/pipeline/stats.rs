//! Lock-free pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Counters shared by the pipeline tasks. Every increment is mirrored to a
/// `metrics` counter.
#[derive(Default)]
pub struct PipelineStats {
    capture: CachePadded<CaptureCounters>,
    detect: CachePadded<DetectCounters>,
    output: CachePadded<OutputCounters>,
}

#[derive(Default)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    capture_failures: AtomicU64,
}

#[derive(Default)]
struct DetectCounters {
    frames_detected: AtomicU64,
    detect_failures: AtomicU64,
    markers_seen: AtomicU64,
}

#[derive(Default)]
struct OutputCounters {
    duplicates: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub capture_failures: u64,
    pub frames_detected: u64,
    pub detect_failures: u64,
    pub markers_seen: u64,
    pub duplicates: u64,
    pub writes: u64,
    pub write_failures: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_captured(&self) {
        self.capture.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qrscan_frames_captured_total").increment(1);
    }

    pub(crate) fn frame_dropped(&self) {
        self.capture.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qrscan_frames_dropped_total").increment(1);
    }

    pub(crate) fn capture_failed(&self) {
        self.capture.capture_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qrscan_capture_failures_total").increment(1);
    }

    pub(crate) fn frame_detected(&self, markers: usize) {
        self.detect.frames_detected.fetch_add(1, Ordering::Relaxed);
        self.detect
            .markers_seen
            .fetch_add(markers as u64, Ordering::Relaxed);
    }

    pub(crate) fn detect_failed(&self) {
        self.detect.detect_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qrscan_detect_failures_total").increment(1);
    }

    pub(crate) fn duplicate(&self) {
        self.output.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn written(&self) {
        self.output.writes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qrscan_markers_written_total").increment(1);
    }

    pub(crate) fn write_failed(&self) {
        self.output.write_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("qrscan_write_failures_total").increment(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.capture.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.capture.frames_dropped.load(Ordering::Relaxed),
            capture_failures: self.capture.capture_failures.load(Ordering::Relaxed),
            frames_detected: self.detect.frames_detected.load(Ordering::Relaxed),
            detect_failures: self.detect.detect_failures.load(Ordering::Relaxed),
            markers_seen: self.detect.markers_seen.load(Ordering::Relaxed),
            duplicates: self.output.duplicates.load(Ordering::Relaxed),
            writes: self.output.writes.load(Ordering::Relaxed),
            write_failures: self.output.write_failures.load(Ordering::Relaxed),
        }
    }
}
