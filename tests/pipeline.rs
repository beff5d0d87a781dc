use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qrscan::capture::{
    DeviceHandle, DeviceId, Frame, FrameLedger, Source, SourceBackend, SourceError,
    SourceProvider, SyntheticSource,
};
use qrscan::detect::{Detector, DetectorError};
use qrscan::pipeline::{
    CancelToken, PipelineError, PipelineHandle, StopReason, SwitchError, SwitchOutcome,
};
use qrscan::sink::SinkError;
use qrscan::{
    CaptureConfig, FileSink, OutputMode, Pipeline, PipelineSettings, PipelineState, Sink, Stimulus,
};

const UNAVAILABLE: DeviceId = 99;

/// Synthetic sources that can be made to refuse opening, with a count of
/// sources currently open.
struct TrackedProvider {
    config: CaptureConfig,
    ledger: FrameLedger,
    empty_every: u64,
    slow_open: Option<(DeviceId, Duration)>,
    broken: Arc<AtomicBool>,
    open: Arc<AtomicUsize>,
}

impl TrackedProvider {
    fn new() -> Self {
        Self {
            config: CaptureConfig {
                backend: SourceBackend::Synthetic,
                width: 32,
                height: 24,
                fps: 200,
                ..CaptureConfig::default()
            },
            ledger: FrameLedger::new(),
            empty_every: 0,
            slow_open: None,
            broken: Arc::new(AtomicBool::new(false)),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_empty_every(mut self, n: u64) -> Self {
        self.empty_every = n;
        self
    }

    fn with_slow_open(mut self, device_id: DeviceId, delay: Duration) -> Self {
        self.slow_open = Some((device_id, delay));
        self
    }
}

impl SourceProvider for TrackedProvider {
    fn create(&self, device_id: DeviceId) -> Box<dyn Source> {
        let inner = SyntheticSource::new(&self.config, self.ledger.clone())
            .with_empty_every(self.empty_every);
        Box::new(TrackedSource {
            inner: Box::new(inner),
            open_delay: self
                .slow_open
                .and_then(|(id, delay)| (id == device_id).then_some(delay)),
            broken: self.broken.clone(),
            open: self.open.clone(),
        })
    }

    fn ledger(&self) -> &FrameLedger {
        &self.ledger
    }
}

struct TrackedSource {
    inner: Box<dyn Source>,
    open_delay: Option<Duration>,
    broken: Arc<AtomicBool>,
    open: Arc<AtomicUsize>,
}

impl Source for TrackedSource {
    fn name(&self) -> &'static str {
        "tracked"
    }

    fn open(&mut self, device_id: DeviceId) -> Result<(), SourceError> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        if self.broken.load(Ordering::SeqCst) {
            self.inner.set_device_id(device_id);
            return Err(SourceError::DeviceUnavailable {
                id: device_id,
                reason: "unplugged".into(),
            });
        }
        self.inner.open(device_id)?;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SourceError> {
        self.inner.close()?;
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        self.inner.capture_frame()
    }

    fn set_device_id(&mut self, device_id: DeviceId) {
        self.inner.set_device_id(device_id)
    }

    fn handle(&self) -> DeviceHandle {
        self.inner.handle()
    }
}

enum Step {
    Markers(Vec<String>),
    Misread,
}

/// Plays one scripted step per frame, then finds nothing.
#[derive(Default)]
struct ScriptedDetector {
    script: VecDeque<Step>,
    delay: Duration,
    fail_init: bool,
    initialized: bool,
    closed: Arc<AtomicBool>,
}

impl ScriptedDetector {
    fn with_script(payloads: &[&str]) -> Self {
        Self::with_steps(payloads.iter().map(|p| Step::Markers(vec![p.to_string()])))
    }

    fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Detector for ScriptedDetector {
    fn initialize(&mut self) -> Result<(), DetectorError> {
        if self.fail_init {
            return Err(DetectorError::InitFailure("scripted".into()));
        }
        self.initialized = true;
        Ok(())
    }

    fn detect(&mut self, encoded: &[u8]) -> Result<Vec<String>, DetectorError> {
        if !self.initialized {
            return Err(DetectorError::NotInitialized);
        }
        assert!(!encoded.is_empty());
        std::thread::sleep(self.delay);
        match self.script.pop_front() {
            Some(Step::Markers(payloads)) => Ok(payloads),
            Some(Step::Misread) => Err(DetectorError::DecodeFailure("scripted misread".into())),
            None => Ok(Vec::new()),
        }
    }

    fn close(&mut self) {
        self.initialized = false;
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// In-memory sink whose first `failures` writes fail.
struct FlakySink {
    failures: AtomicUsize,
    written: Mutex<Vec<String>>,
}

impl FlakySink {
    fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            written: Mutex::new(Vec::new()),
        }
    }
}

impl Sink for FlakySink {
    fn write_latest(&self, payload: &str) -> Result<(), SinkError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Io {
                path: PathBuf::from("flaky"),
                source: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        self.written.lock().unwrap().push(payload.to_string());
        Ok(())
    }

    fn append_entry(&self, payload: &str) -> Result<(), SinkError> {
        self.write_latest(payload)
    }
}

fn settings(mode: OutputMode) -> PipelineSettings {
    PipelineSettings {
        device_id: 0,
        queue_capacity: 2,
        result_capacity: 4,
        capture_backoff: Duration::from_millis(5),
        drain_timeout: Duration::from_secs(5),
        output_mode: mode,
        preview: false,
    }
}

async fn wait_until(handle: &PipelineHandle, done: impl Fn(&PipelineHandle) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(handle) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_drains_and_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TrackedProvider::new());
    let open = provider.open.clone();
    let detector = ScriptedDetector {
        delay: Duration::from_millis(20),
        ..ScriptedDetector::default()
    };
    let detector_closed = detector.closed.clone();

    let running = Pipeline::new(
        provider.clone(),
        Box::new(detector),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();
    assert_eq!(handle.state(), PipelineState::Running);
    assert_eq!(open.load(Ordering::SeqCst), 1);

    wait_until(&handle, |h| h.stats().frames_captured >= 10).await;
    handle.dispatch(Stimulus::Stop).await.unwrap();
    wait_until(&handle, |h| h.state() == PipelineState::Draining).await;

    let report = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .expect("pipeline did not drain");

    assert_eq!(report.reason, StopReason::Requested);
    assert_eq!(report.release_failures, 0);
    assert_eq!(handle.state(), PipelineState::Stopped);
    assert_eq!(handle.frames_outstanding(), 0);
    assert_eq!(provider.ledger().outstanding(), 0);
    assert!(!handle.device().is_open);
    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert!(detector_closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_markers_are_written_once_per_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("codes.txt");

    let running = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::with_script(&["a", "a", "a", "b", "b", "a"])),
        Arc::new(FileSink::new(&path)),
        settings(OutputMode::Append),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    wait_until(&handle, |h| h.stats().writes == 3 && h.stats().duplicates == 3).await;
    assert_eq!(handle.last_marker().as_deref(), Some("a"));
    handle.stop();

    let report = running.run_to_completion().await.unwrap();
    assert_eq!(report.stats.writes, 3);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\na\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overwrite_mode_keeps_only_the_latest_marker() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("code.txt");

    let running = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::with_script(&["first", "", "second"])),
        Arc::new(FileSink::new(&path)),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    wait_until(&handle, |h| h.stats().writes == 2).await;
    handle.stop();
    running.wait().await;

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_fails_on_unavailable_device() {
    let dir = tempfile::tempdir().unwrap();
    let result = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        PipelineSettings {
            device_id: UNAVAILABLE,
            ..settings(OutputMode::Overwrite)
        },
    )
    .start(CancelToken::new())
    .await;

    assert!(matches!(
        result,
        Err(PipelineError::SourceOpen { device: UNAVAILABLE, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detector_init_failure_releases_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TrackedProvider::new());
    let open = provider.open.clone();

    let result = Pipeline::new(
        provider,
        Box::new(ScriptedDetector {
            fail_init: true,
            ..ScriptedDetector::default()
        }),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await;

    assert!(matches!(result, Err(PipelineError::DetectorInit(_))));
    assert_eq!(open.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn switch_to_unavailable_device_keeps_the_old_one() {
    let dir = tempfile::tempdir().unwrap();
    let running = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    let err = handle.switch_device(UNAVAILABLE).await.unwrap_err();
    assert!(matches!(err, SwitchError::SwitchFailed { requested: UNAVAILABLE, restored: 0, .. }));
    assert_eq!(handle.device(), DeviceHandle { id: 0, is_open: true });
    assert_eq!(handle.state(), PipelineState::Running);

    let captured = handle.stats().frames_captured;
    wait_until(&handle, |h| h.stats().frames_captured > captured).await;

    assert_eq!(
        handle.switch_device(2).await.unwrap(),
        SwitchOutcome::Switched { from: 0, to: 2 }
    );
    handle.dispatch(Stimulus::SelectDevice(2)).await.unwrap();
    assert_eq!(handle.device(), DeviceHandle { id: 2, is_open: true });

    handle.stop();
    let report = running.wait().await;
    assert_eq!(report.reason, StopReason::Requested);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_rollback_stops_with_source_lost() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TrackedProvider::new());
    let broken = provider.broken.clone();

    let running = Pipeline::new(
        provider.clone(),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    broken.store(true, Ordering::SeqCst);
    let err = handle.switch_device(4).await.unwrap_err();
    assert!(matches!(err, SwitchError::SourceLost { requested: 4, previous: 0, .. }));
    assert!(handle.is_stopping());
    wait_until(&handle, |h| h.state() == PipelineState::Draining).await;

    let result = tokio::time::timeout(Duration::from_secs(5), running.run_to_completion())
        .await
        .expect("pipeline did not drain");
    assert!(matches!(result, Err(PipelineError::Aborted(StopReason::SourceLost))));
    assert_eq!(provider.ledger().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preview_frames_are_offered_when_attached() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TrackedProvider::new());
    let running = Pipeline::new(
        provider.clone(),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        PipelineSettings {
            preview: true,
            ..settings(OutputMode::Overwrite)
        },
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();
    assert!(handle.has_display());

    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(frame) = handle.next_display_frame() {
                break frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!((frame.meta().width, frame.meta().height), (32, 24));
    frame.release();

    handle.stop();
    running.wait().await;
    assert_eq!(provider.ledger().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_before_start_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(cancel)
    .await;
    assert!(matches!(result, Err(PipelineError::CancelledBeforeStart)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_appends_do_not_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    let sink = Arc::new(FileSink::new(&path));

    let writers: Vec<_> = ["left", "right-hand"]
        .into_iter()
        .map(|tag| {
            let sink = sink.clone();
            tokio::task::spawn_blocking(move || {
                for i in 0..5 {
                    sink.append_entry(&format!("{tag}-{i}\n")).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let expected: usize = ["left", "right-hand"]
        .iter()
        .map(|tag| (0..5).map(|i| format!("{tag}-{i}\n").len()).sum::<usize>())
        .sum();
    assert_eq!(content.len(), expected);
    assert!(content
        .lines()
        .all(|line| line.starts_with("left-") || line.starts_with("right-hand-")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn switch_overlapping_shutdown_leaves_no_device_open() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TrackedProvider::new().with_slow_open(5, Duration::from_millis(400)));
    let open = provider.open.clone();

    let running = Pipeline::new(
        provider.clone(),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    let switch = tokio::spawn({
        let handle = handle.clone();
        async move { handle.switch_device(5).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();

    let report = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .expect("pipeline did not drain");
    let switched = switch.await.unwrap();

    assert_eq!(report.reason, StopReason::Requested);
    assert!(matches!(switched, Err(SwitchError::ShuttingDown)));
    assert_eq!(handle.state(), PipelineState::Stopped);
    assert_eq!(open.load(Ordering::SeqCst), 0);
    assert!(!handle.device().is_open);
    assert_eq!(provider.ledger().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_detection_queue_drops_new_frames() {
    let dir = tempfile::tempdir().unwrap();
    let detector = ScriptedDetector {
        delay: Duration::from_millis(50),
        ..ScriptedDetector::default()
    };

    let running = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(detector),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        PipelineSettings {
            queue_capacity: 1,
            ..settings(OutputMode::Overwrite)
        },
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    wait_until(&handle, |h| h.stats().frames_dropped > 0).await;
    let captured = handle.stats().frames_captured;
    wait_until(&handle, |h| h.stats().frames_captured > captured + 5).await;
    assert!(handle.stats().frames_detected < handle.stats().frames_captured);

    handle.stop();
    let report = running.wait().await;
    assert!(report.stats.frames_dropped > 0);
    assert_eq!(handle.frames_outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_frames_are_retried_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(TrackedProvider::new().with_empty_every(3));

    let running = Pipeline::new(
        provider.clone(),
        Box::new(ScriptedDetector::default()),
        Arc::new(FileSink::new(dir.path().join("code.txt"))),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    wait_until(&handle, |h| h.stats().capture_failures >= 3).await;
    let captured = handle.stats().frames_captured;
    wait_until(&handle, |h| h.stats().frames_captured > captured).await;
    assert_eq!(handle.state(), PipelineState::Running);

    handle.stop();
    let report = running.run_to_completion().await.unwrap();
    assert!(report.stats.capture_failures >= 3);
    assert_eq!(provider.ledger().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn misreads_do_not_stop_detection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("code.txt");

    let running = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::with_steps([
            Step::Misread,
            Step::Misread,
            Step::Markers(vec!["after-misread".into()]),
        ])),
        Arc::new(FileSink::new(&path)),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    wait_until(&handle, |h| h.stats().writes == 1).await;
    assert!(handle.stats().detect_failures >= 2);

    handle.stop();
    running.run_to_completion().await.unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "after-misread");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_write_is_retried_on_next_detection() {
    let sink = Arc::new(FlakySink::failing(1));

    let running = Pipeline::new(
        Arc::new(TrackedProvider::new()),
        Box::new(ScriptedDetector::with_script(&["x", "x", "y"])),
        sink.clone(),
        settings(OutputMode::Overwrite),
    )
    .start(CancelToken::new())
    .await
    .unwrap();
    let handle = running.handle();

    wait_until(&handle, |h| h.stats().writes == 2).await;
    let stats = handle.stats();
    assert_eq!(stats.write_failures, 1);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(handle.state(), PipelineState::Running);

    handle.stop();
    running.wait().await;
    assert_eq!(*sink.written.lock().unwrap(), ["x", "y"]);
}
