//! Durable output of decoded payloads.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Serialized writes to one persistent resource.
///
/// Concurrent callers on the same instance never interleave: each call holds the
/// sink's lock for the whole write.
pub trait Sink: Send + Sync {
    /// Replace the persisted content with `payload`.
    fn write_latest(&self, payload: &str) -> Result<(), SinkError>;

    /// Append `payload` verbatim.
    fn append_entry(&self, payload: &str) -> Result<(), SinkError>;
}

/// How the pipeline records a new payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// The file always holds the latest payload only.
    #[default]
    Overwrite,
    /// Every new payload is appended as its own line.
    Append,
}

impl OutputMode {
    pub fn record(self, sink: &dyn Sink, payload: &str) -> Result<(), SinkError> {
        match self {
            OutputMode::Overwrite => sink.write_latest(payload),
            OutputMode::Append => sink.append_entry(&format!("{payload}\n")),
        }
    }
}

/// Text file sink.
pub struct FileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Sink for FileSink {
    fn write_latest(&self, payload: &str) -> Result<(), SinkError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        write_atomic(&self.path, payload.as_bytes()).map_err(|e| self.io_err(e))?;
        debug!(path = %self.path.display(), len = payload.len(), "payload written");
        Ok(())
    }

    fn append_entry(&self, payload: &str) -> Result<(), SinkError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(payload.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| self.io_err(e))?;
        debug!(path = %self.path.display(), len = payload.len(), "payload appended");
        Ok(())
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_latest_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("code.txt"));
        sink.write_latest("first payload").unwrap();
        sink.write_latest("2nd").unwrap();
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "2nd");
        assert!(!dir.path().join("code.txt.tmp").exists());
    }

    #[test]
    fn append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        fs::write(&path, "initial data\n").unwrap();
        let sink = FileSink::new(&path);
        sink.append_entry("appended data").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "initial data\nappended data");
    }

    #[test]
    fn append_mode_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("log.txt"));
        OutputMode::Append.record(&sink, "a").unwrap();
        OutputMode::Append.record(&sink, "b").unwrap();
        assert_eq!(fs::read_to_string(sink.path()).unwrap(), "a\nb\n");
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("absent").join("code.txt"));
        assert!(matches!(sink.write_latest("x"), Err(SinkError::Io { .. })));
        assert!(matches!(sink.append_entry("x"), Err(SinkError::Io { .. })));
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path().join("log.txt")));

        let workers: Vec<_> = ["alpha", "bravo"]
            .into_iter()
            .map(|name| {
                let sink = sink.clone();
                thread::spawn(move || {
                    let mut written = 0;
                    for i in 0..5 {
                        let line = format!("{name}-marker-{i}-{}\n", "x".repeat(512));
                        sink.append_entry(&line).unwrap();
                        written += line.len();
                    }
                    written
                })
            })
            .collect();
        let expected: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

        let content = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.len(), expected);
        for line in content.lines() {
            assert!(line.starts_with("alpha-marker-") || line.starts_with("bravo-marker-"));
            assert!(line.ends_with(&"x".repeat(512)));
        }
        assert_eq!(content.lines().count(), 10);
    }
}
