use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;

/// Why a pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator interrupt (SIGINT / SIGTERM).
    Interrupted,
    /// Stop stimulus or programmatic cancellation.
    Requested,
    /// A device switch failed and the previous device could not be reopened.
    SourceLost,
    /// The detector was lost to a panic in a detection job.
    DetectorLost,
}

impl StopReason {
    /// Whether the stop was asked for rather than forced by a failure.
    pub fn is_intentional(self) -> bool {
        matches!(self, StopReason::Interrupted | StopReason::Requested)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Interrupted => "interrupted",
            StopReason::Requested => "stop requested",
            StopReason::SourceLost => "no capture device could be opened",
            StopReason::DetectorLost => "detector lost",
        };
        f.write_str(text)
    }
}

/// One-way, idempotent, broadcast cancellation.
///
/// Clones observe the same signal. Once cancelled a token never resets; the
/// first [`StopReason`] recorded is kept.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    reason: OnceLock<StopReason>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                reason: OnceLock::new(),
            }),
        }
    }

    /// Cancel with [`StopReason::Requested`].
    pub fn cancel(&self) -> bool {
        self.cancel_with(StopReason::Requested)
    }

    /// Returns `true` for the call that actually cancelled.
    pub fn cancel_with(&self, reason: StopReason) -> bool {
        let _ = self.inner.reason.set(reason);
        self.inner.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.inner.reason.get().copied()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives in `inner`, so this can only end by observing `true`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
