//! Graceful shutdown signal handling.
//!
//! [`SigDown`] listens for SIGTERM and SIGINT and cancels a shared
//! [`CancellationToken`] so the supervisor and every chain worker can wind
//! down in step. Unlike a single HTTP listener, this binary tears down one
//! task per chain plus a persistence writer, so knowing which signal asked
//! for the shutdown is worth keeping around for the final log line rather
//! than discarding it the moment the token fires.

use std::sync::{Arc, OnceLock};

use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Which signal triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Term,
    Int,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Term => "SIGTERM",
            ShutdownSignal::Int => "SIGINT",
        }
    }
}

pub struct SigDown {
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
    reason: Arc<OnceLock<ShutdownSignal>>,
}

impl SigDown {
    /// Registers the signal handlers. Returns an error if registration fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let inner = CancellationToken::new();
        let outer = inner.clone();
        let task_tracker = TaskTracker::new();
        let reason = Arc::new(OnceLock::new());
        let reason_writer = reason.clone();

        task_tracker.spawn(async move {
            let signal = tokio::select! {
                _ = sigterm.recv() => ShutdownSignal::Term,
                _ = sigint.recv() => ShutdownSignal::Int,
            };
            let _ = reason_writer.set(signal);
            tracing::info!(signal = signal.as_str(), "received shutdown signal");
            inner.cancel();
        });
        task_tracker.close();

        Ok(Self {
            task_tracker,
            cancellation_token: outer,
            reason,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// The signal that triggered shutdown, once one has arrived.
    pub fn reason(&self) -> Option<ShutdownSignal> {
        self.reason.get().copied()
    }

    /// Waits for a shutdown signal and ensures the signal handler task completes.
    pub async fn recv(&self) {
        self.cancellation_token.cancelled().await;
        self.task_tracker.wait().await;
    }
}
