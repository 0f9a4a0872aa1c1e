use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Raises the internal stop request of a running worker.
///
/// Signalling is non-blocking and idempotent; the tick loop observes it before the
/// next tick.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

/// Per-tick execution context handed to middlewares and the action.
///
/// Cheap to clone; every clone observes the same cancellation token.
#[derive(Debug, Clone)]
pub struct TickContext {
    worker: Arc<str>,
    sequence: u64,
    fired_at: DateTime<Utc>,
    cancel: CancellationToken,
    stop: StopHandle,
}

impl TickContext {
    pub(crate) fn new(
        worker: Arc<str>,
        sequence: u64,
        cancel: CancellationToken,
        stop: StopHandle,
    ) -> Self {
        Self {
            worker,
            sequence,
            fired_at: Utc::now(),
            cancel,
            stop,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker
    }

    /// 0 for the run-from-start cycle, then 1, 2, … per tick.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn fired_at(&self) -> DateTime<Utc> {
        self.fired_at
    }

    /// Token cancelled on timeout, lock loss, worker shutdown, or when the tick ends.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Ask the worker to stop after this tick.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }
}
