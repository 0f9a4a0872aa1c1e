use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, warn};

use crate::{lock::DistributedLock, traits::LockStore};

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Polls a lock and cancels `target` the first time ownership is observed lost.
///
/// The poll loop ends on that cancellation, when `target` is cancelled by anyone
/// else, or when the watcher is dropped. It never re-acquires.
pub struct LockWatcher {
    task: Option<JoinHandle<()>>,
}

impl LockWatcher {
    pub fn spawn<S: LockStore>(
        lock: Arc<DistributedLock<S>>,
        target: CancellationToken,
        every: Duration,
    ) -> Self {
        let span = tracing::info_span!("lock_watcher", key = %lock.key());
        let task = tokio::spawn(watch(lock, target, every).instrument(span));
        Self { task: Some(task) }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Let the poll loop outlive this handle; it still ends with `target`.
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for LockWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn watch<S: LockStore>(
    lock: Arc<DistributedLock<S>>,
    target: CancellationToken,
    every: Duration,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = target.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if !lock.is_locked().await {
            warn!("Lock ownership lost, cancelling guarded execution");
            target.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockStore;

    const TTL: Duration = Duration::from_secs(3);

    async fn held_lock(store: &MemoryLockStore) -> Arc<DistributedLock<MemoryLockStore>> {
        let lock = Arc::new(DistributedLock::new(store.clone(), "watched", TTL).unwrap());
        lock.acquire(&CancellationToken::new()).await.unwrap();
        lock
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_target_when_lock_is_lost() {
        let store = MemoryLockStore::new();
        let lock = held_lock(&store).await;
        let target = CancellationToken::new();
        let watcher = LockWatcher::spawn(Arc::clone(&lock), target.clone(), DEFAULT_WATCH_INTERVAL);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!target.is_cancelled());

        store.overwrite(lock.key(), "intruder", TTL);
        tokio::time::timeout(Duration::from_secs(2), target.cancelled())
            .await
            .expect("watcher should cancel the target");

        tokio::task::yield_now().await;
        assert!(watcher.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_target_is_cancelled_elsewhere() {
        let store = MemoryLockStore::new();
        let lock = held_lock(&store).await;
        let target = CancellationToken::new();
        let watcher = LockWatcher::spawn(lock, target.clone(), DEFAULT_WATCH_INTERVAL);

        target.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(watcher.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_polling() {
        let store = MemoryLockStore::new();
        let lock = held_lock(&store).await;
        let target = CancellationToken::new();

        drop(LockWatcher::spawn(Arc::clone(&lock), target.clone(), DEFAULT_WATCH_INTERVAL));
        store.remove(lock.key());
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!target.is_cancelled());
    }
}
