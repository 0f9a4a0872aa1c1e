//! Before/after hooks around a worker's action.
//!
//! A before-hook failing with [`ErrorKind::Contention`](crate::ErrorKind::Contention)
//! skips the tick: no further before-hooks, no action, no after-hooks. This is how
//! [`AcquireLock`] and [`ReleaseLock`] guard a worker without special casing in the
//! scheduler.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::{
    context::TickContext,
    error::WorkerError,
    lock::DistributedLock,
    traits::LockStore,
    watcher::{DEFAULT_WATCH_INTERVAL, LockWatcher},
};

pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>>;
}

/// Middleware backed by an async closure.
pub struct MiddlewareFn<F>(F);

/// Wrap an async closure as a [`Middleware`].
pub fn middleware_fn<F, Fut>(f: F) -> MiddlewareFn<F>
where
    F: Fn(TickContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    MiddlewareFn(f)
}

impl<F, Fut> Middleware for MiddlewareFn<F>
where
    F: Fn(TickContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    fn handle(&self, ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin((self.0)(ctx))
    }
}

/// Before-hook: take the lock for this tick, skipping it on contention.
///
/// Renewal is scoped to the tick's cancellation token.
pub struct AcquireLock<S: LockStore> {
    lock: Arc<DistributedLock<S>>,
}

impl<S: LockStore> AcquireLock<S> {
    pub fn new(lock: Arc<DistributedLock<S>>) -> Self {
        Self { lock }
    }
}

impl<S: LockStore> Middleware for AcquireLock<S> {
    fn handle(&self, ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        let lock = Arc::clone(&self.lock);
        Box::pin(async move {
            lock.acquire(ctx.cancellation()).await?;
            Ok(())
        })
    }
}

/// After-hook: release the lock taken by [`AcquireLock`].
pub struct ReleaseLock<S: LockStore> {
    lock: Arc<DistributedLock<S>>,
}

impl<S: LockStore> ReleaseLock<S> {
    pub fn new(lock: Arc<DistributedLock<S>>) -> Self {
        Self { lock }
    }
}

impl<S: LockStore> Middleware for ReleaseLock<S> {
    fn handle(&self, _ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        let lock = Arc::clone(&self.lock);
        Box::pin(async move {
            lock.release().await?;
            Ok(())
        })
    }
}

/// Before-hook: skip the tick unless the lock is held, then cancel the tick's
/// context as soon as ownership is lost while the action runs.
pub struct WatchLock<S: LockStore> {
    lock: Arc<DistributedLock<S>>,
    every: Duration,
}

impl<S: LockStore> WatchLock<S> {
    pub fn new(lock: Arc<DistributedLock<S>>) -> Self {
        Self {
            lock,
            every: DEFAULT_WATCH_INTERVAL,
        }
    }

    pub fn every(mut self, every: Duration) -> Self {
        self.every = every;
        self
    }
}

impl<S: LockStore> Middleware for WatchLock<S> {
    fn handle(&self, ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        let lock = Arc::clone(&self.lock);
        let every = self.every;
        Box::pin(async move {
            if !lock.is_locked().await {
                return Err(WorkerError::Locked);
            }
            LockWatcher::spawn(lock, ctx.cancellation().clone(), every).detach();
            Ok(())
        })
    }
}

/// Result of running the before-hooks.
#[derive(Debug)]
pub(crate) enum BeforeOutcome {
    /// Run the action. Carries non-contention hook errors for the error handler.
    Proceed(Vec<WorkerError>),
    /// A hook reported contention.
    Skip,
}

/// Run one hook with panics turned into [`WorkerError::Panicked`].
async fn call_hook(hook: &Arc<dyn Middleware>, ctx: &TickContext) -> Result<(), WorkerError> {
    AssertUnwindSafe(async { hook.handle(ctx.clone()).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(WorkerError::from_panic(payload)))
}

pub(crate) async fn run_before(
    hooks: &[Arc<dyn Middleware>],
    ctx: &TickContext,
) -> BeforeOutcome {
    let mut errors = Vec::new();
    for hook in hooks {
        match call_hook(hook, ctx).await {
            Ok(()) => {}
            Err(e) if e.is_contention() => return BeforeOutcome::Skip,
            Err(e) => {
                tracing::warn!(error = %e, "Before-hook failed, continuing");
                errors.push(e);
            }
        }
    }
    BeforeOutcome::Proceed(errors)
}

pub(crate) async fn run_after(hooks: &[Arc<dyn Middleware>], ctx: &TickContext) {
    for hook in hooks {
        if let Err(e) = call_hook(hook, ctx).await {
            tracing::warn!(error = %e, "After-hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{context::StopHandle, memory::MemoryLockStore};

    fn ctx() -> TickContext {
        TickContext::new(Arc::from("test"), 1, CancellationToken::new(), StopHandle::new())
    }

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        result: fn() -> Result<(), WorkerError>,
    ) -> Arc<dyn Middleware> {
        let log = Arc::clone(log);
        Arc::new(middleware_fn(move |_ctx| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name);
                result()
            }
        }))
    }

    #[tokio::test]
    async fn before_hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording(&log, "first", || Ok(())),
            recording(&log, "second", || Ok(())),
        ];

        let outcome = run_before(&hooks, &ctx()).await;

        assert!(matches!(outcome, BeforeOutcome::Proceed(ref e) if e.is_empty()));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn contention_stops_remaining_before_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording(&log, "lock", || Err(WorkerError::Locked)),
            recording(&log, "never", || Ok(())),
        ];

        let outcome = run_before(&hooks, &ctx()).await;

        assert!(matches!(outcome, BeforeOutcome::Skip));
        assert_eq!(*log.lock().unwrap(), vec!["lock"]);
    }

    #[tokio::test]
    async fn other_errors_are_collected_without_skipping() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording(&log, "flaky", || Err(WorkerError::action("metrics down"))),
            recording(&log, "next", || Ok(())),
        ];

        let outcome = run_before(&hooks, &ctx()).await;

        match outcome {
            BeforeOutcome::Proceed(errors) => assert_eq!(errors.len(), 1),
            BeforeOutcome::Skip => panic!("non-contention error must not skip"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["flaky", "next"]);
    }

    #[tokio::test]
    async fn after_hooks_all_run_despite_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording(&log, "a", || Err(WorkerError::action("nope"))),
            recording(&log, "b", || Ok(())),
        ];

        run_after(&hooks, &ctx()).await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn panicking_before_hook_is_collected_as_panic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(middleware_fn(|ctx: TickContext| async move {
                if ctx.sequence() > 0 {
                    panic!("hook exploded");
                }
                Ok::<(), WorkerError>(())
            })),
            recording(&log, "next", || Ok(())),
        ];

        let outcome = run_before(&hooks, &ctx()).await;

        match outcome {
            BeforeOutcome::Proceed(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].kind(), crate::ErrorKind::Panic);
                assert!(errors[0].to_string().contains("hook exploded"));
            }
            BeforeOutcome::Skip => panic!("a panic is not contention"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["next"]);
    }

    #[tokio::test]
    async fn panic_while_building_hook_future_is_contained() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(middleware_fn(
                |_ctx: TickContext| -> std::future::Ready<Result<(), WorkerError>> {
                    panic!("eager hook exploded")
                },
            )),
            recording(&log, "after", || Ok(())),
        ];

        run_after(&hooks, &ctx()).await;

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_lock_maps_contention() {
        let store = MemoryLockStore::new();
        store.overwrite("worker:lock:test", "other", Duration::from_secs(3));
        let lock =
            Arc::new(DistributedLock::for_worker(store, "test", Duration::from_secs(3)).unwrap());

        let err = AcquireLock::new(lock).handle(ctx()).await.unwrap_err();

        assert!(err.is_contention());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_lock_skips_when_not_held() {
        let store = MemoryLockStore::new();
        let lock =
            Arc::new(DistributedLock::for_worker(store, "test", Duration::from_secs(3)).unwrap());

        let err = WatchLock::new(lock).handle(ctx()).await.unwrap_err();

        assert!(err.is_contention());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_then_release_round_trip() {
        let store = MemoryLockStore::new();
        let lock = Arc::new(
            DistributedLock::for_worker(store.clone(), "test", Duration::from_secs(3)).unwrap(),
        );
        let tick = ctx();

        AcquireLock::new(Arc::clone(&lock)).handle(tick.clone()).await.unwrap();
        WatchLock::new(Arc::clone(&lock)).handle(tick.clone()).await.unwrap();
        assert!(lock.is_locked().await);

        ReleaseLock::new(Arc::clone(&lock)).handle(tick).await.unwrap();
        assert!(store.is_empty());
    }
}
