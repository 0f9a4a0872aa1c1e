use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::{
    config::WorkerConfig,
    context::{StopHandle, TickContext},
    error::WorkerError,
    lock::DistributedLock,
    middleware::{
        AcquireLock, BeforeOutcome, Middleware, ReleaseLock, WatchLock, run_after, run_before,
    },
    traits::LockStore,
    watcher::DEFAULT_WATCH_INTERVAL,
};

/// The unit of work a worker runs on every tick.
pub trait Action: Send + Sync + 'static {
    fn call(&self, ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>>;
}

impl<F, Fut> Action for F
where
    F: Fn(TickContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
{
    fn call(&self, ctx: TickContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(self(ctx))
    }
}

/// Decides whether the worker keeps ticking after an error. `false` stops it.
pub type ErrorHandler = Arc<dyn Fn(&WorkerError) -> bool + Send + Sync>;

type Teardown = Box<dyn FnOnce(Completion) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    /// Waiting for the next tick.
    Running,
    /// A tick (hooks and action) is in progress.
    Executing,
    /// Terminal.
    Stopped,
}

/// Resolves once the worker has stopped. Handed to the teardown callback.
#[derive(Debug, Clone)]
pub struct Completion {
    state: watch::Receiver<WorkerState>,
}

impl Completion {
    pub async fn wait(mut self) -> Result<(), WorkerError> {
        // A dropped sender means the loop task is gone, which is also terminal.
        let _ = self
            .state
            .wait_for(|state| *state == WorkerState::Stopped)
            .await;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        *self.state.borrow() == WorkerState::Stopped
    }
}

pub struct WorkerBuilder {
    name: Arc<str>,
    interval: Duration,
    action: Arc<dyn Action>,
    timeout: Option<Duration>,
    run_from_start: bool,
    error_handler: Option<ErrorHandler>,
    before: Vec<Arc<dyn Middleware>>,
    after: Vec<Arc<dyn Middleware>>,
    teardown: Option<Teardown>,
    shutdown: CancellationToken,
    span: Option<Span>,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<Arc<str>>, interval: Duration, action: impl Action) -> Self {
        Self {
            name: name.into(),
            interval,
            action: Arc::new(action),
            timeout: None,
            run_from_start: false,
            error_handler: None,
            before: Vec::new(),
            after: Vec::new(),
            teardown: None,
            shutdown: CancellationToken::new(),
            span: None,
        }
    }

    /// Builder with name, interval, timeout, and run-from-start taken from `config`.
    pub fn from_config(config: &WorkerConfig, action: impl Action) -> Self {
        let mut builder = Self::new(config.name.as_str(), config.interval(), action)
            .run_from_start(config.run_from_start);
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// Run one cycle inline before the first tick.
    pub fn run_from_start(mut self, run_from_start: bool) -> Self {
        self.run_from_start = run_from_start;
        self
    }

    /// Abandon the action and cancel its context after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkerError) -> bool + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Install a handler if one is given; `None` leaves the current one in place.
    pub fn maybe_error_handler(mut self, handler: Option<ErrorHandler>) -> Self {
        if let Some(handler) = handler {
            self.error_handler = Some(handler);
        }
        self
    }

    pub fn before(mut self, hook: impl Middleware) -> Self {
        self.before.push(Arc::new(hook));
        self
    }

    pub fn after(mut self, hook: impl Middleware) -> Self {
        self.after.push(Arc::new(hook));
        self
    }

    /// Guard every tick with `lock`: acquire and watch before, release after.
    pub fn exclusive<S: LockStore>(self, lock: Arc<DistributedLock<S>>) -> Self {
        self.exclusive_with_watch_interval(lock, DEFAULT_WATCH_INTERVAL)
    }

    pub fn exclusive_with_watch_interval<S: LockStore>(
        self,
        lock: Arc<DistributedLock<S>>,
        every: Duration,
    ) -> Self {
        self.before(AcquireLock::new(Arc::clone(&lock)))
            .before(WatchLock::new(Arc::clone(&lock)).every(every))
            .after(ReleaseLock::new(lock))
    }

    /// Called once at [`Worker::run`] with a [`Completion`] the owner can await during
    /// its own shutdown.
    pub fn teardown<F>(mut self, teardown: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.teardown = Some(Box::new(teardown));
        self
    }

    /// External cancellation; the worker stops when it fires.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Span the worker logs under. Defaults to `worker{name}`.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Result<Worker, WorkerError> {
        if self.interval.is_zero() {
            return Err(WorkerError::InvalidConfig(format!(
                "worker '{}': interval must be greater than zero",
                self.name
            )));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(WorkerError::InvalidConfig(format!(
                "worker '{}': timeout must be greater than zero",
                self.name
            )));
        }

        let span = self
            .span
            .unwrap_or_else(|| info_span!("worker", worker = %self.name));
        let (state, _) = watch::channel(WorkerState::Idle);

        Ok(Worker {
            inner: Arc::new(Inner {
                name: self.name,
                action: self.action,
                timeout: self.timeout,
                error_handler: self.error_handler,
                before: self.before,
                after: self.after,
                shutdown: self.shutdown,
                stop: StopHandle::new(),
                state,
                span,
            }),
            interval: self.interval,
            run_from_start: self.run_from_start,
            teardown: self.teardown,
        })
    }
}

struct Inner {
    name: Arc<str>,
    action: Arc<dyn Action>,
    timeout: Option<Duration>,
    error_handler: Option<ErrorHandler>,
    before: Vec<Arc<dyn Middleware>>,
    after: Vec<Arc<dyn Middleware>>,
    shutdown: CancellationToken,
    stop: StopHandle,
    state: watch::Sender<WorkerState>,
    span: Span,
}

/// Fixed-interval runner. Ticks never overlap; missed ticks are skipped.
pub struct Worker {
    inner: Arc<Inner>,
    interval: Duration,
    run_from_start: bool,
    teardown: Option<Teardown>,
}

impl Worker {
    pub fn builder(
        name: impl Into<Arc<str>>,
        interval: Duration,
        action: impl Action,
    ) -> WorkerBuilder {
        WorkerBuilder::new(name, interval, action)
    }

    /// Build and run a worker with no hooks or error handler.
    pub async fn spawn(
        name: impl Into<Arc<str>>,
        interval: Duration,
        action: impl Action,
        shutdown: CancellationToken,
        run_from_start: bool,
    ) -> Result<WorkerHandle, WorkerError> {
        let worker = Self::builder(name, interval, action)
            .shutdown(shutdown)
            .run_from_start(run_from_start)
            .build()?;
        Ok(worker.run().await)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start the worker: hand the teardown its [`Completion`], run the first cycle
    /// inline if configured, then tick in a background task.
    pub async fn run(mut self) -> WorkerHandle {
        let inner = Arc::clone(&self.inner);
        let completion = Completion {
            state: inner.state.subscribe(),
        };

        if let Some(teardown) = self.teardown.take() {
            teardown(completion.clone());
        }

        inner.state.send_replace(WorkerState::Running);
        info!(parent: &inner.span, interval = ?self.interval, "Worker started");

        if self.run_from_start {
            inner.cycle(0).instrument(inner.span.clone()).await;
        }

        let task = tokio::spawn(
            Arc::clone(&inner)
                .tick_loop(self.interval)
                .instrument(inner.span.clone()),
        );

        WorkerHandle {
            stop: inner.stop.clone(),
            completion,
            task,
        }
    }
}

impl Inner {
    async fn tick_loop(self: Arc<Self>, every: Duration) {
        let _stopped = PublishStopped(&self.state);
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sequence = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, stopping worker");
                    break;
                }
                _ = self.stop.stopped() => {
                    info!("Stop requested, stopping worker");
                    break;
                }
                _ = ticker.tick() => {
                    sequence += 1;
                    self.cycle(sequence).await;
                }
            }
        }
    }

    /// One execution: before-hooks, action, after-hooks, error policy.
    async fn cycle(&self, sequence: u64) {
        self.state.send_replace(WorkerState::Executing);

        let token = self.shutdown.child_token();
        let ctx = TickContext::new(
            Arc::clone(&self.name),
            sequence,
            token.clone(),
            self.stop.clone(),
        );

        match run_before(&self.before, &ctx).await {
            BeforeOutcome::Skip => {
                debug!(sequence, "Lock held elsewhere, skipping tick");
            }
            BeforeOutcome::Proceed(hook_errors) => {
                for e in &hook_errors {
                    self.handle_error(e);
                }
                if let Err(e) = self.run_action(&ctx).await {
                    self.handle_error(&e);
                }
                run_after(&self.after, &ctx).await;
            }
        }

        token.cancel();
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Executing {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
    }

    async fn run_action(&self, ctx: &TickContext) -> Result<(), WorkerError> {
        let call = AssertUnwindSafe(async { self.action.call(ctx.clone()).await }).catch_unwind();

        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    ctx.cancellation().cancel();
                    return Err(WorkerError::TimedOut(timeout));
                }
            },
            None => call.await,
        };

        outcome.unwrap_or_else(|payload| Err(WorkerError::from_panic(payload)))
    }

    fn handle_error(&self, e: &WorkerError) {
        match &self.error_handler {
            Some(handler) => {
                if handler(e) {
                    warn!(error = %e, kind = ?e.kind(), "Worker tick failed");
                } else {
                    error!(
                        error = %e,
                        kind = ?e.kind(),
                        "Worker tick failed, error handler requested stop"
                    );
                    self.stop.stop();
                }
            }
            None => warn!(error = %e, kind = ?e.kind(), "Worker tick failed"),
        }
    }
}

/// Publishes [`WorkerState::Stopped`] when the tick loop exits, unwinding included.
struct PublishStopped<'a>(&'a watch::Sender<WorkerState>);

impl Drop for PublishStopped<'_> {
    fn drop(&mut self) {
        self.0.send_replace(WorkerState::Stopped);
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    stop: StopHandle,
    completion: Completion,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Raise the internal stop request.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn state(&self) -> WorkerState {
        *self.completion.state.borrow()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Wait for the tick loop to exit.
    pub async fn wait(self) -> Result<(), WorkerError> {
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker task ended abnormally");
        }
        Ok(())
    }

    /// Stop and wait.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.stop();
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    async fn noop(_ctx: TickContext) -> Result<(), WorkerError> {
        Ok(())
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Action {
        let counter = Arc::clone(counter);
        move |_ctx: TickContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), WorkerError>(())
            }
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = Worker::builder("w", Duration::ZERO, noop).build();
        assert!(matches!(result, Err(WorkerError::InvalidConfig(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = Worker::builder("w", Duration::from_secs(1), noop)
            .timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(WorkerError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = Worker::builder("w", Duration::from_secs(1), counting(&counter))
            .build()
            .unwrap()
            .run()
            .await;

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_from_start_executes_before_returning() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = Worker::builder("w", Duration::from_secs(60), counting(&counter))
            .run_from_start(true)
            .build()
            .unwrap()
            .run()
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn state_moves_to_stopped() {
        let handle = Worker::builder("w", Duration::from_secs(1), noop)
            .build()
            .unwrap()
            .run()
            .await;
        assert_eq!(handle.state(), WorkerState::Running);

        let completion = handle.completion();
        handle.shutdown().await.unwrap();

        assert!(completion.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_context_and_reports() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        let cancelled_in_action = Arc::clone(&cancelled);

        let handle = Worker::builder("slow", Duration::from_secs(1), move |ctx: TickContext| {
            let cancelled = Arc::clone(&cancelled_in_action);
            async move {
                let token = ctx.cancellation().clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    cancelled.fetch_add(1, Ordering::SeqCst);
                });
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), WorkerError>(())
            }
        })
        .timeout(Duration::from_millis(100))
        .run_from_start(true)
        .error_handler(move |e| {
            seen_in_handler.lock().unwrap().push(e.kind());
            true
        })
        .build()
        .unwrap()
        .run()
        .await;

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec![crate::ErrorKind::Timeout]);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        handle.shutdown().await.unwrap();
    }
}
