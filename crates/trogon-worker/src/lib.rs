//! # trogon-worker
//!
//! Fixed-interval workers for TrogonStack services, with a distributed lock so that
//! only one instance in a fleet runs a given worker at a time.
//!
//! ## Features
//!
//! - `Worker`: ticks on a fixed interval, optional run-from-start, per-action
//!   timeout, panic containment, error handler deciding continue-vs-stop.
//! - Before/after middleware. A before-hook reporting lock contention skips the tick.
//! - `DistributedLock`: token-owned record in a shared KV store, renewed every
//!   `ttl / 3`, released with compare-and-delete.
//! - `LockWatcher`: cancels the running tick as soon as lock ownership is lost.
//! - Stores: `MemoryLockStore` (in-process) and `NatsLockStore` (JetStream KV).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use tokio_util::sync::CancellationToken;
//! use trogon_worker::{DistributedLock, MemoryLockStore, TickContext, Worker, WorkerError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkerError> {
//!     let shutdown = CancellationToken::new();
//!     let lock = Arc::new(DistributedLock::for_worker(
//!         MemoryLockStore::new(),
//!         "reports",
//!         Duration::from_secs(15),
//!     )?);
//!
//!     let report = |ctx: TickContext| async move {
//!         tracing::info!(tick = ctx.sequence(), "Building report");
//!         Ok::<(), WorkerError>(())
//!     };
//!
//!     let handle = Worker::builder("reports", Duration::from_secs(30), report)
//!         .exclusive(lock)
//!         .run_from_start(true)
//!         .shutdown(shutdown.clone())
//!         .build()?
//!         .run()
//!         .await;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.cancel();
//!     handle.wait().await
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod memory;
pub mod middleware;
pub mod nats;
pub mod traits;
pub mod watcher;
pub mod worker;

pub use config::WorkerConfig;
pub use context::{StopHandle, TickContext};
pub use error::{BoxError, ErrorKind, LockError, StoreError, WorkerError};
pub use lock::{DistributedLock, worker_lock_key};
pub use memory::MemoryLockStore;
pub use middleware::{AcquireLock, Middleware, ReleaseLock, WatchLock, middleware_fn};
pub use nats::{NatsLockStore, get_or_create_lock_bucket};
pub use traits::LockStore;
pub use watcher::LockWatcher;
pub use worker::{
    Action, Completion, ErrorHandler, Worker, WorkerBuilder, WorkerHandle, WorkerState,
};
