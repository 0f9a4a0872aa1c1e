use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// Boxed error carried across the store and action boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coarse classification of a failure.
///
/// Callers branch on the kind instead of comparing error values, so a store adapter
/// or an action can produce contention without sharing a sentinel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Another instance owns the lock. Expected; the tick is skipped.
    Contention,
    /// The lock store failed or could not be reached.
    Store,
    /// The action (or a before-hook) returned an error.
    Action,
    /// The action or a hook panicked.
    Panic,
    /// The action exceeded its configured timeout.
    Timeout,
    /// Invalid worker or lock configuration.
    Config,
}

/// Errors produced by [`LockStore`](crate::LockStore) backends shipped with this crate.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("KV error: {0}")]
    Kv(String),

    #[error("lock store unavailable")]
    Unavailable,

    #[error("lock ttl {requested:?} does not match the store's ttl {bucket:?}")]
    TtlMismatch { requested: Duration, bucket: Duration },
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by another owner")]
    Locked,

    #[error("lock store error: {0}")]
    Store(#[source] BoxError),

    #[error("invalid lock ttl {0:?}: renew interval (ttl / 3) must be non-zero")]
    InvalidTtl(Duration),
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Locked => ErrorKind::Contention,
            Self::Store(_) => ErrorKind::Store,
            Self::InvalidTtl(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn store<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(e))
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("lock is held by another owner")]
    Locked,

    #[error("lock store error: {0}")]
    Store(#[source] BoxError),

    #[error("action failed: {0}")]
    Action(#[source] BoxError),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("action timed out after {0:?}")]
    TimedOut(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorkerError {
    /// Wrap any error returned by user code as an action failure.
    pub fn action<E: Into<BoxError>>(e: E) -> Self {
        Self::Action(e.into())
    }

    /// Turn a caught panic payload into [`WorkerError::Panicked`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked(panic_message(payload.as_ref()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Locked => ErrorKind::Contention,
            Self::Store(_) => ErrorKind::Store,
            Self::Action(_) => ErrorKind::Action,
            Self::Panicked(_) => ErrorKind::Panic,
            Self::TimedOut(_) => ErrorKind::Timeout,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    pub fn is_contention(&self) -> bool {
        self.kind() == ErrorKind::Contention
    }
}

impl From<LockError> for WorkerError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Locked => Self::Locked,
            LockError::Store(source) => Self::Store(source),
            LockError::InvalidTtl(ttl) => Self::InvalidConfig(format!(
                "lock ttl {ttl:?} is too small to renew"
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
