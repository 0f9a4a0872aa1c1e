use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{error::LockError, traits::LockStore};

const KEY_PREFIX: &str = "worker:lock:";

/// Store key guarding the worker called `name`.
pub fn worker_lock_key(name: &str) -> String {
    format!("{KEY_PREFIX}{name}")
}

/// Random 128-bit owner token, hex-encoded.
fn generate_token() -> Bytes {
    Bytes::from(format!("{:032x}", rand::random::<u128>()))
}

/// Mutual-exclusion lock over a single key in a shared [`LockStore`].
///
/// A record is owned by this instance iff its stored value equals this instance's
/// token. Every mutation after acquire is conditioned on that token inside the store,
/// so a lapsed owner can never extend or delete a record someone else created.
pub struct DistributedLock<S: LockStore> {
    store: S,
    key: String,
    token: Bytes,
    ttl: Duration,
    renew_interval: Duration,
    renewal: Mutex<Option<CancellationToken>>,
    span: Span,
}

impl<S: LockStore> DistributedLock<S> {
    pub fn new(store: S, key: impl Into<String>, ttl: Duration) -> Result<Self, LockError> {
        let renew_interval = ttl / 3;
        if renew_interval.is_zero() {
            return Err(LockError::InvalidTtl(ttl));
        }
        let key = key.into();
        let span = info_span!("lock", key = %key);
        Ok(Self {
            store,
            key,
            token: generate_token(),
            ttl,
            renew_interval,
            renewal: Mutex::new(None),
            span,
        })
    }

    /// Lock for the worker called `name`, stored under `worker:lock:<name>`.
    pub fn for_worker(store: S, name: &str, ttl: Duration) -> Result<Self, LockError> {
        Self::new(store, worker_lock_key(name), ttl)
    }

    /// Replace the span this lock logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// This instance's owner token as stored in the key.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// Try to take the lock. On success a renewal loop keeps it alive until
    /// [`release`](Self::release), ownership loss, or cancellation of `parent`.
    pub async fn acquire(&self, parent: &CancellationToken) -> Result<(), LockError> {
        let acquired = self
            .store
            .set_if_absent(&self.key, self.token.clone(), self.ttl)
            .await
            .map_err(|e| {
                warn!(parent: &self.span, error = %e, "Failed to acquire lock");
                LockError::store(e)
            })?;

        if !acquired {
            debug!(parent: &self.span, "Lock held by another owner");
            return Err(LockError::Locked);
        }

        let renewal = parent.child_token();
        if let Some(previous) = self.renewal().replace(renewal.clone()) {
            previous.cancel();
        }

        tokio::spawn(
            renew(
                self.store.clone(),
                self.key.clone(),
                self.token.clone(),
                self.ttl,
                self.renew_interval,
                renewal,
            )
            .instrument(self.span.clone()),
        );

        info!(parent: &self.span, ttl = ?self.ttl, "Acquired lock");
        Ok(())
    }

    /// Stop renewing and delete the record if this instance still owns it.
    ///
    /// A record that now belongs to another token is left untouched.
    pub async fn release(&self) -> Result<(), LockError> {
        if let Some(renewal) = self.renewal().take() {
            renewal.cancel();
        }

        let deleted = self
            .store
            .compare_and_delete(&self.key, self.token.clone())
            .await
            .map_err(|e| {
                warn!(parent: &self.span, error = %e, "Failed to release lock");
                LockError::store(e)
            })?;

        if deleted {
            info!(parent: &self.span, "Released lock");
        } else {
            debug!(parent: &self.span, "Lock no longer owned, nothing to release");
        }
        Ok(())
    }

    /// Whether the store currently holds this instance's token. Store errors read as
    /// `false`.
    pub async fn is_locked(&self) -> bool {
        match self.store.get(&self.key).await {
            Ok(value) => value.is_some_and(|v| v == self.token),
            Err(e) => {
                debug!(parent: &self.span, error = %e, "Lock liveness check failed");
                false
            }
        }
    }

    /// Whether a renewal loop started by the last acquire is still running.
    pub fn is_renewing(&self) -> bool {
        self.renewal()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn renewal(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.renewal.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: LockStore> Drop for DistributedLock<S> {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal().take() {
            renewal.cancel();
        }
    }
}

/// Extend the record every `every` until cancelled or ownership is lost.
async fn renew<S: LockStore>(
    store: S,
    key: String,
    token: Bytes,
    ttl: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.compare_and_extend(&key, token.clone(), ttl).await {
            Ok(true) => debug!("Renewed lock"),
            Ok(false) => {
                warn!("Lost lock ownership, stopping renewal");
                cancel.cancel();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Lock renewal failed, presuming ownership lost");
                cancel.cancel();
                return;
            }
        }
    }
}
