//! [`LockStore`] backed by a NATS JetStream KV bucket.
//!
//! Expiry is the bucket's `max_age`: every write (create or update) restarts the
//! entry's age, so a record that is not renewed within `max_age` is purged by the
//! server. All locks share one bucket, so they must agree on a TTL: opening the
//! bucket with a TTL other than its `max_age` fails, and a [`NatsLockStore`] rejects
//! writes whose `ttl` differs from the bucket's.
//!
//! Compare operations read the entry and then write with an expected revision, so a
//! concurrent writer makes the write fail on the server instead of being overwritten.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;

use crate::{error::StoreError, traits::LockStore};

pub const LOCK_BUCKET: &str = "worker_locks";

/// Get or create the lock bucket; entries older than `ttl` are purged.
///
/// An existing bucket created with a different `max_age` is rejected with
/// [`StoreError::TtlMismatch`].
pub async fn get_or_create_lock_bucket(
    js: &jetstream::Context,
    ttl: Duration,
) -> Result<kv::Store, StoreError> {
    let config = kv::Config {
        bucket: LOCK_BUCKET.to_string(),
        history: 1,
        max_age: ttl,
        ..Default::default()
    };
    if let Ok(store) = js.create_key_value(config).await {
        return Ok(store);
    }

    let store = js
        .get_key_value(LOCK_BUCKET)
        .await
        .map_err(|e| StoreError::Kv(e.to_string()))?;
    let status = store
        .status()
        .await
        .map_err(|e| StoreError::Kv(e.to_string()))?;
    check_ttl(status.info.config.max_age, ttl)?;
    Ok(store)
}

fn check_ttl(bucket_ttl: Duration, requested: Duration) -> Result<(), StoreError> {
    if requested == bucket_ttl {
        Ok(())
    } else {
        Err(StoreError::TtlMismatch {
            requested,
            bucket: bucket_ttl,
        })
    }
}

/// KV keys may not contain `:`; `worker:lock:reports` is stored as `worker.lock.reports`.
fn kv_key(key: &str) -> String {
    key.replace(':', ".")
}

#[derive(Clone)]
pub struct NatsLockStore {
    store: kv::Store,
    ttl: Duration,
}

impl NatsLockStore {
    /// Wrap a bucket whose `max_age` is `ttl`, as returned by
    /// [`get_or_create_lock_bucket`].
    pub fn new(store: kv::Store, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Open (creating if needed) the bucket for `ttl`.
    pub async fn open(js: &jetstream::Context, ttl: Duration) -> Result<Self, StoreError> {
        Ok(Self::new(get_or_create_lock_bucket(js, ttl).await?, ttl))
    }

    /// The expiry every record in this store gets.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current entry if it is a live put holding `expected`.
    async fn owned_entry(
        &self,
        key: &str,
        expected: &Bytes,
    ) -> Result<Option<kv::Entry>, StoreError> {
        let entry = self
            .store
            .entry(key.to_string())
            .await
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(entry.filter(|e| e.operation == kv::Operation::Put && e.value == *expected))
    }
}

impl LockStore for NatsLockStore {
    type Error = StoreError;

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        check_ttl(self.ttl, ttl)?;
        match self.store.create(kv_key(key), value).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Kv(e.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.store
            .get(kv_key(key))
            .await
            .map_err(|e| StoreError::Kv(e.to_string()))
    }

    async fn compare_and_delete(&self, key: &str, expected: Bytes) -> Result<bool, StoreError> {
        let key = kv_key(key);
        let Some(entry) = self.owned_entry(&key, &expected).await? else {
            return Ok(false);
        };
        match self.store.delete_expect_revision(&key, Some(entry.revision)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == kv::DeleteErrorKind::WrongLastRevision => Ok(false),
            Err(e) => Err(StoreError::Kv(e.to_string())),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        check_ttl(self.ttl, ttl)?;
        let key = kv_key(key);
        let Some(entry) = self.owned_entry(&key, &expected).await? else {
            return Ok(false);
        };
        match self.store.update(&key, expected, entry.revision).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == kv::UpdateErrorKind::WrongLastRevision => Ok(false),
            Err(e) => Err(StoreError::Kv(e.to_string())),
        }
    }
}
