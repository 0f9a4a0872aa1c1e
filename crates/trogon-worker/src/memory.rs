//! In-process [`LockStore`] for single-node deployments and tests.
//!
//! The fault-injection helpers (`set_unavailable`, `overwrite`, `remove`) are only
//! compiled with the `test-support` feature.
//!
//! Expiry is measured with `tokio::time::Instant`, so tests running with a paused
//! clock (`#[tokio::test(start_paused = true)]`) observe TTLs deterministically.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::{error::StoreError, traits::LockStore};

#[derive(Debug, Clone)]
struct Record {
    value: Bytes,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Shared in-memory key space. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<Mutex<HashMap<String, Record>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until reset.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Unconditionally write `key = value`, as a foreign owner would after expiry.
    #[cfg(any(test, feature = "test-support"))]
    pub fn overwrite(&self, key: &str, value: impl Into<Bytes>, ttl: Duration) {
        self.records().insert(
            key.to_string(),
            Record {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop the record regardless of owner.
    #[cfg(any(test, feature = "test-support"))]
    pub fn remove(&self, key: &str) {
        self.records().remove(key);
    }

    /// Time left before `key` expires, `None` if absent or already expired.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.records()
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.expires_at - now)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records().values().filter(|r| r.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl LockStore for MemoryLockStore {
    type Error = StoreError;

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.records();
        if records.get(key).is_some_and(|r| r.is_live(now)) {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Record {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .records()
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.value.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expected: Bytes) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut records = self.records();
        match records.get(key) {
            Some(r) if r.is_live(now) && r.value == expected => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        match self.records().get_mut(key) {
            Some(r) if r.is_live(now) && r.value == expected => {
                r.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
