use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

/// The four primitive operations a distributed lock needs from a key-value store.
///
/// The compare operations must be atomic on the store side: a single conditional
/// call, never a read followed by a separate write.
pub trait LockStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create `key = value` with expiry `ttl` only if the key is absent.
    /// Returns `false` when the key already exists.
    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Read the current value, `None` if absent or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send;

    /// Delete the key iff its current value equals `expected`. Returns whether it deleted.
    fn compare_and_delete(
        &self,
        key: &str,
        expected: Bytes,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Reset the expiry to `ttl` iff the current value equals `expected`.
    /// Returns whether it extended.
    fn compare_and_extend(
        &self,
        key: &str,
        expected: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}
