//! Key/value storage with expiry.
//!
//! Conversational state is kept in a TTL store that may be shared by several
//! host instances (Redis or similar in production). The contract is
//! deliberately small: atomic get/set/delete of string values per key, with
//! the backend erasing entries once their TTL elapses.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

/// A TTL-keyed key/value store.
///
/// Each operation is atomic per key. No cross-key transactions and no
/// per-key locking are offered; callers must tolerate a value being
/// overwritten or cleared between a `get` and a later `set`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the live value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value and
    /// restarting its expiry at `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Removes `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}
