//! Shared ephemeral state store
//!
//! Every service reaches the store through the narrow [`StateStore`] port.
//! Two adapters exist:
//! - [`RedisStore`]: the production backend (fred), every call bounded by a timeout
//! - [`MemoryStore`]: an in-process backend for local development and tests

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

/// Store failures. A timeout is handled exactly like an outage by callers.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("State store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A counter after an atomic increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Count after this increment
    pub count: u64,
    /// Seconds until the counter expires
    pub ttl_secs: u64,
}

/// Narrow interface over the shared key-value store.
///
/// Atomicity requirements:
/// - `incr_with_expiry` increments and sets expiry atomically per key
/// - `window_push` trims, inserts, caps and counts atomically per key
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Liveness probe
    async fn ping(&self) -> StoreResult<()>;

    /// Increment each key by one, setting its expiry on first increment.
    /// Results are returned in input order.
    async fn incr_with_expiry(&self, keys: &[(String, Duration)]) -> StoreResult<Vec<Counter>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Overwrite `key` only if it still exists (`SET .. XX EX`). Returns
    /// whether the write happened.
    async fn replace_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Add or rescore a sorted-set member and refresh the key's expiry
    async fn zadd(&self, key: &str, score: f64, member: &str, ttl: Duration) -> StoreResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Members with `min <= score <= max`, ascending by score
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> StoreResult<Vec<(String, f64)>>;

    /// Sliding-window insert: drop members older than `score - window`, add
    /// `member`, keep only the newest `max_len` members, expire the key after
    /// `window`, and return the resulting cardinality.
    async fn window_push(
        &self,
        key: &str,
        score: f64,
        member: &str,
        window: Duration,
        max_len: usize,
    ) -> StoreResult<u64>;
}
