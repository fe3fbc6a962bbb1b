//! Counter Store port: the atomic primitives admission correctness rests on.
//!
//! The store is shared across service instances and assumed linearizable per
//! key. Each method is ONE atomic unit against the store; in a Redis-backed
//! deployment these map to INCR+EXPIRE-NX, a ZREMRANGEBYSCORE/ZCARD/ZADD
//! script, and a HGETALL/HSET script respectively. Correctness never depends
//! on an in-process lock.

use async_trait::async_trait;

use crate::core::error::StoreError;

/// Fixed-window counter state after an increment or peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one for
    /// `window_incr`.
    pub count: u32,
    /// When the current window's counter expires.
    pub expires_at_ms: u64,
}

/// Sliding-log state after a trim+count(+insert).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOutcome {
    /// Whether the current timestamp was inserted (the request admitted).
    pub admitted: bool,
    /// Entries remaining in the trailing window, including any inserted one.
    pub count: u32,
    /// Oldest surviving entry, if any. Its expiry is when a slot frees.
    pub oldest_ms: Option<u64>,
}

/// Token-bucket parameters, owned by the caller and passed per operation so
/// the store holds only `{tokens, last_refill_ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketParams {
    /// Maximum stored tokens.
    pub capacity: u32,
    /// Tokens added per refill interval.
    pub refill_rate: u32,
    /// Refill interval in milliseconds.
    pub refill_interval_ms: u64,
}

/// Token-bucket state after a take or peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOutcome {
    /// Whether a token was consumed.
    pub taken: bool,
    /// Tokens remaining after the operation.
    pub tokens: u32,
    /// When the next refill lands.
    pub next_refill_ms: u64,
}

/// Port for the shared, atomically-updated counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the window counter at `key`. Creating the key
    /// sets its expiry to `window_ms` exactly once; later increments in the
    /// same window must not reset it. An expired counter starts a new
    /// window at count 1.
    async fn window_incr(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowCount, StoreError>;

    /// Read the window counter without consuming. `None` when the key is
    /// absent or expired.
    async fn window_peek(&self, key: &str, now_ms: u64) -> Result<Option<WindowCount>, StoreError>;

    /// Atomically trim entries older than `now_ms - window_ms`, count the
    /// survivors, and insert `now_ms` iff the count is below `limit`. The
    /// three steps are one atomic unit; concurrent callers must not both
    /// pass a `count < limit` check for the final slot.
    async fn log_trim_insert(
        &self,
        key: &str,
        window_ms: u64,
        limit: u32,
        now_ms: u64,
    ) -> Result<LogOutcome, StoreError>;

    /// Trim and count the log without inserting. `admitted` is always false.
    async fn log_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<LogOutcome, StoreError>;

    /// Atomically refill the bucket at `key` per `params` and consume one
    /// token if available. A missing key starts at full capacity.
    async fn bucket_take(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Refill-and-read without consuming. `taken` is always false.
    async fn bucket_peek(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Delete the state at `key`. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}
