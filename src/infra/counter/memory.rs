//! In-memory counter store for development and tests.
//!
//! State is sharded by key hash; each operation locks exactly one shard, so
//! per-key operations are linearizable, matching what the port demands of a
//! production store.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::admission::store::{BucketOutcome, BucketParams, CounterStore, LogOutcome, WindowCount};
use crate::core::error::StoreError;

const SHARD_COUNT: usize = 16;

#[derive(Debug)]
enum Entry {
    Window { count: u32, expires_at_ms: u64 },
    Log(VecDeque<u64>),
    Bucket { tokens: u32, last_refill_ms: u64 },
}

/// Sharded in-memory implementation of the counter store port.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % SHARD_COUNT;
        &self.shards[index]
    }

    /// Advance a bucket's refill and return `(tokens, last_refill_ms)`.
    fn refill(
        tokens: u32,
        last_refill_ms: u64,
        params: &BucketParams,
        now_ms: u64,
    ) -> (u32, u64) {
        if params.refill_interval_ms == 0 {
            return (tokens, last_refill_ms);
        }
        let elapsed = now_ms.saturating_sub(last_refill_ms);
        let intervals = elapsed / params.refill_interval_ms;
        if intervals == 0 {
            return (tokens, last_refill_ms);
        }
        let added = intervals.saturating_mul(u64::from(params.refill_rate));
        let refilled = u64::from(tokens)
            .saturating_add(added)
            .min(u64::from(params.capacity));
        #[allow(clippy::cast_possible_truncation)]
        let refilled = refilled as u32;
        (
            refilled,
            last_refill_ms + intervals * params.refill_interval_ms,
        )
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn window_incr(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<WindowCount, StoreError> {
        let mut shard = self.shard(key).lock();
        let entry = shard
            .entry(key.to_string())
            .or_insert(Entry::Window {
                count: 0,
                expires_at_ms: now_ms + window_ms,
            });
        match entry {
            Entry::Window {
                count,
                expires_at_ms,
            } => {
                if now_ms >= *expires_at_ms {
                    // Window elapsed: a fresh counter with a fresh expiry
                    *count = 0;
                    *expires_at_ms = now_ms + window_ms;
                }
                *count += 1;
                Ok(WindowCount {
                    count: *count,
                    expires_at_ms: *expires_at_ms,
                })
            }
            _ => Err(StoreError::Corrupt(format!(
                "key `{key}` holds non-window state"
            ))),
        }
    }

    async fn window_peek(&self, key: &str, now_ms: u64) -> Result<Option<WindowCount>, StoreError> {
        let shard = self.shard(key).lock();
        match shard.get(key) {
            None => Ok(None),
            Some(Entry::Window {
                count,
                expires_at_ms,
            }) => {
                if now_ms >= *expires_at_ms {
                    Ok(None)
                } else {
                    Ok(Some(WindowCount {
                        count: *count,
                        expires_at_ms: *expires_at_ms,
                    }))
                }
            }
            Some(_) => Err(StoreError::Corrupt(format!(
                "key `{key}` holds non-window state"
            ))),
        }
    }

    async fn log_trim_insert(
        &self,
        key: &str,
        window_ms: u64,
        limit: u32,
        now_ms: u64,
    ) -> Result<LogOutcome, StoreError> {
        let mut shard = self.shard(key).lock();
        let entry = shard
            .entry(key.to_string())
            .or_insert_with(|| Entry::Log(VecDeque::new()));
        match entry {
            Entry::Log(log) => {
                let cutoff = now_ms.saturating_sub(window_ms);
                while log.front().is_some_and(|ts| *ts < cutoff) {
                    log.pop_front();
                }
                let admitted = (log.len() as u64) < u64::from(limit);
                if admitted {
                    log.push_back(now_ms);
                }
                #[allow(clippy::cast_possible_truncation)]
                let count = log.len() as u32;
                Ok(LogOutcome {
                    admitted,
                    count,
                    oldest_ms: log.front().copied(),
                })
            }
            _ => Err(StoreError::Corrupt(format!(
                "key `{key}` holds non-log state"
            ))),
        }
    }

    async fn log_count(
        &self,
        key: &str,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<LogOutcome, StoreError> {
        let mut shard = self.shard(key).lock();
        match shard.get_mut(key) {
            None => Ok(LogOutcome {
                admitted: false,
                count: 0,
                oldest_ms: None,
            }),
            Some(Entry::Log(log)) => {
                let cutoff = now_ms.saturating_sub(window_ms);
                while log.front().is_some_and(|ts| *ts < cutoff) {
                    log.pop_front();
                }
                #[allow(clippy::cast_possible_truncation)]
                let count = log.len() as u32;
                Ok(LogOutcome {
                    admitted: false,
                    count,
                    oldest_ms: log.front().copied(),
                })
            }
            Some(_) => Err(StoreError::Corrupt(format!(
                "key `{key}` holds non-log state"
            ))),
        }
    }

    async fn bucket_take(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut shard = self.shard(key).lock();
        let entry = shard.entry(key.to_string()).or_insert(Entry::Bucket {
            tokens: params.capacity,
            last_refill_ms: now_ms,
        });
        match entry {
            Entry::Bucket {
                tokens,
                last_refill_ms,
            } => {
                let (refilled, refill_at) = Self::refill(*tokens, *last_refill_ms, params, now_ms);
                *tokens = refilled;
                *last_refill_ms = refill_at;

                let taken = *tokens >= 1;
                if taken {
                    *tokens -= 1;
                }
                Ok(BucketOutcome {
                    taken,
                    tokens: *tokens,
                    next_refill_ms: *last_refill_ms + params.refill_interval_ms,
                })
            }
            _ => Err(StoreError::Corrupt(format!(
                "key `{key}` holds non-bucket state"
            ))),
        }
    }

    async fn bucket_peek(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: u64,
    ) -> Result<BucketOutcome, StoreError> {
        let mut shard = self.shard(key).lock();
        let entry = shard.entry(key.to_string()).or_insert(Entry::Bucket {
            tokens: params.capacity,
            last_refill_ms: now_ms,
        });
        match entry {
            Entry::Bucket {
                tokens,
                last_refill_ms,
            } => {
                let (refilled, refill_at) = Self::refill(*tokens, *last_refill_ms, params, now_ms);
                *tokens = refilled;
                *last_refill_ms = refill_at;
                Ok(BucketOutcome {
                    taken: false,
                    tokens: *tokens,
                    next_refill_ms: *last_refill_ms + params.refill_interval_ms,
                })
            }
            _ => Err(StoreError::Corrupt(format!(
                "key `{key}` holds non-bucket state"
            ))),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.shard(key).lock().remove(key);
        Ok(())
    }
}
