//! Backing-store command surface for run synchronization.
//!
//! # Purpose
//! The synchronization client only needs a handful of store primitives:
//! atomic counters, batched counter reads, append-only topic streams and a
//! blocking ordered read over those streams. This crate defines that surface
//! ([`SyncStore`], [`TopicReader`]) and ships two implementations:
//!
//! - [`RedisStore`]: a pooled Redis connection with fixed tuning, health
//!   checked at provisioning time.
//! - [`MemoryStore`]: an in-process store with the same semantics, used by
//!   tests, demos and single-process runs.
//!
//! # Design notes
//! Blocking stream reads never go through the pool. A [`TopicReader`] owns a
//! dedicated connection and is meant to be driven by exactly one task; other
//! tasks can only wake it up through its [`ReadInterrupt`].
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod memory;
pub mod redis_store;

pub use config::{PoolTuning, StoreConfig};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Stream position that starts a read from the first entry of a topic.
pub const STREAM_START: &str = "0";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("failed to parse store port {0:?}")]
    InvalidPort(String),
    #[error("connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("failed to ping store at {addr}: {reason}")]
    HealthCheck { addr: String, reason: String },
    #[error("connection pool: {0}")]
    Pool(String),
    #[error("pool wait timed out")]
    PoolTimeout,
    #[error("store command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Whether retrying the same command may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Command(err) => {
                err.is_io_error()
                    || err.is_timeout()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
            }
            StoreError::Connect { .. } | StoreError::PoolTimeout | StoreError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// One message read from a topic stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    pub topic: String,
    /// Store-assigned position; pass it back as the cursor to continue after it.
    pub id: String,
    pub payload: Bytes,
}

/// Point-in-time connection pool statistics, observational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub timeouts: u64,
}

#[async_trait]
pub trait SyncStore: Send + Sync + 'static {
    async fn ping(&self) -> Result<()>;

    /// Atomically increment `key` and return the new value.
    async fn incr(&self, key: &str) -> Result<u64>;

    /// Read several counters in one round trip. Missing keys read as 0.
    async fn get_counters(&self, keys: &[String]) -> Result<Vec<u64>>;

    /// Append to a topic stream, returning the 1-based position of the entry.
    async fn append(&self, topic: &str, payload: Bytes) -> Result<u64>;

    /// Open a dedicated reader for blocking stream reads.
    async fn open_reader(&self) -> Result<Box<dyn TopicReader>>;

    fn pool_stats(&self) -> PoolStats;

    /// Release every connection. Commands issued afterwards fail with
    /// [`StoreError::Closed`]. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TopicReader: Send {
    /// Wait up to `block` for entries after each `(topic, cursor)` pair and
    /// return at most `count` per topic, in stream order.
    ///
    /// Returns an empty batch when the wait times out or is interrupted.
    async fn read(
        &mut self,
        cursors: &[(String, String)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<TopicEntry>>;

    fn interrupter(&self) -> Arc<dyn ReadInterrupt>;
}

/// Wakes a [`TopicReader`] blocked in [`TopicReader::read`] from another task.
#[async_trait]
pub trait ReadInterrupt: Send + Sync {
    async fn interrupt(&self) -> Result<()>;
}

pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    min.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(3);
        assert_eq!(backoff_delay(0, min, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, min, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, min, max), Duration::from_secs(3));
        assert_eq!(backoff_delay(40, min, max), Duration::from_secs(3));
    }

    #[test]
    fn pool_and_timeout_errors_are_transient() {
        assert!(StoreError::PoolTimeout.is_transient());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!StoreError::Closed.is_transient());
        assert!(!StoreError::InvalidPort("x".into()).is_transient());
    }
}
