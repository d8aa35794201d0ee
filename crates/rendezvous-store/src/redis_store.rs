//! Pooled Redis backend.
//!
//! # Purpose
//! Provisions the shared connection pool used by every non-blocking command
//! and opens the dedicated connections used for blocking stream reads.
//!
//! # Design notes
//! - Provisioning pings the server before returning; on failure the pool is
//!   closed so nothing leaks.
//! - Read-only commands retry transient failures with bounded exponential
//!   backoff. INCR and XADD are not idempotent, so they only retry while
//!   acquiring a pooled connection, never once the command was sent.
//! - A reaper task evicts connections that are too old or idle for too long
//!   and keeps `min_idle` connections warm. It stops when the store closes.
//!   A pre-recycle hook refuses connections past their max age in between
//!   reaper runs.
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{
    Connection, Hook, HookError, Pool, PoolConfig, PoolError, Runtime, Timeouts,
};
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{PoolTuning, StoreConfig};
use crate::{
    PoolStats, ReadInterrupt, Result, StoreError, SyncStore, TopicEntry, TopicReader,
    backoff_delay,
};

/// Stream entry field holding the message payload.
const PAYLOAD_FIELD: &str = "p";

pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    config: StoreConfig,
    token: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    pool_timeouts: Arc<AtomicU64>,
}

impl RedisStore {
    /// Build the pool, check the server answers, then start pool maintenance.
    ///
    /// The store stops its background work when `parent` is cancelled or
    /// [`SyncStore::close`] is called.
    pub async fn provision(config: StoreConfig, parent: &CancellationToken) -> Result<Self> {
        let addr = config.addr();
        debug!(host = %config.host, port = config.port, "trying redis host");

        let client = redis::Client::open(config.url()).map_err(|err| StoreError::Connect {
            addr: addr.clone(),
            reason: err.to_string(),
        })?;
        let pool = build_pool(&config)?;
        let store = Self {
            pool,
            client,
            config,
            token: parent.child_token(),
            reaper: Mutex::new(None),
            closed: AtomicBool::new(false),
            pool_timeouts: Arc::new(AtomicU64::new(0)),
        };

        if let Err(err) = store.ping().await {
            error!(
                host = %store.config.host,
                port = store.config.port,
                error = %err,
                "failed to ping redis host"
            );
            store.pool.close();
            return Err(StoreError::HealthCheck {
                addr,
                reason: err.to_string(),
            });
        }

        warm_pool(&store.pool, &store.config.tuning).await;
        let handle = tokio::spawn(run_reaper(
            store.pool.clone(),
            store.config.tuning.clone(),
            store.token.clone(),
        ));
        *store.reaper.lock().await = Some(handle);

        debug!(
            addr = %addr,
            pool_size = store.config.tuning.pool_size,
            min_idle = store.config.tuning.min_idle,
            "redis ping OK"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tuning = &self.config.tuning;
        let mut attempt = 0u32;
        loop {
            self.check_open()?;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < tuning.max_retries => {
                    let delay =
                        backoff_delay(attempt, tuning.min_retry_backoff, tuning.max_retry_backoff);
                    warn!(op, attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying store command");
                    attempt += 1;
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(StoreError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn acquire_once(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|err| {
            let err = pool_error(err);
            if matches!(err, StoreError::PoolTimeout) {
                self.pool_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            err
        })
    }

    /// Pooled connection for a command that must not be sent twice.
    async fn acquire(&self) -> Result<Connection> {
        self.with_retry("acquire", || self.acquire_once()).await
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let limit = self.config.tuning.command_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(limit)),
        }
    }

    async fn ping_once(&self) -> Result<()> {
        let mut conn = self.acquire_once().await?;
        let reply: String = self
            .timed(redis::cmd("PING").query_async(&mut conn))
            .await?;
        if reply != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply {reply:?}")));
        }
        Ok(())
    }

    async fn mget_once(&self, keys: &[String]) -> Result<Vec<u64>> {
        let mut conn = self.acquire_once().await?;
        let values: Vec<Option<u64>> = self
            .timed(redis::cmd("MGET").arg(keys).query_async(&mut conn))
            .await?;
        if values.len() != keys.len() {
            return Err(StoreError::Protocol(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }
        Ok(values.into_iter().map(|value| value.unwrap_or(0)).collect())
    }
}

#[async_trait]
impl SyncStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        self.with_retry("ping", || self.ping_once()).await
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let value: u64 = self
            .timed(redis::cmd("INCR").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn get_counters(&self, keys: &[String]) -> Result<Vec<u64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.with_retry("mget", || self.mget_once(keys)).await
    }

    async fn append(&self, topic: &str, payload: Bytes) -> Result<u64> {
        let mut conn = self.acquire().await?;
        let (_id, len): (String, u64) = self
            .timed(
                redis::pipe()
                    .atomic()
                    .cmd("XADD")
                    .arg(topic)
                    .arg("*")
                    .arg(PAYLOAD_FIELD)
                    .arg(payload.as_ref())
                    .cmd("XLEN")
                    .arg(topic)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(len)
    }

    async fn open_reader(&self) -> Result<Box<dyn TopicReader>> {
        self.check_open()?;
        let tuning = &self.config.tuning;
        let mut conn = match tokio::time::timeout(
            tuning.dial_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                return Err(StoreError::Connect {
                    addr: self.config.addr(),
                    reason: err.to_string(),
                });
            }
            Err(_) => return Err(StoreError::Timeout(tuning.dial_timeout)),
        };
        let client_id: i64 = self
            .timed(redis::cmd("CLIENT").arg("ID").query_async(&mut conn))
            .await?;
        debug!(client_id, "opened dedicated stream reader");
        Ok(Box::new(RedisReader {
            conn,
            read_timeout: tuning.read_timeout,
            unblock: Arc::new(RedisUnblock {
                pool: self.pool.clone(),
                client_id,
                timeout: tuning.command_timeout(),
            }),
        }))
    }

    fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            max_size: status.max_size,
            total: status.size,
            idle: status.available,
            in_use: status.size.saturating_sub(status.available),
            waiting: status.waiting,
            timeouts: self.pool_timeouts.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();
        if let Some(handle) = self.reaper.lock().await.take()
            && let Err(err) = handle.await
        {
            warn!(error = %err, "store reaper task failed");
        }
        self.pool.close();
        debug!(addr = %self.config.addr(), "store closed");
        Ok(())
    }
}

struct RedisReader {
    conn: MultiplexedConnection,
    read_timeout: Duration,
    unblock: Arc<RedisUnblock>,
}

#[async_trait]
impl TopicReader for RedisReader {
    async fn read(
        &mut self,
        cursors: &[(String, String)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<TopicEntry>> {
        if cursors.is_empty() {
            return Ok(Vec::new());
        }
        // BLOCK 0 would wait forever.
        let block_ms = (block.as_millis() as u64).max(1);
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS");
        for (topic, _) in cursors {
            cmd.arg(topic);
        }
        for (_, cursor) in cursors {
            cmd.arg(cursor);
        }

        let limit = block + self.read_timeout;
        let reply: Option<StreamReadReply> =
            match tokio::time::timeout(limit, cmd.query_async(&mut self.conn)).await {
                Ok(result) => result?,
                Err(_) => return Err(StoreError::Timeout(limit)),
            };
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
                    StoreError::Protocol(format!(
                        "stream entry {} on {} has no payload field",
                        entry.id, stream.key
                    ))
                })?;
                entries.push(TopicEntry {
                    topic: stream.key.clone(),
                    id: entry.id,
                    payload: Bytes::from(payload),
                });
            }
        }
        Ok(entries)
    }

    fn interrupter(&self) -> Arc<dyn ReadInterrupt> {
        self.unblock.clone()
    }
}

struct RedisUnblock {
    pool: Pool,
    client_id: i64,
    timeout: Duration,
}

#[async_trait]
impl ReadInterrupt for RedisUnblock {
    async fn interrupt(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let mut cmd = redis::cmd("CLIENT");
        cmd.arg("UNBLOCK").arg(self.client_id);
        let unblocked: redis::RedisResult<i64> =
            match tokio::time::timeout(self.timeout, cmd.query_async(&mut conn)).await {
                Ok(result) => result,
                Err(_) => return Err(StoreError::Timeout(self.timeout)),
            };
        // 0 means the reader was not blocked at that moment.
        unblocked?;
        Ok(())
    }
}

fn build_pool(config: &StoreConfig) -> Result<Pool> {
    let tuning = &config.tuning;
    let mut pool_config = PoolConfig::new(tuning.pool_size.max(1));
    pool_config.timeouts = Timeouts {
        wait: Some(tuning.pool_timeout),
        create: Some(tuning.dial_timeout),
        recycle: Some(tuning.read_timeout),
    };
    let mut cfg = deadpool_redis::Config::from_url(config.url());
    cfg.pool = Some(pool_config);
    let max_conn_age = tuning.max_conn_age;
    cfg.builder()
        .map_err(|err| StoreError::Pool(err.to_string()))?
        .runtime(Runtime::Tokio1)
        .pre_recycle(Hook::sync_fn(move |_, metrics| {
            if too_old(metrics.age(), max_conn_age) {
                return Err(HookError::Message("connection exceeded max age".into()));
            }
            Ok(())
        }))
        .build()
        .map_err(|err| StoreError::Pool(err.to_string()))
}

/// Connections at or past `max_age` are never handed out again.
fn too_old(age: Duration, max_age: Duration) -> bool {
    age >= max_age
}

fn pool_error(err: PoolError) -> StoreError {
    match err {
        PoolError::Timeout(_) => StoreError::PoolTimeout,
        PoolError::Closed => StoreError::Closed,
        PoolError::Backend(err) => StoreError::Command(err),
        other => StoreError::Pool(other.to_string()),
    }
}

/// Top the pool back up to `min_idle` connections.
async fn warm_pool(pool: &Pool, tuning: &PoolTuning) {
    let status = pool.status();
    if status.size >= tuning.min_idle {
        return;
    }
    // Holding min_idle handles at once forces the pool to open the missing ones.
    let wanted = tuning.min_idle.min(status.max_size);
    let mut held = Vec::with_capacity(wanted);
    for _ in 0..wanted {
        match tokio::time::timeout(tuning.dial_timeout, pool.get()).await {
            Ok(Ok(conn)) => held.push(conn),
            Ok(Err(err)) => {
                debug!(error = %err, "failed to warm store connection");
                break;
            }
            Err(_) => break,
        }
    }
    // Dropping the handles returns them to the pool as idle connections.
    drop(held);
}

async fn run_reaper(pool: Pool, tuning: PoolTuning, token: CancellationToken) {
    let mut ticker = tokio::time::interval(tuning.idle_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let before = pool.status().size;
        let max_age = tuning.max_conn_age;
        let idle_timeout = tuning.idle_timeout;
        let _ = pool.retain(|_, metrics| {
            !too_old(metrics.age(), max_age) && metrics.last_used() < idle_timeout
        });
        let evicted = before.saturating_sub(pool.status().size);
        if evicted > 0 {
            debug!(evicted, "reaped stale store connections");
        }
        warm_pool(&pool, &tuning).await;
    }
    debug!("store reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> StoreConfig {
        let mut config = StoreConfig::new("127.0.0.1", 1);
        config.tuning.max_retries = 0;
        config.tuning.dial_timeout = Duration::from_millis(200);
        config.tuning.pool_timeout = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn provision_fails_health_check_when_unreachable() {
        let token = CancellationToken::new();
        let err = match RedisStore::provision(unreachable_config(), &token).await {
            Ok(_) => panic!("provisioned against an unreachable host"),
            Err(err) => err,
        };
        assert!(
            matches!(err, StoreError::HealthCheck { ref addr, .. } if addr == "127.0.0.1:1"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn connections_past_max_age_are_too_old() {
        let max_age = Duration::from_secs(120);
        assert!(!too_old(Duration::from_secs(119), max_age));
        assert!(too_old(max_age, max_age));
        assert!(too_old(Duration::from_secs(600), max_age));
    }

    #[tokio::test]
    async fn pool_with_recycle_hook_builds_without_connecting() {
        let pool = build_pool(&unreachable_config()).expect("pool");
        let status = pool.status();
        assert_eq!(status.max_size, 5);
        assert_eq!(status.size, 0);
        pool.close();
    }

    #[test]
    fn closed_pool_maps_to_closed_store() {
        assert!(matches!(pool_error(PoolError::Closed), StoreError::Closed));
    }
}
