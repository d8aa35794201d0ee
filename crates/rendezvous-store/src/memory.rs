//! In-process store with the same semantics as the Redis backend.
//!
//! Counters and topic streams live behind one mutex; blocking reads park on a
//! [`Notify`] that every append wakes. Entry ids mimic stream ids
//! (`<position>-0`) so cursors behave the same way against both backends.
//!
//! [`MemoryStore::connect`] hands out another handle on the same data with
//! its own open/closed state, the way separate processes each hold their own
//! connection to one server.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use crate::{
    PoolStats, ReadInterrupt, Result, StoreError, SyncStore, TopicEntry, TopicReader,
};

#[derive(Default)]
struct State {
    counters: HashMap<String, u64>,
    topics: HashMap<String, Vec<Bytes>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

fn check_open(closed: &AtomicBool) -> Result<()> {
    if closed.load(Ordering::Acquire) {
        return Err(StoreError::Closed);
    }
    Ok(())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new handle on the same data. Closing it leaves other handles open.
    pub fn connect(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_open(&self) -> Result<()> {
        check_open(&self.closed)
    }

    /// Number of entries currently held by a topic stream.
    pub fn topic_len(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_open()
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        self.check_open()?;
        let mut state = self.shared.lock();
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn get_counters(&self, keys: &[String]) -> Result<Vec<u64>> {
        self.check_open()?;
        let state = self.shared.lock();
        Ok(keys
            .iter()
            .map(|key| state.counters.get(key).copied().unwrap_or(0))
            .collect())
    }

    async fn append(&self, topic: &str, payload: Bytes) -> Result<u64> {
        self.check_open()?;
        let position = {
            let mut state = self.shared.lock();
            let stream = state.topics.entry(topic.to_string()).or_default();
            stream.push(payload);
            stream.len() as u64
        };
        self.shared.appended.notify_waiters();
        Ok(position)
    }

    async fn open_reader(&self) -> Result<Box<dyn TopicReader>> {
        self.check_open()?;
        Ok(Box::new(MemoryReader {
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
            interrupt: Arc::new(MemoryInterrupt::default()),
        }))
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats::default()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.shared.appended.notify_waiters();
        Ok(())
    }
}

struct MemoryReader {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
    interrupt: Arc<MemoryInterrupt>,
}

#[derive(Default)]
struct MemoryInterrupt {
    notify: Notify,
}

#[async_trait]
impl ReadInterrupt for MemoryInterrupt {
    async fn interrupt(&self) -> Result<()> {
        // notify_one keeps a permit when nobody is parked yet, so an interrupt
        // sent just before the read starts still ends it.
        self.notify.notify_one();
        Ok(())
    }
}

impl MemoryReader {
    fn collect(&self, cursors: &[(String, String)], count: usize) -> Result<Vec<TopicEntry>> {
        let state = self.shared.lock();
        let mut entries = Vec::new();
        for (topic, cursor) in cursors {
            let Some(stream) = state.topics.get(topic) else {
                continue;
            };
            let after = parse_position(cursor)?;
            let start = usize::try_from(after).unwrap_or(usize::MAX).min(stream.len());
            for (offset, payload) in stream[start..].iter().take(count.max(1)).enumerate() {
                entries.push(TopicEntry {
                    topic: topic.clone(),
                    id: format!("{}-0", start + offset + 1),
                    payload: payload.clone(),
                });
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl TopicReader for MemoryReader {
    async fn read(
        &mut self,
        cursors: &[(String, String)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<TopicEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            check_open(&self.closed)?;
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let entries = self.collect(cursors, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            tokio::select! {
                _ = &mut appended => continue,
                _ = self.interrupt.notify.notified() => return Ok(Vec::new()),
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    fn interrupter(&self) -> Arc<dyn ReadInterrupt> {
        self.interrupt.clone()
    }
}

fn parse_position(cursor: &str) -> Result<u64> {
    let head = cursor.split('-').next().unwrap_or(cursor);
    head.parse::<u64>()
        .map_err(|_| StoreError::Protocol(format!("invalid stream cursor {cursor:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::STREAM_START;
    use tokio::time::timeout;

    #[tokio::test]
    async fn counters_increment_and_read_back() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("a").await.expect("incr"), 1);
        assert_eq!(store.incr("a").await.expect("incr"), 2);
        let values = store
            .get_counters(&["a".to_string(), "missing".to_string()])
            .await
            .expect("get");
        assert_eq!(values, vec![2, 0]);
    }

    #[tokio::test]
    async fn reader_sees_history_then_follows_appends() {
        let store = MemoryStore::new();
        assert_eq!(store.append("t", Bytes::from_static(b"one")).await.expect("append"), 1);
        let mut reader = store.open_reader().await.expect("reader");

        let cursors = vec![("t".to_string(), STREAM_START.to_string())];
        let first = reader
            .read(&cursors, 16, Duration::from_secs(1))
            .await
            .expect("read");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, Bytes::from_static(b"one"));

        let cursors = vec![("t".to_string(), first[0].id.clone())];
        let writer = store.clone();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("t", Bytes::from_static(b"two")).await
        });
        let next = timeout(
            Duration::from_secs(2),
            reader.read(&cursors, 16, Duration::from_secs(5)),
        )
        .await
        .expect("read timed out")
        .expect("read");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, Bytes::from_static(b"two"));
        assert_eq!(pending.await.expect("join").expect("append"), 2);
    }

    #[tokio::test]
    async fn interrupt_ends_a_blocked_read() {
        let store = MemoryStore::new();
        let mut reader = store.open_reader().await.expect("reader");
        let interrupter = reader.interrupter();
        interrupter.interrupt().await.expect("interrupt");
        let cursors = vec![("idle".to_string(), STREAM_START.to_string())];
        let entries = timeout(
            Duration::from_secs(1),
            reader.read(&cursors, 16, Duration::from_secs(30)),
        )
        .await
        .expect("interrupt ignored")
        .expect("read");
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn connected_handles_share_data_but_close_independently() {
        let store = MemoryStore::new();
        let other = store.connect();
        assert_eq!(store.incr("a").await.expect("incr"), 1);
        other.close().await.expect("close");
        assert!(matches!(other.incr("a").await, Err(StoreError::Closed)));
        assert_eq!(store.incr("a").await.expect("incr"), 2);
    }

    #[tokio::test]
    async fn commands_fail_after_close() {
        let store = MemoryStore::new();
        store.close().await.expect("close");
        store.close().await.expect("second close");
        assert!(matches!(store.incr("a").await, Err(StoreError::Closed)));
        assert!(matches!(store.ping().await, Err(StoreError::Closed)));
    }
}
