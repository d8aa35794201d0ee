use super::*;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rendezvous_store::{PoolStats, TopicReader};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Greeting {
    from: u64,
    text: String,
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        barrier_poll_interval: Duration::from_millis(20),
        read_block: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

fn params(run: &str) -> RunParams {
    RunParams::new("plan", "case", run).with_group("group-a")
}

async fn bound_client(store: &MemoryStore, run: &str) -> SyncClient {
    SyncClient::new_bound(
        Arc::new(store.connect()),
        params(run),
        fast_config(),
        &CancellationToken::new(),
    )
    .await
    .expect("bound client")
}

// ===== Barrier tests =====

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barrier_releases_once_every_participant_signals() -> Result<()> {
    let store = MemoryStore::new();
    let participants = 5u64;
    let mut handles = Vec::new();
    for _ in 0..participants {
        let client = bound_client(&store, "run-barrier").await;
        handles.push(tokio::spawn(async move {
            let seq = client.signal_and_wait("ready", participants).await;
            client.close().await.expect("close");
            seq
        }));
    }

    let mut seqs = HashSet::new();
    for handle in handles {
        let seq = timeout(WAIT, handle).await??.expect("signal and wait");
        seqs.insert(seq);
    }
    assert_eq!(seqs, (1..=participants).collect::<HashSet<_>>());
    Ok(())
}

#[tokio::test]
async fn barrier_already_met_resolves_without_polling() -> Result<()> {
    let store = MemoryStore::new();
    let client = SyncClient::new_bound(
        Arc::new(store.connect()),
        params("run-met"),
        ClientConfig {
            barrier_poll_interval: Duration::from_secs(3600),
            ..ClientConfig::default()
        },
        &CancellationToken::new(),
    )
    .await?;
    client.signal_entry("done").await?;
    client.signal_entry("done").await?;

    let barrier = client.barrier("done", 2).await?;
    assert_eq!(barrier.target(), 2);
    assert_eq!(barrier.state().name(), "done");
    timeout(Duration::from_secs(1), barrier.wait()).await??;

    timeout(Duration::from_secs(1), client.barrier("done", 0).await?.wait()).await??;
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn barrier_token_cancels_only_that_wait() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-cancel").await;

    let cancel = CancellationToken::new();
    let cancelled = client.barrier_with_token("never", 10, cancel.clone()).await?;
    let other = client.barrier("later", 1).await?;
    cancel.cancel();
    let err = timeout(WAIT, cancelled.wait()).await?.expect_err("cancelled");
    assert!(matches!(err, SyncError::Cancelled));

    client.signal_entry("later").await?;
    timeout(WAIT, other.wait()).await??;
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_fails_pending_barriers_with_cancelled() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-close-barrier").await;
    let first = client.barrier("never", 3).await?;
    let second = client.barrier("never", 4).await?;

    client.close().await?;
    for barrier in [first, second] {
        let err = timeout(WAIT, barrier.wait()).await?.expect_err("closed");
        assert!(matches!(err, SyncError::Cancelled), "unexpected error: {err}");
    }
    Ok(())
}

#[tokio::test]
async fn dropped_barrier_is_forgotten() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-drop-barrier").await;
    drop(client.barrier("abandoned", 2).await?);
    tokio::time::sleep(Duration::from_millis(60)).await;

    client.signal_entry("abandoned").await?;
    client.signal_entry("abandoned").await?;
    timeout(WAIT, client.barrier("abandoned", 2).await?.wait()).await??;
    client.close().await?;
    Ok(())
}

// ===== Topic tests =====

#[tokio::test]
async fn late_subscriber_sees_every_message_in_order() -> Result<()> {
    let store = MemoryStore::new();
    let publisher = bound_client(&store, "run-topic").await;
    let subscriber = bound_client(&store, "run-topic").await;
    let topic = Topic::<Greeting>::new("greetings");

    for from in 1..=3 {
        let seq = publisher
            .publish(&topic, &Greeting { from, text: format!("hi {from}") })
            .await?;
        assert_eq!(seq, from);
    }

    let mut early = subscriber.subscribe(&topic).await?;
    for from in 1..=3 {
        let message = timeout(WAIT, early.next()).await?.expect("open")?;
        assert_eq!(message.from, from);
    }
    publisher
        .publish(&topic, &Greeting { from: 4, text: "late".into() })
        .await?;

    // A second local subscriber on a topic already being read still starts
    // from the first message.
    let mut late = subscriber.subscribe(&topic).await?;
    for from in 1..=4 {
        let message = timeout(WAIT, late.next()).await?.expect("open")?;
        assert_eq!(message.from, from);
    }
    let message = timeout(WAIT, early.next()).await?.expect("open")?;
    assert_eq!(message.from, 4);

    publisher.close().await?;
    subscriber.close().await?;
    Ok(())
}

#[tokio::test]
async fn subscribe_is_served_while_a_read_is_parked() -> Result<()> {
    let store = MemoryStore::new();
    let client = SyncClient::new_bound(
        Arc::new(store.connect()),
        params("run-interrupt"),
        ClientConfig {
            read_block: Duration::from_secs(60),
            ..fast_config()
        },
        &CancellationToken::new(),
    )
    .await?;
    let quiet = Topic::<u64>::new("quiet");
    let busy = Topic::<u64>::new("busy");

    let _quiet_sub = client.subscribe(&quiet).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut busy_sub = timeout(Duration::from_secs(2), client.subscribe(&busy)).await??;
    client.publish(&busy, &7).await?;
    let value = timeout(Duration::from_secs(2), busy_sub.next())
        .await?
        .expect("open")?;
    assert_eq!(value, 7);
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn dropping_one_subscription_keeps_the_others() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-unsub").await;
    let topic = Topic::<String>::new("news");

    let mut kept = client.subscribe(&topic).await?;
    let mut closed = client.subscribe(&topic).await?;
    closed.close();
    assert!(timeout(WAIT, closed.next()).await?.is_none());
    drop(closed);

    client.publish(&topic, &"first".to_string()).await?;
    let value = timeout(WAIT, kept.next()).await?.expect("open")?;
    assert_eq!(value, "first");
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_ends_every_subscription() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-close-sub").await;
    let mut a = client.subscribe(&Topic::<u64>::new("a")).await?;
    let mut b = client.subscribe(&Topic::<u64>::new("b")).await?;

    client.close().await?;
    assert!(timeout(WAIT, a.next()).await?.is_none());
    assert!(timeout(WAIT, b.next()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn undecodable_message_is_reported_without_ending_the_stream() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-decode").await;
    let topic = Topic::<Greeting>::new("mixed");
    let key = params("run-decode").keyspace().topic_key(topic.name());

    client
        .store()
        .append(&key, Bytes::from_static(b"not json"))
        .await?;
    client
        .publish(&topic, &Greeting { from: 1, text: "ok".into() })
        .await?;

    let mut sub = client.subscribe(&topic).await?;
    let first = timeout(WAIT, sub.next()).await?.expect("open");
    assert!(matches!(first, Err(SyncError::Decode(_))));
    let second = timeout(WAIT, sub.next()).await?.expect("open")?;
    assert_eq!(second.from, 1);
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn drop_new_policy_drops_for_a_full_subscriber() -> Result<()> {
    let store = MemoryStore::new();
    let client = SyncClient::new_bound(
        Arc::new(store.connect()),
        params("run-drop-new"),
        ClientConfig {
            subscription_buffer: 1,
            queue_policy: QueuePolicy::DropNew,
            ..fast_config()
        },
        &CancellationToken::new(),
    )
    .await?;
    let topic = Topic::<u64>::new("burst");
    for value in 1..=3 {
        client.publish(&topic, &value).await?;
    }

    let mut sub = client.subscribe(&topic).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(timeout(WAIT, sub.next()).await?.expect("open")?, 1);
    assert!(
        timeout(Duration::from_millis(300), sub.next()).await.is_err(),
        "dropped messages must not be delivered later"
    );
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn publish_subscribe_and_publish_and_wait() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-combined").await;
    let topic = Topic::<String>::new("combined");

    let (seq, mut sub) = client.publish_subscribe(&topic, &"mine".to_string()).await?;
    assert_eq!(seq, 1);
    assert_eq!(timeout(WAIT, sub.next()).await?.expect("open")?, "mine");

    let seq = timeout(
        WAIT,
        client.publish_and_wait(&topic, &"second".to_string(), "published", 1),
    )
    .await??;
    assert_eq!(seq, 2);
    assert_eq!(timeout(WAIT, sub.next()).await?.expect("open")?, "second");
    client.close().await?;
    Ok(())
}

// ===== Counters, events and lifecycle =====

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequence_numbers_are_unique_across_clients() -> Result<()> {
    let store = MemoryStore::new();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let client = bound_client(&store, "run-seq").await;
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..25 {
                seen.push(client.sequence_number("ids").await.expect("seq"));
            }
            client.close().await.expect("close");
            seen
        }));
    }
    let mut all = HashSet::new();
    for handle in handles {
        let seen = handle.await?;
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(seen);
    }
    assert_eq!(all.len(), 100);
    assert_eq!(all.iter().max().copied(), Some(100));
    Ok(())
}

#[tokio::test]
async fn runs_do_not_see_each_other() -> Result<()> {
    let store = MemoryStore::new();
    let a = bound_client(&store, "run-a").await;
    let b = bound_client(&store, "run-b").await;

    assert_eq!(a.signal_entry("ready").await?, 1);
    assert_eq!(b.signal_entry("ready").await?, 1);
    assert_eq!(a.sequence_number("ids").await?, 1);
    assert_eq!(b.sequence_number("ids").await?, 1);

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn lifecycle_events_round_trip() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-events").await;
    let group_id = client.run_params()?.test_group_id.clone();

    client
        .signal_event(&Event::Start {
            group_id: group_id.clone(),
        })
        .await?;
    client
        .signal_event(&Event::Success {
            group_id: group_id.clone(),
        })
        .await?;

    let mut events = client.subscribe_events().await?;
    let first = timeout(WAIT, events.next()).await?.expect("open")?;
    assert_eq!(first, Event::Start { group_id: group_id.clone() });
    let second = timeout(WAIT, events.next()).await?.expect("open")?;
    assert!(second.is_terminal());
    assert_eq!(second.group_id(), "group-a");
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn generic_client_requires_run_params_in_scope() -> Result<()> {
    let store = MemoryStore::new();
    let client = SyncClient::new_generic(
        Arc::new(store.connect()),
        fast_config(),
        &CancellationToken::new(),
    )
    .await?;

    let err = client.signal_entry("ready").await.expect_err("no params");
    assert!(matches!(err, SyncError::NoRunParameters));
    assert!(matches!(
        client.barrier("ready", 1).await,
        Err(SyncError::NoRunParameters)
    ));
    assert!(matches!(
        client.subscribe(&Topic::<u64>::new("t")).await,
        Err(SyncError::NoRunParameters)
    ));

    let seq = with_run_params(params("run-generic"), client.signal_entry("ready")).await?;
    assert_eq!(seq, 1);
    let other = with_run_params(params("run-other"), client.signal_entry("ready")).await?;
    assert_eq!(other, 1);

    let bound = bound_client(&store, "run-generic").await;
    assert_eq!(bound.signal_entry("ready").await?, 2);

    client.close().await?;
    bound.close().await?;
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_later_calls() -> Result<()> {
    let store = MemoryStore::new();
    let client = bound_client(&store, "run-idempotent").await;
    let clone = client.clone();

    client.close().await?;
    clone.close().await?;
    assert!(client.is_closed());

    assert!(matches!(client.signal_entry("x").await, Err(SyncError::Closed)));
    assert!(matches!(client.barrier("x", 1).await, Err(SyncError::Closed)));
    assert!(matches!(
        client.publish(&Topic::<u64>::new("t"), &1).await,
        Err(SyncError::Closed)
    ));
    assert!(matches!(
        client.subscribe(&Topic::<u64>::new("t")).await,
        Err(SyncError::Closed)
    ));
    assert!(matches!(client.store().ping().await, Err(StoreError::Closed)));
    assert!(store.ping().await.is_ok());
    Ok(())
}

#[tokio::test]
async fn parent_cancellation_stops_the_client() -> Result<()> {
    let store = MemoryStore::new();
    let parent = CancellationToken::new();
    let client = SyncClient::new_bound(
        Arc::new(store.connect()),
        params("run-parent"),
        fast_config(),
        &parent,
    )
    .await?;
    let barrier = client.barrier("never", 2).await?;
    let mut sub = client.subscribe(&Topic::<u64>::new("t")).await?;

    parent.cancel();
    assert!(matches!(
        timeout(WAIT, barrier.wait()).await?,
        Err(SyncError::Cancelled)
    ));
    assert!(timeout(WAIT, sub.next()).await?.is_none());
    assert!(matches!(client.signal_entry("x").await, Err(SyncError::Closed)));
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn construction_fails_on_a_closed_store() {
    let store = MemoryStore::new();
    store.close().await.expect("close store");
    let result = SyncClient::new_bound(
        Arc::new(store),
        params("run-closed-store"),
        fast_config(),
        &CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(SyncError::Store(StoreError::Closed))));
}

// ===== Shutdown bound tests =====

/// Memory store whose counter commands can be slowed down, recording any
/// command that still runs after the store was closed.
#[derive(Default)]
struct SlowStore {
    inner: MemoryStore,
    delay_ms: AtomicU64,
    closed: AtomicBool,
    calls_after_close: AtomicUsize,
}

impl SlowStore {
    fn slow_down(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn delay(&self) {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            self.calls_after_close.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SyncStore for SlowStore {
    async fn ping(&self) -> rendezvous_store::Result<()> {
        self.inner.ping().await
    }

    async fn incr(&self, key: &str) -> rendezvous_store::Result<u64> {
        self.delay().await;
        self.inner.incr(key).await
    }

    async fn get_counters(&self, keys: &[String]) -> rendezvous_store::Result<Vec<u64>> {
        self.delay().await;
        self.inner.get_counters(keys).await
    }

    async fn append(&self, topic: &str, payload: Bytes) -> rendezvous_store::Result<u64> {
        self.inner.append(topic, payload).await
    }

    async fn open_reader(&self) -> rendezvous_store::Result<Box<dyn TopicReader>> {
        self.inner.open_reader().await
    }

    fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }

    async fn close(&self) -> rendezvous_store::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.inner.close().await
    }
}

#[tokio::test]
async fn close_does_not_wait_for_a_hung_barrier_check() -> Result<()> {
    let store = Arc::new(SlowStore::default());
    let client = SyncClient::new_bound(
        store.clone(),
        params("run-hung-barrier"),
        fast_config(),
        &CancellationToken::new(),
    )
    .await?;
    let barrier = client.barrier("ready", 2).await?;
    store.slow_down(Duration::from_secs(60));
    // Let a poll tick start the slow read.
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(Duration::from_secs(3), client.close())
        .await
        .expect("close waited on the store")?;
    let err = timeout(Duration::from_secs(3), barrier.wait())
        .await?
        .expect_err("cancelled");
    assert!(err.is_cancellation(), "unexpected error: {err}");
    Ok(())
}

#[tokio::test]
async fn close_does_not_wait_for_a_full_subscriber_queue() -> Result<()> {
    let store = MemoryStore::new();
    let client = SyncClient::new_bound(
        Arc::new(store.connect()),
        params("run-full-queue"),
        ClientConfig {
            subscription_buffer: 1,
            ..fast_config()
        },
        &CancellationToken::new(),
    )
    .await?;
    assert!(matches!(client.config().queue_policy, QueuePolicy::Block { .. }));
    let topic = Topic::<u64>::new("backlog");
    for value in 1..=6 {
        client.publish(&topic, &value).await?;
    }
    let key = params("run-full-queue").keyspace().topic_key(topic.name());
    assert_eq!(store.topic_len(&key), 6);

    let mut sub = client.subscribe(&topic).await?;
    // The first message fills the queue; the manager is now waiting for room.
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(Duration::from_secs(3), client.close())
        .await
        .expect("close waited on a full subscriber queue")?;
    assert_eq!(timeout(WAIT, sub.next()).await?.expect("queued")?, 1);
    assert!(timeout(WAIT, sub.next()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn no_store_command_runs_after_close_returns() -> Result<()> {
    let store = Arc::new(SlowStore::default());
    let client = SyncClient::new_bound(
        store.clone(),
        params("run-inflight"),
        fast_config(),
        &CancellationToken::new(),
    )
    .await?;
    store.slow_down(Duration::from_millis(300));

    let signaller = client.clone();
    let signal = tokio::spawn(async move { signaller.signal_entry("ready").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(WAIT, client.close()).await??;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.calls_after_close.load(Ordering::SeqCst), 0);

    let err = timeout(WAIT, signal).await??.expect_err("closed mid-command");
    assert!(matches!(err, SyncError::Closed));
    assert!(err.is_cancellation());
    Ok(())
}

// ===== Config tests =====

struct EnvGuard {
    keys: &'static [&'static str],
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in self.keys {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }
}

const CONFIG_ENV_KEYS: &[&str] = &[
    "RENDEZVOUS_BARRIER_POLL_MS",
    "RENDEZVOUS_SUB_BUFFER",
    "RENDEZVOUS_SUB_QUEUE_POLICY",
    "RENDEZVOUS_SUB_BLOCK_TIMEOUT_MS",
    "RENDEZVOUS_READ_BLOCK_MS",
    "RENDEZVOUS_READ_BATCH",
    "RENDEZVOUS_POOL_STATS_MS",
    config::ENV_CLIENT_CONFIG,
];

#[test]
#[serial_test::serial]
fn config_defaults_without_env() {
    let _env_guard = EnvGuard {
        keys: CONFIG_ENV_KEYS,
    };
    for key in CONFIG_ENV_KEYS {
        unsafe {
            std::env::remove_var(key);
        }
    }
    let config = ClientConfig::from_env_or_yaml(None).expect("config");
    assert_eq!(config, ClientConfig::default());
    assert_eq!(config.barrier_poll_interval, Duration::from_secs(1));
    assert_eq!(
        config.queue_policy,
        QueuePolicy::Block {
            timeout: Duration::from_secs(5)
        }
    );
}

#[test]
#[serial_test::serial]
fn config_reads_env_overrides() {
    let _env_guard = EnvGuard {
        keys: CONFIG_ENV_KEYS,
    };
    unsafe {
        std::env::set_var("RENDEZVOUS_BARRIER_POLL_MS", "250");
        std::env::set_var("RENDEZVOUS_SUB_BUFFER", "8");
        std::env::set_var("RENDEZVOUS_SUB_QUEUE_POLICY", "drop_new");
        std::env::set_var("RENDEZVOUS_READ_BATCH", "0");
    }
    let config = ClientConfig::from_env();
    assert_eq!(config.barrier_poll_interval, Duration::from_millis(250));
    assert_eq!(config.subscription_buffer, 8);
    assert_eq!(config.queue_policy, QueuePolicy::DropNew);
    assert_eq!(config.read_batch, ClientConfig::default().read_batch);
}

#[test]
#[serial_test::serial]
fn config_yaml_overrides_env() {
    let _env_guard = EnvGuard {
        keys: CONFIG_ENV_KEYS,
    };
    unsafe {
        std::env::set_var("RENDEZVOUS_SUB_BUFFER", "8");
    }
    let path = std::env::temp_dir().join(format!(
        "rendezvous-client-config-{}.yaml",
        std::process::id()
    ));
    let mut file = std::fs::File::create(&path).expect("create yaml");
    writeln!(
        file,
        "subscription_buffer: 64\nsubscription_queue_policy: block\nsubscription_block_timeout_ms: 75\nread_block_ms: 0"
    )
    .expect("write yaml");
    let config = ClientConfig::from_env_or_yaml(path.to_str()).expect("config");
    let _ = std::fs::remove_file(&path);

    assert_eq!(config.subscription_buffer, 64);
    assert_eq!(
        config.queue_policy,
        QueuePolicy::Block {
            timeout: Duration::from_millis(75)
        }
    );
    assert_eq!(config.read_block, ClientConfig::default().read_block);
}

#[test]
#[serial_test::serial]
fn config_rejects_malformed_yaml() {
    let _env_guard = EnvGuard {
        keys: CONFIG_ENV_KEYS,
    };
    let path = std::env::temp_dir().join(format!(
        "rendezvous-client-bad-{}.yaml",
        std::process::id()
    ));
    std::fs::write(&path, "subscription_buffer: [not, a, number]").expect("write yaml");
    let err = ClientConfig::from_env_or_yaml(path.to_str()).expect_err("bad yaml");
    let _ = std::fs::remove_file(&path);
    assert!(err.to_string().contains("parse client config yaml"));
}
