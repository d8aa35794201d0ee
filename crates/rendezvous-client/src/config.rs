// Client-side defaults and tuning for the barrier and subscription managers.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const ENV_CLIENT_CONFIG: &str = "RENDEZVOUS_CLIENT_CONFIG";

// Requests are handed to the managers one at a time.
pub(crate) const REQUEST_QUEUE_DEPTH: usize = 1;
pub(crate) const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);

pub(crate) const DEFAULT_BARRIER_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;
pub(crate) const DEFAULT_SUBSCRIPTION_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_READ_BLOCK: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_READ_BATCH: usize = 256;
pub(crate) const DEFAULT_POOL_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// What the subscription manager does when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Wait for room up to `timeout`, then drop the message for that
    /// subscriber only.
    Block { timeout: Duration },
    /// Drop the message immediately.
    DropNew,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Block {
            timeout: DEFAULT_SUBSCRIPTION_BLOCK_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How often pending barriers are re-checked against the store.
    pub barrier_poll_interval: Duration,
    pub subscription_buffer: usize,
    pub queue_policy: QueuePolicy,
    /// Longest a single blocking topic read waits for new entries.
    pub read_block: Duration,
    /// Maximum entries fetched per topic per read.
    pub read_batch: usize,
    pub pool_stats_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            barrier_poll_interval: DEFAULT_BARRIER_POLL_INTERVAL,
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            queue_policy: QueuePolicy::default(),
            read_block: DEFAULT_READ_BLOCK,
            read_batch: DEFAULT_READ_BATCH,
            pool_stats_interval: DEFAULT_POOL_STATS_INTERVAL,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    barrier_poll_interval_ms: Option<u64>,
    subscription_buffer: Option<usize>,
    subscription_queue_policy: Option<String>,
    subscription_block_timeout_ms: Option<u64>,
    read_block_ms: Option<u64>,
    read_batch: Option<usize>,
    pool_stats_interval_ms: Option<u64>,
}

impl ClientConfig {
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var(ENV_CLIENT_CONFIG).ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_millis_env("RENDEZVOUS_BARRIER_POLL_MS") {
            config.barrier_poll_interval = value;
        }
        if let Some(value) = read_usize_env("RENDEZVOUS_SUB_BUFFER") {
            config.subscription_buffer = value;
        }
        let block_timeout = read_millis_env("RENDEZVOUS_SUB_BLOCK_TIMEOUT_MS");
        if let Ok(value) = std::env::var("RENDEZVOUS_SUB_QUEUE_POLICY")
            && let Some(policy) = parse_policy(&value, block_timeout)
        {
            config.queue_policy = policy;
        } else if let Some(timeout) = block_timeout {
            config.queue_policy = QueuePolicy::Block { timeout };
        }
        if let Some(value) = read_millis_env("RENDEZVOUS_READ_BLOCK_MS") {
            config.read_block = value;
        }
        if let Some(value) = read_usize_env("RENDEZVOUS_READ_BATCH") {
            config.read_batch = value;
        }
        if let Some(value) = read_millis_env("RENDEZVOUS_POOL_STATS_MS") {
            config.pool_stats_interval = value;
        }
        config
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.barrier_poll_interval_ms
            && value > 0
        {
            config.barrier_poll_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.subscription_buffer
            && value > 0
        {
            config.subscription_buffer = value;
        }
        let block_timeout = self
            .subscription_block_timeout_ms
            .filter(|value| *value > 0)
            .map(Duration::from_millis);
        if let Some(value) = &self.subscription_queue_policy
            && let Some(policy) = parse_policy(value, block_timeout)
        {
            config.queue_policy = policy;
        } else if let Some(timeout) = block_timeout
            && matches!(config.queue_policy, QueuePolicy::Block { .. })
        {
            config.queue_policy = QueuePolicy::Block { timeout };
        }
        if let Some(value) = self.read_block_ms
            && value > 0
        {
            config.read_block = Duration::from_millis(value);
        }
        if let Some(value) = self.read_batch
            && value > 0
        {
            config.read_batch = value;
        }
        if let Some(value) = self.pool_stats_interval_ms
            && value > 0
        {
            config.pool_stats_interval = Duration::from_millis(value);
        }
    }
}

fn parse_policy(value: &str, block_timeout: Option<Duration>) -> Option<QueuePolicy> {
    match value {
        "block" => Some(QueuePolicy::Block {
            timeout: block_timeout.unwrap_or(DEFAULT_SUBSCRIPTION_BLOCK_TIMEOUT),
        }),
        "drop_new" => Some(QueuePolicy::DropNew),
        _ => None,
    }
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}
