// Store address resolution and connection pool tuning.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::StoreError;

pub const ENV_REDIS_HOST: &str = "REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";
pub const ENV_STORE_CONFIG: &str = "RENDEZVOUS_STORE_CONFIG";

pub(crate) const DEFAULT_HOST: &str = "localhost";
pub(crate) const DEFAULT_PORT: u16 = 6379;
pub(crate) const DEFAULT_MIN_IDLE: usize = 2;
pub(crate) const DEFAULT_POOL_SIZE: usize = 5;
pub(crate) const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 30;
pub(crate) const DEFAULT_MIN_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_MAX_CONN_AGE: Duration = Duration::from_secs(2 * 60);

/// Fixed connection pool tuning. The defaults favour many short-lived
/// participants sharing one store over raw throughput.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTuning {
    pub min_idle: usize,
    pub pool_size: usize,
    pub pool_timeout: Duration,
    pub max_retries: u32,
    pub min_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_check_interval: Duration,
    pub idle_timeout: Duration,
    pub max_conn_age: Duration,
}

impl Default for PoolTuning {
    fn default() -> Self {
        Self {
            min_idle: DEFAULT_MIN_IDLE,
            pool_size: DEFAULT_POOL_SIZE,
            pool_timeout: DEFAULT_POOL_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            min_retry_backoff: DEFAULT_MIN_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            dial_timeout: DEFAULT_IO_TIMEOUT,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_conn_age: DEFAULT_MAX_CONN_AGE,
        }
    }
}

impl PoolTuning {
    /// Upper bound for a single command round trip.
    pub fn command_timeout(&self) -> Duration {
        self.write_timeout + self.read_timeout
    }
}

/// Where the store lives and how to talk to it.
///
/// ```
/// use rendezvous_store::StoreConfig;
///
/// let config = StoreConfig::new("redis.internal", 6380);
/// assert_eq!(config.addr(), "redis.internal:6380");
/// assert_eq!(config.tuning.pool_size, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub tuning: PoolTuning,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct StoreConfigOverride {
    min_idle: Option<usize>,
    pool_size: Option<usize>,
    pool_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    min_retry_backoff_ms: Option<u64>,
    max_retry_backoff_ms: Option<u64>,
    dial_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    idle_check_interval_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    max_conn_age_ms: Option<u64>,
}

impl StoreConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tuning: PoolTuning::default(),
        }
    }

    /// Resolve the address from `REDIS_HOST` and `REDIS_PORT`.
    ///
    /// An unset host falls back to `localhost`; an unset port to 6379. A port
    /// that does not parse is an error rather than a silent default.
    pub fn from_env() -> Result<Self, StoreError> {
        let host = std::env::var(ENV_REDIS_HOST)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match std::env::var(ENV_REDIS_PORT) {
            Ok(value) if !value.is_empty() => parse_port(&value)?,
            _ => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env().context("resolve store address")?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var(ENV_STORE_CONFIG).ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read store config: {path}"))?;
            let override_cfg: StoreConfigOverride =
                serde_yaml::from_str(&contents).context("parse store config yaml")?;
            override_cfg.apply(&mut config.tuning);
        }
        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl StoreConfigOverride {
    fn apply(&self, tuning: &mut PoolTuning) {
        if let Some(value) = self.min_idle {
            tuning.min_idle = value;
        }
        if let Some(value) = self.pool_size
            && value > 0
        {
            tuning.pool_size = value;
        }
        if let Some(value) = self.max_retries {
            tuning.max_retries = value;
        }
        let durations = [
            (self.pool_timeout_ms, &mut tuning.pool_timeout),
            (self.min_retry_backoff_ms, &mut tuning.min_retry_backoff),
            (self.max_retry_backoff_ms, &mut tuning.max_retry_backoff),
            (self.dial_timeout_ms, &mut tuning.dial_timeout),
            (self.read_timeout_ms, &mut tuning.read_timeout),
            (self.write_timeout_ms, &mut tuning.write_timeout),
            (self.idle_check_interval_ms, &mut tuning.idle_check_interval),
            (self.idle_timeout_ms, &mut tuning.idle_timeout),
            (self.max_conn_age_ms, &mut tuning.max_conn_age),
        ];
        for (value, slot) in durations {
            if let Some(ms) = value
                && ms > 0
            {
                *slot = Duration::from_millis(ms);
            }
        }
        if tuning.min_idle > tuning.pool_size {
            tuning.min_idle = tuning.pool_size;
        }
    }
}

fn parse_port(value: &str) -> Result<u16, StoreError> {
    value
        .parse::<u16>()
        .map_err(|_| StoreError::InvalidPort(value.to_string()))
}
