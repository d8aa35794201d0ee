// Shared pieces of the test harness binaries: run identity flags, logging
// and client construction.
use anyhow::{Context, Result};
use clap::Args;
use rendezvous_client::{ClientConfig, RunParams, StoreConfig, SyncClient};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run identity shared by every harness binary.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Test plan name
    #[arg(long, env = "TEST_PLAN", default_value = "harness")]
    pub plan: String,

    /// Test case name
    #[arg(long, env = "TEST_CASE", default_value = "default")]
    pub case: String,

    /// Run id; participants only see each other within the same run
    #[arg(long, env = "TEST_RUN", default_value = "local")]
    pub run: String,

    /// Group id reported in lifecycle events
    #[arg(long, env = "TEST_GROUP_ID", default_value = "single")]
    pub group: String,

    /// Number of participants in the run
    #[arg(long, env = "TEST_INSTANCE_COUNT", default_value = "1")]
    pub instances: u64,

    /// Optional YAML file overriding client tuning
    #[arg(long)]
    pub client_config: Option<String>,

    /// Optional YAML file overriding store pool tuning
    #[arg(long)]
    pub store_config: Option<String>,
}

impl RunArgs {
    pub fn params(&self) -> RunParams {
        RunParams::new(&self.plan, &self.case, &self.run)
            .with_group(&self.group)
            .with_instance_count(self.instances)
    }

    /// Connect a bound client using `REDIS_HOST` / `REDIS_PORT`.
    pub async fn connect(&self, shutdown: &CancellationToken) -> Result<SyncClient> {
        let store_config = StoreConfig::from_env_or_yaml(self.store_config.as_deref())?;
        let client_config = ClientConfig::from_env_or_yaml(self.client_config.as_deref())?;
        info!(addr = %store_config.addr(), run = %self.run, "Connecting to store");
        SyncClient::connect_bound(store_config, self.params(), client_config, shutdown)
            .await
            .context("connect sync client")
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
