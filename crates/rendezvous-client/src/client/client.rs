//! Client façade: construction, run identity and shutdown.
use rendezvous_common::{Keyspace, RunParams};
use rendezvous_store::{RedisStore, StoreConfig, SyncStore};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Level, debug, error};

use crate::client::barrier::{BarrierRequest, run_barrier_manager};
use crate::client::sampler::run_pool_sampler;
use crate::client::subscription::{
    SubscriptionManager, SubscriptionRequest, run_subscription_manager,
};
use crate::config::{ClientConfig, REQUEST_QUEUE_DEPTH};
use crate::error::{Result, SyncError};
use crate::run::current_run_params;

/// Where a client takes its run identity from.
#[derive(Debug, Clone)]
pub(crate) enum RunIdentity {
    /// Fixed when the client was built.
    Bound {
        params: Arc<RunParams>,
        keyspace: Keyspace,
    },
    /// Read from the calling task on every operation.
    Generic,
}

/// Handle to the run synchronization service.
///
/// Cloning is cheap and every clone drives the same managers. Call
/// [`SyncClient::close`] once the run is over; it cancels outstanding waits,
/// stops the background tasks and releases the store.
#[derive(Clone)]
pub struct SyncClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) store: Arc<dyn SyncStore>,
    pub(crate) identity: RunIdentity,
    pub(crate) config: ClientConfig,
    pub(crate) token: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) barrier_tx: mpsc::Sender<BarrierRequest>,
    pub(crate) subscription_tx: mpsc::Sender<SubscriptionRequest>,
    pub(crate) unsubscribe_tx: mpsc::UnboundedSender<u64>,
    pub(crate) closed: AtomicBool,
}

impl SyncClient {
    /// Client whose every operation is scoped to `params`.
    pub async fn new_bound(
        store: Arc<dyn SyncStore>,
        params: RunParams,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let keyspace = params.keyspace();
        let identity = RunIdentity::Bound {
            params: Arc::new(params),
            keyspace,
        };
        Self::start(store, identity, config, parent).await
    }

    /// Client that resolves the run per operation from the calling task; see
    /// [`crate::with_run_params`].
    pub async fn new_generic(
        store: Arc<dyn SyncStore>,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        Self::start(store, RunIdentity::Generic, config, parent).await
    }

    /// Provision a Redis store, then build a bound client on top of it.
    pub async fn connect_bound(
        store_config: StoreConfig,
        params: RunParams,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let store = provision(store_config, parent).await?;
        match Self::new_bound(store.clone(), params, config, parent).await {
            Ok(client) => Ok(client),
            Err(err) => {
                let _ = store.close().await;
                Err(err)
            }
        }
    }

    /// Provision a Redis store, then build a generic client on top of it.
    pub async fn connect_generic(
        store_config: StoreConfig,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let store = provision(store_config, parent).await?;
        match Self::new_generic(store.clone(), config, parent).await {
            Ok(client) => Ok(client),
            Err(err) => {
                let _ = store.close().await;
                Err(err)
            }
        }
    }

    /// Bound client configured from the environment. Exits the process with
    /// status 1 if it cannot be built.
    pub async fn must_bound(params: RunParams, parent: &CancellationToken) -> Self {
        let result = async {
            let store_config = StoreConfig::from_env_or_yaml(None)?;
            let config = ClientConfig::from_env_or_yaml(None)?;
            Ok::<_, anyhow::Error>(
                Self::connect_bound(store_config, params, config, parent).await?,
            )
        }
        .await;
        result.unwrap_or_else(|err| fail_fast(err))
    }

    /// Generic client configured from the environment. Exits the process with
    /// status 1 if it cannot be built.
    pub async fn must_generic(parent: &CancellationToken) -> Self {
        let result = async {
            let store_config = StoreConfig::from_env_or_yaml(None)?;
            let config = ClientConfig::from_env_or_yaml(None)?;
            Ok::<_, anyhow::Error>(Self::connect_generic(store_config, config, parent).await?)
        }
        .await;
        result.unwrap_or_else(|err| fail_fast(err))
    }

    async fn start(
        store: Arc<dyn SyncStore>,
        identity: RunIdentity,
        config: ClientConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let reader = store.open_reader().await?;
        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let (barrier_tx, barrier_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (subscription_tx, subscription_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::unbounded_channel();

        tracker.spawn(run_barrier_manager(
            store.clone(),
            barrier_rx,
            token.clone(),
            config.barrier_poll_interval,
        ));
        tracker.spawn(run_subscription_manager(SubscriptionManager {
            reader,
            requests: subscription_rx,
            unsubscribe: unsubscribe_rx,
            token: token.clone(),
            queue_policy: config.queue_policy,
            read_block: config.read_block,
            read_batch: config.read_batch,
        }));
        if tracing::enabled!(Level::DEBUG) {
            tracker.spawn(run_pool_sampler(
                store.clone(),
                token.clone(),
                config.pool_stats_interval,
            ));
        }
        tracker.close();

        let mode = match identity {
            RunIdentity::Bound { .. } => "bound",
            RunIdentity::Generic => "generic",
        };
        debug!(mode, "sync client started");
        Ok(Self {
            inner: Arc::new(ClientInner {
                store,
                identity,
                config,
                token,
                tracker,
                barrier_tx,
                subscription_tx,
                unsubscribe_tx,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Cancel outstanding work, wait for every background task and close the
    /// store. Safe to call more than once; later calls only wait.
    pub async fn close(&self) -> Result<()> {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        self.inner.token.cancel();
        self.inner.tracker.wait().await;
        if !first {
            return Ok(());
        }
        self.inner.store.close().await?;
        debug!("sync client closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The raw store behind this client.
    ///
    /// Commands go straight to the pool. Do not issue blocking reads through
    /// it; those belong to the managers.
    pub fn store(&self) -> Arc<dyn SyncStore> {
        self.inner.store.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Run identity in effect for the calling task.
    pub fn run_params(&self) -> Result<Arc<RunParams>> {
        match &self.inner.identity {
            RunIdentity::Bound { params, .. } => Ok(params.clone()),
            RunIdentity::Generic => current_run_params().ok_or(SyncError::NoRunParameters),
        }
    }

    pub(crate) fn keyspace(&self) -> Result<Keyspace> {
        match &self.inner.identity {
            RunIdentity::Bound { keyspace, .. } => Ok(keyspace.clone()),
            RunIdentity::Generic => current_run_params()
                .map(|params| params.keyspace())
                .ok_or(SyncError::NoRunParameters),
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || self.inner.token.is_cancelled() {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    /// Run a direct store command as tracked work. `close` waits for it, and
    /// it is abandoned as soon as the client shuts down, so no command is
    /// still running once `close` returns.
    pub(crate) async fn tracked<T, F>(&self, command: F) -> Result<T>
    where
        F: Future<Output = rendezvous_store::Result<T>>,
    {
        self.inner
            .tracker
            .track_future(async {
                self.ensure_open()?;
                tokio::select! {
                    _ = self.inner.token.cancelled() => Err(SyncError::Closed),
                    result = command => result.map_err(SyncError::from),
                }
            })
            .await
    }

    /// Hand a request to a manager, giving up if the client shuts down first.
    pub(crate) async fn send_request<R>(&self, tx: &mpsc::Sender<R>, request: R) -> Result<()> {
        tokio::select! {
            sent = tx.send(request) => sent.map_err(|_| SyncError::Closed),
            _ = self.inner.token.cancelled() => Err(SyncError::Closed),
        }
    }
}

async fn provision(
    store_config: StoreConfig,
    parent: &CancellationToken,
) -> Result<Arc<dyn SyncStore>> {
    let store = RedisStore::provision(store_config, parent).await?;
    Ok(Arc::new(store))
}

fn fail_fast(err: anyhow::Error) -> ! {
    error!(error = %format!("{err:#}"), "failed to create sync client");
    std::process::exit(1);
}
