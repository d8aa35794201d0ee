//! Run synchronization operations.
//!
//! Counter and publish operations go straight to the store's pool. Anything
//! that waits (barriers, subscriptions) is routed through the managers.
use bytes::Bytes;
use rendezvous_common::{Event, State, Topic};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::barrier::{Barrier, BarrierRequest};
use crate::client::client::SyncClient;
use crate::client::subscription::{Subscription, SubscriptionRequest};
use crate::error::{Result, SyncError};

impl SyncClient {
    /// Record that this participant reached `state`; returns the number of
    /// participants that have reached it so far, this one included.
    pub async fn signal_entry(&self, state: impl Into<State>) -> Result<u64> {
        self.ensure_open()?;
        let state = state.into();
        let key = self.keyspace()?.state_key(&state);
        let seq = self.tracked(self.inner.store.incr(&key)).await?;
        debug!(state = %state, seq, "signalled entry");
        Ok(seq)
    }

    /// Wait for `target` participants to signal `state`.
    pub async fn barrier(&self, state: impl Into<State>, target: u64) -> Result<Barrier> {
        self.register_barrier(state.into(), target, None).await
    }

    /// Like [`SyncClient::barrier`], abandoned with [`SyncError::Cancelled`]
    /// once `cancel` fires.
    pub async fn barrier_with_token(
        &self,
        state: impl Into<State>,
        target: u64,
        cancel: CancellationToken,
    ) -> Result<Barrier> {
        self.register_barrier(state.into(), target, Some(cancel)).await
    }

    /// Signal `state`, then wait for `target` participants to have done so.
    /// Returns this participant's sequence number for the state.
    pub async fn signal_and_wait(&self, state: impl Into<State>, target: u64) -> Result<u64> {
        let state = state.into();
        let seq = self.signal_entry(state.clone()).await?;
        self.barrier(state, target).await?.wait().await?;
        Ok(seq)
    }

    /// Append `payload` to `topic`; returns its 1-based position in the topic.
    pub async fn publish<T: Serialize>(&self, topic: &Topic<T>, payload: &T) -> Result<u64> {
        let key = self.keyspace()?.topic_key(topic.name());
        self.publish_to(&key, payload).await
    }

    /// Every message ever published to `topic`, then every new one.
    pub async fn subscribe<T: DeserializeOwned>(&self, topic: &Topic<T>) -> Result<Subscription<T>> {
        let key = self.keyspace()?.topic_key(topic.name());
        self.subscribe_to(key).await
    }

    /// Publish, then signal `state` and wait for `target` participants.
    /// Returns the publish position.
    pub async fn publish_and_wait<T: Serialize>(
        &self,
        topic: &Topic<T>,
        payload: &T,
        state: impl Into<State>,
        target: u64,
    ) -> Result<u64> {
        let seq = self.publish(topic, payload).await?;
        self.signal_and_wait(state, target).await?;
        Ok(seq)
    }

    /// Publish, then subscribe to the same topic.
    pub async fn publish_subscribe<T: Serialize + DeserializeOwned>(
        &self,
        topic: &Topic<T>,
        payload: &T,
    ) -> Result<(u64, Subscription<T>)> {
        let seq = self.publish(topic, payload).await?;
        let subscription = self.subscribe(topic).await?;
        Ok((seq, subscription))
    }

    /// Next value of a run-wide sequence. Values are unique and strictly
    /// increasing across every participant using the same name.
    pub async fn sequence_number(&self, name: &str) -> Result<u64> {
        self.ensure_open()?;
        let key = self.keyspace()?.sequence_key(name);
        self.tracked(self.inner.store.incr(&key)).await
    }

    /// Publish a lifecycle event on the run events topic.
    pub async fn signal_event(&self, event: &Event) -> Result<u64> {
        let key = self.keyspace()?.events_key();
        self.publish_to(&key, event).await
    }

    /// Every lifecycle event published in this run.
    pub async fn subscribe_events(&self) -> Result<Subscription<Event>> {
        let key = self.keyspace()?.events_key();
        self.subscribe_to(key).await
    }

    async fn register_barrier(
        &self,
        state: State,
        target: u64,
        cancel: Option<CancellationToken>,
    ) -> Result<Barrier> {
        self.ensure_open()?;
        let key = self.keyspace()?.state_key(&state);
        let (response, receiver) = oneshot::channel();
        let request = BarrierRequest {
            key,
            target,
            cancel: cancel.clone(),
            response,
        };
        self.send_request(&self.inner.barrier_tx, request).await?;
        Ok(Barrier::new(state, target, cancel, receiver))
    }

    async fn publish_to<T: Serialize + ?Sized>(&self, key: &str, payload: &T) -> Result<u64> {
        self.ensure_open()?;
        let encoded = serde_json::to_vec(payload).map_err(SyncError::Encode)?;
        self.tracked(self.inner.store.append(key, Bytes::from(encoded)))
            .await
    }

    async fn subscribe_to<T>(&self, topic_key: String) -> Result<Subscription<T>> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(self.inner.config.subscription_buffer.max(1));
        let (response, registered) = oneshot::channel();
        let request = SubscriptionRequest::Subscribe {
            topic_key: topic_key.clone(),
            sender,
            response,
        };
        self.send_request(&self.inner.subscription_tx, request).await?;
        let id = registered.await.map_err(|_| SyncError::Closed)??;
        Ok(Subscription::new(
            id,
            topic_key,
            receiver,
            self.inner.unsubscribe_tx.clone(),
        ))
    }
}
