//! Subscription manager and the caller-side subscription handle.
//!
//! # Purpose
//! Owns the dedicated topic reader and fans every entry read from the store
//! out to the local subscribers of that topic, in store order.
//!
//! # Design notes
//! The reader is a blocking resource: only this task ever calls it. While a
//! read is parked in the store, new requests interrupt it; the interrupted
//! read is always driven to completion (and its entries dispatched) before
//! the request is served, so no entry is lost. Shutdown is the exception: a
//! cancelled client drops the parked read and stops waiting on full
//! subscriber queues right away.
//!
//! Every subscriber keeps its own stream position. A subscriber joining a
//! topic that is already being read starts from the beginning of the stream
//! like the first one did; subscribers that are ahead skip what they have
//! already seen.
use bytes::Bytes;
use rendezvous_store::{ReadInterrupt, STREAM_START, TopicEntry, TopicReader};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{QueuePolicy, READ_ERROR_BACKOFF};
use crate::error::{Result, SyncError};

pub(crate) enum SubscriptionRequest {
    Subscribe {
        topic_key: String,
        sender: mpsc::Sender<Bytes>,
        response: oneshot::Sender<Result<u64>>,
    },
}

/// Typed stream of messages published on a topic, oldest first.
///
/// The stream ends (`next` returns `None`) when the subscription is closed,
/// dropped or the owning client shuts down.
pub struct Subscription<T> {
    id: u64,
    topic_key: String,
    receiver: mpsc::Receiver<Bytes>,
    unsubscribe: mpsc::UnboundedSender<u64>,
    closed: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        id: u64,
        topic_key: String,
        receiver: mpsc::Receiver<Bytes>,
        unsubscribe: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            id,
            topic_key,
            receiver,
            unsubscribe,
            closed: false,
            _payload: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fully qualified store key of the topic.
    pub fn topic_key(&self) -> &str {
        &self.topic_key
    }

    /// Next raw payload, without decoding.
    pub async fn next_raw(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Stop receiving. Messages already queued can still be drained.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // The manager is gone when this fails, and with it every sender.
        let _ = self.unsubscribe.send(self.id);
        self.receiver.close();
    }
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Next message. Decode failures are reported per message and do not end
    /// the stream.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let payload = self.receiver.recv().await?;
        Some(serde_json::from_slice(&payload).map_err(SyncError::Decode))
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic_key", &self.topic_key)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Stream position, ordered the way the store orders entry ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct StreamPos(u64, u64);

impl StreamPos {
    fn parse(id: &str) -> Option<Self> {
        let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
        Some(Self(ms.parse().ok()?, seq.parse().ok()?))
    }

    fn cursor(&self) -> String {
        if *self == Self::default() {
            STREAM_START.to_string()
        } else {
            format!("{}-{}", self.0, self.1)
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Bytes>,
    position: StreamPos,
}

pub(crate) struct SubscriptionManager {
    pub(crate) reader: Box<dyn TopicReader>,
    pub(crate) requests: mpsc::Receiver<SubscriptionRequest>,
    pub(crate) unsubscribe: mpsc::UnboundedReceiver<u64>,
    pub(crate) token: CancellationToken,
    pub(crate) queue_policy: QueuePolicy,
    pub(crate) read_block: Duration,
    pub(crate) read_batch: usize,
}

/// What woke the manager while a read was parked.
enum Wake {
    Request(Option<SubscriptionRequest>),
    Unsubscribe(Option<u64>),
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<Subscriber>>,
    index: HashMap<u64, String>,
    next_id: u64,
}

impl Registry {
    fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    fn cursors(&self) -> Vec<(String, String)> {
        self.topics
            .iter()
            .filter_map(|(topic, subscribers)| {
                let position = subscribers.iter().map(|s| s.position).min()?;
                Some((topic.clone(), position.cursor()))
            })
            .collect()
    }

    fn subscribe(&mut self, topic_key: String, sender: mpsc::Sender<Bytes>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        debug!(id, topic = %topic_key, "subscription registered");
        self.index.insert(id, topic_key.clone());
        self.topics.entry(topic_key).or_default().push(Subscriber {
            id,
            sender,
            position: StreamPos::default(),
        });
        metrics::gauge!("rendezvous_subscriptions_active").set(self.index.len() as f64);
        id
    }

    fn unsubscribe(&mut self, id: u64) {
        let Some(topic) = self.index.remove(&id) else {
            return;
        };
        if let Some(subscribers) = self.topics.get_mut(&topic) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                self.topics.remove(&topic);
                debug!(topic = %topic, "stopped reading topic");
            }
        }
        debug!(id, topic = %topic, "subscription removed");
        metrics::gauge!("rendezvous_subscriptions_active").set(self.index.len() as f64);
    }

    fn handle_request(&mut self, request: SubscriptionRequest) {
        match request {
            SubscriptionRequest::Subscribe {
                topic_key,
                sender,
                response,
            } => {
                let id = self.subscribe(topic_key, sender);
                if response.send(Ok(id)).is_err() {
                    // The caller gave up before the handle existed.
                    self.unsubscribe(id);
                }
            }
        }
    }

    /// Fan entries out in stream order. Stops early once `token` fires.
    async fn dispatch(
        &mut self,
        entries: Vec<TopicEntry>,
        policy: QueuePolicy,
        token: &CancellationToken,
    ) {
        let mut gone = Vec::new();
        'entries: for entry in entries {
            let Some(position) = StreamPos::parse(&entry.id) else {
                warn!(topic = %entry.topic, id = %entry.id, "skipping entry with malformed id");
                continue;
            };
            let Some(subscribers) = self.topics.get_mut(&entry.topic) else {
                continue;
            };
            for subscriber in subscribers.iter_mut() {
                if subscriber.position >= position {
                    continue;
                }
                match deliver(&subscriber.sender, entry.payload.clone(), policy, token).await {
                    Delivery::Delivered | Delivery::Dropped => subscriber.position = position,
                    Delivery::Gone => gone.push(subscriber.id),
                    Delivery::Cancelled => break 'entries,
                }
            }
        }
        for id in gone {
            self.unsubscribe(id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    Dropped,
    /// The subscriber's receiver is gone.
    Gone,
    /// The client shut down while waiting for queue room.
    Cancelled,
}

/// Push one payload to a subscriber according to `policy`.
async fn deliver(
    sender: &mpsc::Sender<Bytes>,
    payload: Bytes,
    policy: QueuePolicy,
    token: &CancellationToken,
) -> Delivery {
    let outcome = match policy {
        QueuePolicy::Block { timeout } => tokio::select! {
            _ = token.cancelled() => Delivery::Cancelled,
            sent = sender.send_timeout(payload, timeout) => match sent {
                Ok(()) => Delivery::Delivered,
                Err(SendTimeoutError::Timeout(_)) => Delivery::Dropped,
                Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
            },
        },
        QueuePolicy::DropNew => match sender.try_send(payload) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        },
    };
    match outcome {
        Delivery::Dropped => {
            metrics::counter!("rendezvous_subscription_dropped_total").increment(1);
            debug!(?policy, "subscriber queue full, message dropped");
        }
        Delivery::Delivered => {
            metrics::counter!("rendezvous_subscription_delivered_total").increment(1);
        }
        Delivery::Gone | Delivery::Cancelled => {}
    }
    outcome
}

pub(crate) async fn run_subscription_manager(manager: SubscriptionManager) {
    let SubscriptionManager {
        mut reader,
        mut requests,
        mut unsubscribe,
        token,
        queue_policy,
        read_block,
        read_batch,
    } = manager;
    let interrupter: Arc<dyn ReadInterrupt> = reader.interrupter();
    let mut registry = Registry::default();
    let mut unsubscribe_open = true;
    debug!("subscription manager started");

    loop {
        if token.is_cancelled() {
            break;
        }
        if registry.is_empty() {
            tokio::select! {
                _ = token.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => registry.handle_request(request),
                    None => break,
                },
                id = unsubscribe.recv(), if unsubscribe_open => match id {
                    Some(id) => registry.unsubscribe(id),
                    None => unsubscribe_open = false,
                },
            }
            continue;
        }

        let cursors = registry.cursors();
        let mut read = reader.read(&cursors, read_batch, read_block);
        let wake = tokio::select! {
            result = &mut read => {
                drop(read);
                match result {
                    Ok(entries) => registry.dispatch(entries, queue_policy, &token).await,
                    Err(err) => {
                        warn!(error = %err, topics = cursors.len(), "topic read failed");
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                        }
                    }
                }
                continue;
            }
            // Shutdown abandons the parked read.
            _ = token.cancelled() => break,
            request = requests.recv() => Wake::Request(request),
            id = unsubscribe.recv(), if unsubscribe_open => Wake::Unsubscribe(id),
        };

        // Something needs the manager while the read is parked: wake the
        // reader and finish the read before touching anything else.
        let finish = async {
            if let Err(err) = interrupter.interrupt().await {
                debug!(error = %err, "failed to interrupt topic read");
            }
            read.await
        };
        let result = tokio::select! {
            _ = token.cancelled() => {
                if let Wake::Request(Some(SubscriptionRequest::Subscribe { response, .. })) = wake {
                    let _ = response.send(Err(SyncError::Cancelled));
                }
                break;
            }
            result = finish => result,
        };
        match result {
            Ok(entries) => registry.dispatch(entries, queue_policy, &token).await,
            Err(err) => warn!(error = %err, "interrupted topic read failed"),
        }
        match wake {
            Wake::Request(Some(request)) => registry.handle_request(request),
            Wake::Request(None) => break,
            Wake::Unsubscribe(Some(id)) => registry.unsubscribe(id),
            Wake::Unsubscribe(None) => unsubscribe_open = false,
        }
    }

    // Requests that never reached the registry still get an answer; dropping
    // the registry closes every subscriber's stream exactly once.
    requests.close();
    while let Ok(SubscriptionRequest::Subscribe { response, .. }) = requests.try_recv() {
        let _ = response.send(Err(SyncError::Cancelled));
    }
    let active = registry.index.len();
    drop(registry);
    metrics::gauge!("rendezvous_subscriptions_active").set(0.0);
    debug!(active, "subscription manager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_positions_order_like_store_ids() {
        let start = StreamPos::parse(STREAM_START).expect("start");
        let a = StreamPos::parse("1700000000000-0").expect("a");
        let b = StreamPos::parse("1700000000000-1").expect("b");
        let c = StreamPos::parse("1700000000001-0").expect("c");
        assert!(start < a && a < b && b < c);
        assert_eq!(start.cursor(), STREAM_START);
        assert_eq!(b.cursor(), "1700000000000-1");
        assert!(StreamPos::parse("nope").is_none());
    }

    #[tokio::test]
    async fn drop_new_drops_when_queue_is_full() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let policy = QueuePolicy::DropNew;
        assert_eq!(deliver(&tx, Bytes::from_static(b"a"), policy, &token).await, Delivery::Delivered);
        assert_eq!(deliver(&tx, Bytes::from_static(b"b"), policy, &token).await, Delivery::Dropped);
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"a")));
        assert!(rx.try_recv().is_err());
        drop(rx);
        assert_eq!(deliver(&tx, Bytes::from_static(b"c"), policy, &token).await, Delivery::Gone);
    }

    #[tokio::test]
    async fn block_waits_for_room_then_gives_up() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let policy = QueuePolicy::Block {
            timeout: Duration::from_millis(20),
        };
        assert_eq!(deliver(&tx, Bytes::from_static(b"a"), policy, &token).await, Delivery::Delivered);
        assert_eq!(deliver(&tx, Bytes::from_static(b"b"), policy, &token).await, Delivery::Dropped);
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"a")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_delivery_stops_on_cancellation() {
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let policy = QueuePolicy::Block {
            timeout: Duration::from_secs(3600),
        };
        assert_eq!(deliver(&tx, Bytes::from_static(b"a"), policy, &token).await, Delivery::Delivered);
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            deliver(&tx, Bytes::from_static(b"b"), policy, &token),
        )
        .await
        .expect("delivery ignored cancellation");
        assert_eq!(outcome, Delivery::Cancelled);
    }

    #[test]
    fn cursors_follow_the_slowest_subscriber() {
        let mut registry = Registry::default();
        let (tx, _rx) = mpsc::channel(1);
        let first = registry.subscribe("topic".into(), tx.clone());
        registry.subscribe("topic".into(), tx);
        if let Some(subscribers) = registry.topics.get_mut("topic") {
            subscribers[0].position = StreamPos(5, 0);
        }
        assert_eq!(registry.cursors(), vec![("topic".to_string(), "0".to_string())]);
        registry.unsubscribe(first + 1);
        assert_eq!(registry.cursors(), vec![("topic".to_string(), "5-0".to_string())]);
        registry.unsubscribe(first);
        assert!(registry.is_empty());
    }
}
