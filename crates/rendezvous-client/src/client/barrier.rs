//! Barrier manager and the caller-side barrier handle.
//!
//! # Purpose
//! Resolves "wait until the counter for a state reaches a target" requests.
//! One task owns every pending wait; callers hand it a request and get
//! exactly one answer back on a oneshot channel.
//!
//! # Design notes
//! Counters are re-read with a single batched read per tick rather than one
//! read per waiter, so the store load stays flat as waiters pile up. A waiter
//! that is satisfied at registration never waits for a tick.
use rendezvous_common::State;
use rendezvous_store::{StoreError, SyncStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

pub(crate) struct BarrierRequest {
    pub(crate) key: String,
    pub(crate) target: u64,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) response: oneshot::Sender<Result<()>>,
}

/// Pending wait on a state counter. Resolve it with [`Barrier::wait`];
/// dropping it abandons the wait.
#[derive(Debug)]
pub struct Barrier {
    state: State,
    target: u64,
    cancel: Option<CancellationToken>,
    response: oneshot::Receiver<Result<()>>,
}

impl Barrier {
    pub(crate) fn new(
        state: State,
        target: u64,
        cancel: Option<CancellationToken>,
        response: oneshot::Receiver<Result<()>>,
    ) -> Self {
        Self {
            state,
            target,
            cancel,
            response,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Wait until the counter reaches the target, the barrier's token is
    /// cancelled or the client shuts down.
    pub async fn wait(self) -> Result<()> {
        let Barrier {
            cancel, response, ..
        } = self;
        match cancel {
            Some(cancel) => tokio::select! {
                result = response => result.unwrap_or(Err(SyncError::Closed)),
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
            },
            None => response.await.unwrap_or(Err(SyncError::Closed)),
        }
    }
}

struct Waiter {
    target: u64,
    cancel: Option<CancellationToken>,
    response: oneshot::Sender<Result<()>>,
}

impl Waiter {
    fn resolve(self, result: Result<()>) {
        match &result {
            Ok(()) => metrics::counter!("rendezvous_barrier_resolved_total").increment(1),
            Err(_) => metrics::counter!("rendezvous_barrier_failed_total").increment(1),
        }
        // The caller may have stopped listening; that is not an error here.
        let _ = self.response.send(result);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

pub(crate) async fn run_barrier_manager(
    store: Arc<dyn SyncStore>,
    mut rx: mpsc::Receiver<BarrierRequest>,
    token: CancellationToken,
    poll_interval: Duration,
) {
    let mut pending: HashMap<String, Vec<Waiter>> = HashMap::new();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!(poll_ms = poll_interval.as_millis() as u64, "barrier manager started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => register(store.as_ref(), &mut pending, request, &token).await,
                None => break,
            },
            _ = ticker.tick(), if !pending.is_empty() => {
                poll(store.as_ref(), &mut pending, &token).await;
            }
        }
        metrics::gauge!("rendezvous_barrier_pending")
            .set(pending.values().map(Vec::len).sum::<usize>() as f64);
    }

    // Nothing may be left without an answer: pending waiters and requests
    // still queued in the channel are all told the client went away.
    rx.close();
    let mut drained = 0usize;
    for waiter in pending.into_values().flatten() {
        waiter.resolve(Err(SyncError::Cancelled));
        drained += 1;
    }
    while let Ok(request) = rx.try_recv() {
        let _ = request.response.send(Err(SyncError::Cancelled));
        drained += 1;
    }
    metrics::gauge!("rendezvous_barrier_pending").set(0.0);
    debug!(drained, "barrier manager stopped");
}

/// Counter read that gives up as soon as the client shuts down.
async fn read_counters(
    store: &dyn SyncStore,
    keys: &[String],
    token: &CancellationToken,
) -> Option<rendezvous_store::Result<Vec<u64>>> {
    tokio::select! {
        _ = token.cancelled() => None,
        result = store.get_counters(keys) => Some(result),
    }
}

async fn register(
    store: &dyn SyncStore,
    pending: &mut HashMap<String, Vec<Waiter>>,
    request: BarrierRequest,
    token: &CancellationToken,
) {
    let BarrierRequest {
        key,
        target,
        cancel,
        response,
    } = request;
    let waiter = Waiter {
        target,
        cancel,
        response,
    };
    if waiter.is_cancelled() {
        waiter.resolve(Err(SyncError::Cancelled));
        return;
    }
    if target == 0 {
        waiter.resolve(Ok(()));
        return;
    }
    let Some(result) = read_counters(store, std::slice::from_ref(&key), token).await else {
        waiter.resolve(Err(SyncError::Cancelled));
        return;
    };
    match result {
        Ok(values) if values.first().copied().unwrap_or(0) >= target => {
            waiter.resolve(Ok(()));
        }
        Ok(_) => {
            debug!(key = %key, target, "barrier registered");
            pending.entry(key).or_default().push(waiter);
        }
        Err(err) => waiter.resolve(Err(err.into())),
    }
}

async fn poll(
    store: &dyn SyncStore,
    pending: &mut HashMap<String, Vec<Waiter>>,
    token: &CancellationToken,
) {
    for waiters in pending.values_mut() {
        let (cancelled, live): (Vec<_>, Vec<_>) = std::mem::take(waiters)
            .into_iter()
            .filter(|waiter| !waiter.response.is_closed())
            .partition(Waiter::is_cancelled);
        for waiter in cancelled {
            metrics::counter!("rendezvous_barrier_cancelled_total").increment(1);
            waiter.resolve(Err(SyncError::Cancelled));
        }
        *waiters = live;
    }
    pending.retain(|_, waiters| !waiters.is_empty());
    if pending.is_empty() {
        return;
    }

    let keys: Vec<String> = pending.keys().cloned().collect();
    match read_counters(store, &keys, token).await {
        None => return,
        Some(Ok(values)) => {
            for (key, value) in keys.iter().zip(values) {
                release(pending, key, value);
            }
        }
        Some(Err(err)) if err.is_transient() => {
            warn!(error = %err, barriers = keys.len(), "barrier poll failed, retrying next tick");
        }
        Some(Err(err)) => {
            // One bad key must not hold up the others: find it key by key.
            warn!(error = %err, barriers = keys.len(), "batched barrier poll failed, checking keys one by one");
            for key in &keys {
                match read_counters(store, std::slice::from_ref(key), token).await {
                    None => return,
                    Some(Ok(values)) => release(pending, key, values.first().copied().unwrap_or(0)),
                    Some(Err(err)) if err.is_transient() => {
                        warn!(key = %key, error = %err, "barrier check failed, retrying next tick");
                    }
                    Some(Err(err)) => fail_key(pending, key, &err),
                }
            }
        }
    }
    pending.retain(|_, waiters| !waiters.is_empty());
}

fn release(pending: &mut HashMap<String, Vec<Waiter>>, key: &str, value: u64) {
    let Some(waiters) = pending.get_mut(key) else {
        return;
    };
    let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(waiters)
        .into_iter()
        .partition(|waiter| value >= waiter.target);
    if !ready.is_empty() {
        debug!(key = %key, value, resolved = ready.len(), "barrier reached");
    }
    for waiter in ready {
        waiter.resolve(Ok(()));
    }
    *waiters = waiting;
}

/// Answer every waiter on `key` with the error its counter read produced.
fn fail_key(pending: &mut HashMap<String, Vec<Waiter>>, key: &str, err: &StoreError) {
    let Some(waiters) = pending.remove(key) else {
        return;
    };
    warn!(key = %key, error = %err, waiters = waiters.len(), "barrier counter unreadable, failing its waiters");
    for waiter in waiters {
        let err = match err {
            StoreError::Closed => SyncError::Closed,
            other => SyncError::Store(StoreError::Protocol(format!("barrier counter {key}: {other}"))),
        };
        waiter.resolve(Err(err));
    }
}
