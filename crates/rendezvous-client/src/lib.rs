// Client for synchronizing the participants of a distributed test run.
//
// CLIENT-SIDE DESIGN INTENT
// -------------------------
// Participants coordinate through a shared store: counters for barriers and
// append-only streams for topics. Two kinds of store access have very
// different shapes:
//
// - Counter updates and publishes are short request/response commands. They
//   go straight to the pooled connections and may run concurrently.
// - Waiting (barriers, subscriptions) is long-lived. Letting every caller park
//   its own blocking call would need a connection per waiter, and a blocking
//   read shared between tasks is a data race on the connection.
//
// Therefore waiting is owned by two single-task managers. Callers hand them a
// request plus a oneshot slot over a channel and get exactly one answer back.
// The managers multiplex any number of waiters onto one batched counter read
// per tick and one blocking stream read, respectively.
//
// Shutdown is a single cancellation token. `SyncClient::close` cancels it,
// waits for every manager to answer what is still pending, then closes the
// store.
pub mod client;
pub mod config;
pub mod error;
pub mod run;

pub use client::barrier::Barrier;
pub use client::client::SyncClient;
pub use client::subscription::Subscription;
pub use config::{ClientConfig, QueuePolicy};
pub use error::{Result, SyncError};
pub use rendezvous_common::{Event, Keyspace, RunParams, State, Topic};
pub use rendezvous_store::{MemoryStore, RedisStore, StoreConfig, StoreError, SyncStore};
pub use run::{current_run_params, with_run_params};

#[cfg(test)]
mod tests;
