//! Run synchronization demo on the in-process store.
//!
//! # Purpose
//! Demonstrates the participant flow end to end: several participants signal
//! a state, wait on a shared barrier, exchange messages on a topic and report
//! lifecycle events, all inside one process.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance. Point
//! `REDIS_HOST` at a server and use the test harness binaries to run the same
//! flow across processes.
use anyhow::Result;
use rendezvous_client::{ClientConfig, Event, MemoryStore, RunParams, SyncClient, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PARTICIPANTS: u64 = 3;

async fn run_demo() -> Result<()> {
    println!("== Rendezvous Demo ==");
    println!("Goal: {PARTICIPANTS} participants meet on a barrier, then greet each other.");

    println!("Step 1/4: creating the in-process store and one client per participant.");
    let store = MemoryStore::new();
    let shutdown = CancellationToken::new();
    let params = RunParams::new("demo", "rendezvous", "demo-run").with_instance_count(PARTICIPANTS);
    let config = ClientConfig {
        barrier_poll_interval: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let mut clients = Vec::new();
    for index in 0..PARTICIPANTS {
        let params = params.clone().with_group(format!("group-{index}"));
        let handle = Arc::new(store.connect());
        clients.push(SyncClient::new_bound(handle, params, config.clone(), &shutdown).await?);
    }

    println!("Step 2/4: every participant signals 'ready' and waits for the others.");
    let topic = Topic::<String>::new("greetings");
    let mut tasks = Vec::new();
    for client in clients.iter().cloned() {
        let topic = topic.clone();
        tasks.push(tokio::spawn(async move {
            let group_id = client.run_params()?.test_group_id.clone();
            client
                .signal_event(&Event::Start {
                    group_id: group_id.clone(),
                })
                .await?;
            let seq = client.signal_and_wait("ready", PARTICIPANTS).await?;
            println!("  {group_id} is participant #{seq}");
            client
                .publish(&topic, &format!("hello from {group_id}"))
                .await?;
            client.signal_event(&Event::Success { group_id }).await?;
            Ok::<_, rendezvous_client::SyncError>(seq)
        }));
    }
    for task in tasks {
        task.await??;
    }

    println!("Step 3/4: reading every greeting from the start of the topic.");
    let mut greetings = clients[0].subscribe(&topic).await?;
    for _ in 0..PARTICIPANTS {
        if let Some(greeting) = greetings.next().await {
            println!("  received: {}", greeting?);
        }
    }
    let mut events = clients[0].subscribe_events().await?;
    let mut successes = 0;
    while successes < PARTICIPANTS {
        match events.next().await {
            Some(Ok(event)) if event.is_terminal() => successes += 1,
            Some(_) => {}
            None => break,
        }
    }
    println!("  {successes} participants reported success.");

    println!("Step 4/4: closing every client.");
    drop(greetings);
    drop(events);
    for client in &clients {
        client.close().await?;
    }
    println!("Done.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run_demo().await
}
