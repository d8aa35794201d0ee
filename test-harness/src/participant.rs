// Test harness participant: signals, waits on barriers and exchanges greetings
// with every other participant of the run.
use anyhow::{Context, Result};
use clap::Parser;
use rendezvous_client::{Event, SyncClient, Topic};
use rendezvous_test_harness::{RunArgs, init_tracing};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "participant")]
#[command(about = "Test harness participant for run synchronization")]
struct Args {
    #[command(flatten)]
    run: RunArgs,

    /// Seconds to wait for each barrier and for the greetings (0 = no timeout)
    #[arg(long, default_value = "60")]
    timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    seq: u64,
    group: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let shutdown = CancellationToken::new();
    let client = args.run.connect(&shutdown).await?;
    let group_id = args.run.group.clone();

    client
        .signal_event(&Event::Start {
            group_id: group_id.clone(),
        })
        .await
        .context("signal start")?;

    let outcome = run(&client, &args).await;
    let event = match &outcome {
        Ok(()) => Event::Success { group_id },
        Err(err) => {
            error!(error = %format!("{err:#}"), "Participant failed");
            Event::Failure {
                group_id,
                error: format!("{err:#}"),
            }
        }
    };
    client.signal_event(&event).await.context("signal outcome")?;
    client.close().await.context("close sync client")?;
    outcome
}

async fn run(client: &SyncClient, args: &Args) -> Result<()> {
    let instances = args.run.instances;
    let limit = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));

    let seq = bounded(limit, client.signal_and_wait("ready", instances))
        .await
        .context("wait for ready")?;
    info!(seq, instances, "All participants ready");

    let topic = Topic::<Greeting>::new("greetings");
    let greeting = Greeting {
        seq,
        group: args.run.group.clone(),
    };
    let (_, mut greetings) = client
        .publish_subscribe(&topic, &greeting)
        .await
        .context("publish greeting")?;

    let mut seen = BTreeSet::new();
    while (seen.len() as u64) < instances {
        let next = bounded(limit, async { Ok(greetings.next().await) })
            .await
            .context("wait for greetings")?;
        match next {
            Some(Ok(greeting)) => {
                info!(from = greeting.seq, group = %greeting.group, "Received greeting");
                seen.insert(greeting.seq);
            }
            Some(Err(err)) => error!(error = %err, "Undecodable greeting"),
            None => anyhow::bail!("greetings stream closed after {} of {instances}", seen.len()),
        }
    }

    bounded(limit, client.signal_and_wait("done", instances))
        .await
        .context("wait for done")?;
    info!(greetings = seen.len(), "Participant completed");
    Ok(())
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = rendezvous_client::Result<T>>,
{
    match limit {
        Some(limit) => Ok(timeout(limit, fut)
            .await
            .with_context(|| format!("timed out after {}s", limit.as_secs()))??),
        None => Ok(fut.await?),
    }
}
