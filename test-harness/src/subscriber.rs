// Test harness subscriber: collects messages from a run topic.
use anyhow::{Context, Result};
use clap::Parser;
use rendezvous_client::Topic;
use rendezvous_test_harness::{RunArgs, init_tracing};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "subscriber")]
#[command(about = "Test harness subscriber for run topics")]
struct Args {
    #[command(flatten)]
    run: RunArgs,

    /// Topic name
    #[arg(long, default_value = "test-topic")]
    topic: String,

    /// Stop after this many messages (0 = until timeout)
    #[arg(long, default_value = "100")]
    count: u64,

    /// Subscriber ID for logging
    #[arg(long, default_value = "sub-1")]
    id: String,

    /// Timeout for receiving messages in seconds (0 = no timeout)
    #[arg(long, default_value = "60")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    info!(id = %args.id, topic = %args.topic, "Starting subscriber");

    let shutdown = CancellationToken::new();
    let client = args.run.connect(&shutdown).await?;
    let mut subscription = client
        .subscribe(&Topic::<String>::new(args.topic.clone()))
        .await
        .context("subscribe to topic")?;
    info!(id = %args.id, "Subscribed to topic");

    let timeout_duration = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    let start_time = Instant::now();
    let mut received = 0u64;
    let mut errors = 0u64;
    while args.count == 0 || received < args.count {
        let result = match timeout_duration {
            Some(limit) => timeout(limit, subscription.next()).await,
            None => Ok(subscription.next().await),
        };
        match result {
            Ok(Some(Ok(_))) => {
                received += 1;
                if received % 1000 == 0 {
                    info!(id = %args.id, received, errors, "Receiving progress");
                }
            }
            Ok(Some(Err(err))) => {
                errors += 1;
                error!(id = %args.id, error = %err, "Receive error");
            }
            Ok(None) => {
                info!(id = %args.id, "Subscription closed");
                break;
            }
            Err(_) => {
                warn!(id = %args.id, "Timeout waiting for message, stopping");
                break;
            }
        }
    }

    drop(subscription);
    client.close().await.context("close sync client")?;
    info!(
        id = %args.id,
        received,
        errors,
        elapsed = format!("{:.2}s", start_time.elapsed().as_secs_f64()),
        "Subscriber completed"
    );
    if args.count > 0 && received < args.count {
        anyhow::bail!("received {received} of {} messages", args.count);
    }
    Ok(())
}
