// Test harness publisher: publishes messages to a run topic at a configured rate.
use anyhow::{Context, Result};
use clap::Parser;
use rendezvous_client::Topic;
use rendezvous_test_harness::{RunArgs, init_tracing};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Test harness publisher for run topics")]
struct Args {
    #[command(flatten)]
    run: RunArgs,

    /// Topic name
    #[arg(long, default_value = "test-topic")]
    topic: String,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "100")]
    rate: u64,

    /// Total number of messages to publish
    #[arg(long, default_value = "100")]
    count: u64,

    /// Publisher ID for logging
    #[arg(long, default_value = "pub-1")]
    id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    info!(id = %args.id, topic = %args.topic, count = args.count, "Starting publisher");

    let shutdown = CancellationToken::new();
    let client = args.run.connect(&shutdown).await?;
    let topic = Topic::<String>::new(args.topic.clone());
    let interval = (args.rate > 0).then(|| Duration::from_secs_f64(1.0 / args.rate as f64));

    let start_time = Instant::now();
    let mut errors = 0u64;
    for index in 0..args.count {
        let payload = format!("{}:{index}", args.id);
        match client.publish(&topic, &payload).await {
            Ok(seq) if seq % 1000 == 0 => info!(id = %args.id, seq, "Publishing progress"),
            Ok(_) => {}
            Err(err) => {
                errors += 1;
                error!(id = %args.id, error = %err, "Publish failed");
            }
        }
        if let Some(interval) = interval {
            sleep(interval).await;
        }
    }

    client.close().await.context("close sync client")?;
    info!(
        id = %args.id,
        published = args.count - errors,
        errors,
        elapsed = format!("{:.2}s", start_time.elapsed().as_secs_f64()),
        "Publisher completed"
    );
    Ok(())
}
