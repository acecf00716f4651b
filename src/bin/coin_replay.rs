//! Coin Replay Tool
//!
//! Streams stored coin observations to a WebSocket sink, one message per
//! row, and prints the delivery tally.
//!
//! Usage:
//!   cargo run --release --bin coin_replay -- --db-path ./coins.db --sink wss://stream.example/coin_market_history/
//!   cargo run --release --bin coin_replay -- --db-path ./coins.db --sink ws://127.0.0.1:9001/ --since 2024-05-01T12:00:00Z

use anyhow::{bail, Context, Result};
use clap::Parser;
use coinfeed_backend::{
    models::normalize_timestamp,
    storage::DbCoinStorage,
    stream::{BroadcasterConfig, CoinBroadcaster},
};
use std::time::Duration;
use tracing::info;

/// Replay stored coin observations to a stream sink
#[derive(Parser, Debug)]
#[command(name = "coin_replay")]
#[command(about = "Send stored coin observations to a WebSocket sink")]
struct Cli {
    /// Path to the SQLite database
    #[arg(short, long, env = "COIN_DB_PATH", default_value = "coins.db")]
    db_path: String,

    /// Sink address (ws:// or wss://)
    #[arg(short, long, env = "STREAM_SINK_URL")]
    sink: String,

    /// Only replay observations at or after this RFC 3339 time (newest first)
    #[arg(long)]
    since: Option<String>,

    /// Handshake timeout in seconds
    #[arg(long, default_value = "10")]
    handshake_timeout_secs: u64,

    /// Maximum concurrent sends
    #[arg(long, default_value = "32")]
    max_in_flight: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coin_replay=info,coinfeed_backend=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.max_in_flight == 0 {
        bail!("--max-in-flight must be at least 1");
    }

    let since = cli
        .since
        .as_deref()
        .map(normalize_timestamp)
        .transpose()
        .context("Invalid --since timestamp")?;

    let storage = DbCoinStorage::new(&cli.db_path)?;
    let observations = storage
        .get_since(since.as_deref())
        .context("Failed to load observations")?;
    info!("Loaded {} observations from {}", observations.len(), cli.db_path);

    let broadcaster = CoinBroadcaster::new(BroadcasterConfig {
        handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
        max_in_flight: cli.max_in_flight,
        ..BroadcasterConfig::default()
    });

    let total = observations.len();
    let report = broadcaster
        .broadcast(&cli.sink, observations)
        .await
        .context("Replay aborted")?;

    for failure in report.failures() {
        if let Err(e) = &failure.result {
            eprintln!("record #{}: {}", failure.index, e);
        }
    }

    println!(
        "Replayed {} observations: {} delivered, {} failed",
        total,
        report.delivered(),
        report.len() - report.delivered()
    );

    Ok(())
}
