//! CoinFeed - coin market history collector
//!
//! - Ingests the upstream coin list on a fixed cadence into SQLite
//! - Serves recent observations over HTTP
//! - Streams each stored cycle to a WebSocket sink when one is configured

use anyhow::{Context, Result};
use coinfeed_backend::{
    api::{create_router, AppState},
    config::AppConfig,
    scrapers::{CoinApiClient, CoinIngestor},
    storage::DbCoinStorage,
    stream::{run_cycle_relay, BroadcasterConfig, CoinBroadcaster},
};
use dotenv::dotenv;
use std::{path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cycles waiting for the relay; new cycles are dropped while it is full.
const RELAY_QUEUE_DEPTH: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 CoinFeed starting");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Fatal at startup only: without a store there is nothing to do.
    let storage = Arc::new(DbCoinStorage::new(&config.database_path)?);

    let mut ingest_stats = None;
    if config.ingest.enabled {
        let api = CoinApiClient::new(&config.ingest.api_url, config.ingest.fetch_timeout)?;
        let mut ingestor = CoinIngestor::new(api, storage.clone(), config.ingest.interval);

        if let Some(sink_url) = config.stream.sink_url.clone() {
            let (cycle_tx, cycle_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
            let broadcaster = CoinBroadcaster::new(BroadcasterConfig::from(&config.stream));
            tokio::spawn(run_cycle_relay(broadcaster, sink_url, cycle_rx));
            ingestor = ingestor.with_cycle_sink(cycle_tx);
        } else {
            info!("STREAM_SINK_URL not set - cycle relay disabled");
        }

        ingest_stats = Some(ingestor.stats());
        tokio::spawn(ingestor.run());
    } else {
        warn!("⚠️  INGEST_ENABLED=false - serving stored observations only");
    }

    let app = create_router(AppState {
        storage,
        ingest_stats,
        snapshot_window: config.snapshot_window,
    });

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinfeed_backend=debug,coinfeed=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate root.
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
