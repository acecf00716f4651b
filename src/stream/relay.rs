//! Forwards each stored ingest cycle to the stream sink.

use crate::{models::CoinObservation, stream::broadcaster::CoinBroadcaster};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Broadcast every batch received on `rx` to `sink_url` until the channel closes.
pub async fn run_cycle_relay(
    broadcaster: CoinBroadcaster,
    sink_url: String,
    mut rx: mpsc::Receiver<Vec<CoinObservation>>,
) {
    info!(sink = %sink_url, "📡 Cycle relay started");

    while let Some(batch) = rx.recv().await {
        let timestamp = batch
            .first()
            .map(|o| o.timestamp.clone())
            .unwrap_or_default();

        match broadcaster.broadcast(&sink_url, batch).await {
            Ok(report) if report.failures().next().is_none() => {
                info!(%timestamp, sent = report.delivered(), "Cycle streamed");
            }
            Ok(report) => {
                warn!(
                    %timestamp,
                    sent = report.delivered(),
                    failed = report.len() - report.delivered(),
                    "Cycle streamed with delivery failures"
                );
            }
            Err(e) => warn!(%timestamp, error = %e, "Cycle not streamed"),
        }
    }

    info!("Cycle relay stopped");
}
