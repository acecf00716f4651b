//! Periodic coin ingestor
//!
//! fetch -> decode -> stamp -> store, once per tick. A cycle is awaited
//! inside the loop and missed ticks are skipped, so at most one cycle is
//! ever in flight.

use crate::{
    models::{format_timestamp, CoinObservation},
    scrapers::coin_api::{CoinApiClient, FetchError},
    storage::{CycleReport, DbCoinStorage},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

/// Running counters, readable while the loop is live.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub cycles_ok: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub rows_inserted: AtomicU64,
    pub rows_failed: AtomicU64,
    pub batches_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestStatsSnapshot {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub rows_inserted: u64,
    pub rows_failed: u64,
    pub batches_dropped: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            cycles_ok: self.cycles_ok.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct CoinIngestor {
    api: CoinApiClient,
    storage: Arc<DbCoinStorage>,
    period: Duration,
    cycle_tx: Option<mpsc::Sender<Vec<CoinObservation>>>,
    stats: Arc<IngestStats>,
}

impl CoinIngestor {
    pub fn new(api: CoinApiClient, storage: Arc<DbCoinStorage>, period: Duration) -> Self {
        Self {
            api,
            storage,
            period,
            cycle_tx: None,
            stats: Arc::new(IngestStats::default()),
        }
    }

    /// Hand each successful cycle's stored observations to a downstream consumer.
    pub fn with_cycle_sink(mut self, tx: mpsc::Sender<Vec<CoinObservation>>) -> Self {
        self.cycle_tx = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Run one cycle stamped with the wall clock at decode time.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let coins = self.api.fetch_coins().await?;
        self.store_and_forward(Utc::now(), coins).await
    }

    /// Run one cycle stamped with a caller-chosen capture time.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let coins = self.api.fetch_coins().await?;
        self.store_and_forward(now, coins).await
    }

    async fn store_and_forward(
        &self,
        now: DateTime<Utc>,
        coins: Vec<crate::models::Coin>,
    ) -> Result<CycleReport, CycleError> {
        let timestamp = format_timestamp(now);
        debug!(count = coins.len(), %timestamp, "storing cycle");

        let storage = self.storage.clone();
        let (report, coins) = {
            let timestamp = timestamp.clone();
            tokio::task::spawn_blocking(move || {
                let report = storage.store_cycle(&timestamp, &coins);
                (report, coins)
            })
            .await
            .map_err(|e| CycleError::Store(anyhow::anyhow!("store task failed: {e}")))?
        };
        let report = report.map_err(CycleError::Store)?;

        if let Some(tx) = &self.cycle_tx {
            let stored: Vec<CoinObservation> = coins
                .into_iter()
                .enumerate()
                .filter(|(i, _)| !report.failed(*i))
                .map(|(_, coin)| coin.observed_at(&timestamp))
                .collect();

            if !stored.is_empty() {
                if let Err(e) = tx.try_send(stored) {
                    self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(%timestamp, error = %e, "cycle relay unavailable, dropping batch");
                }
            }
        }

        Ok(report)
    }

    /// Drive cycles forever on the configured period.
    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "🔁 Coin ingestor started: {} every {:?}",
            self.api.url(),
            self.period
        );

        loop {
            ticker.tick().await;
            let started = Instant::now();

            match self.run_cycle().await {
                Ok(report) => {
                    self.stats.cycles_ok.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .rows_inserted
                        .fetch_add(report.inserted as u64, Ordering::Relaxed);
                    self.stats
                        .rows_failed
                        .fetch_add(report.failures.len() as u64, Ordering::Relaxed);

                    if report.is_clean() {
                        info!(
                            timestamp = %report.timestamp,
                            inserted = report.inserted,
                            "💾 Cycle stored"
                        );
                    } else {
                        warn!(
                            timestamp = %report.timestamp,
                            inserted = report.inserted,
                            failed = report.failures.len(),
                            "Cycle stored with row failures"
                        );
                    }
                }
                Err(e) => {
                    self.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    let kind = match &e {
                        CycleError::Fetch(f) => f.kind(),
                        CycleError::Store(_) => "store",
                    };
                    warn!(kind, error = %e, "Ingest cycle aborted");
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.period {
                debug!(?elapsed, period = ?self.period, "cycle overran its tick, skipping missed ticks");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrapers::test_support::{coins_body, FakeUpstream};
    use axum::http::StatusCode;
    use chrono::TimeZone;

    fn ingestor(url: &str, storage: Arc<DbCoinStorage>) -> CoinIngestor {
        let api = CoinApiClient::new(url, Duration::from_millis(900)).unwrap();
        CoinIngestor::new(api, storage, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_cycle_stores_every_entity_with_one_timestamp() {
        let upstream = FakeUpstream::spawn(vec![(StatusCode::OK, coins_body(&[1, 2, 3]))]).await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let ingestor = ingestor(&upstream.url, storage.clone());

        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let report = ingestor.run_cycle_at(t0).await.unwrap();

        assert_eq!(report.inserted, 3);
        let rows = storage.get_since(None).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.timestamp == format_timestamp(t0)));
    }

    #[tokio::test]
    async fn test_non_200_writes_nothing_and_next_cycle_proceeds() {
        let upstream = FakeUpstream::spawn(vec![
            (StatusCode::SERVICE_UNAVAILABLE, "busy".to_string()),
            (StatusCode::OK, coins_body(&[1, 2])),
        ])
        .await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let ingestor = ingestor(&upstream.url, storage.clone());

        let err = ingestor.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(FetchError::Status(503))));
        assert!(storage.is_empty().unwrap());

        let report = ingestor.run_cycle().await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(storage.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_decode_error_aborts_cycle() {
        let upstream =
            FakeUpstream::spawn(vec![(StatusCode::OK, r#"{"coins": [{"id": "x"}]}"#.into())]).await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let ingestor = ingestor(&upstream.url, storage.clone());

        let err = ingestor.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(FetchError::Decode(_))));
        assert!(storage.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_transport_error_is_reported() {
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let url = crate::scrapers::test_support::unused_http_url().await;
        let ingestor = ingestor(&url, storage.clone());

        let err = ingestor.run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Fetch(FetchError::Transport(_))));
    }

    #[tokio::test]
    async fn test_cycle_output_forwarded_without_failed_rows() {
        let upstream = FakeUpstream::spawn(vec![(StatusCode::OK, coins_body(&[5, 5, 6]))]).await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let (tx, mut rx) = mpsc::channel(1);
        let ingestor = ingestor(&upstream.url, storage.clone()).with_cycle_sink(tx);

        let report = ingestor.run_cycle().await.unwrap();
        assert_eq!(report.failures.len(), 1);

        let batch = rx.recv().await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![5, 6]);
        assert!(batch.iter().all(|o| o.timestamp == report.timestamp));
    }

    #[tokio::test]
    async fn test_full_relay_drops_batch() {
        let upstream = FakeUpstream::spawn(vec![(StatusCode::OK, coins_body(&[1]))]).await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let ingestor = ingestor(&upstream.url, storage.clone()).with_cycle_sink(tx);

        ingestor
            .run_cycle_at(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        ingestor
            .run_cycle_at(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap())
            .await
            .unwrap();

        assert_eq!(ingestor.stats().snapshot().batches_dropped, 1);
        assert_eq!(storage.len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_slow_upstream_hits_fetch_timeout() {
        let upstream = FakeUpstream::spawn_with_delay(
            vec![(StatusCode::OK, coins_body(&[1]))],
            Duration::from_millis(500),
        )
        .await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let api = CoinApiClient::new(&upstream.url, Duration::from_millis(50)).unwrap();
        let ingestor = CoinIngestor::new(api, storage.clone(), Duration::from_millis(100));

        let started = Instant::now();
        let err = ingestor.run_cycle().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        match err {
            CycleError::Fetch(FetchError::Transport(e)) => assert!(e.is_timeout(), "{e}"),
            other => panic!("expected a transport timeout, got {other:?}"),
        }
        assert!(storage.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_slow_cycles_never_overlap() {
        // each fetch outlasts several ticks
        let upstream = FakeUpstream::spawn_with_delay(
            vec![(StatusCode::OK, coins_body(&[1, 2]))],
            Duration::from_millis(120),
        )
        .await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let api = CoinApiClient::new(&upstream.url, Duration::from_secs(2)).unwrap();
        let ingestor = CoinIngestor::new(api, storage.clone(), Duration::from_millis(30));
        let stats = ingestor.stats();

        let handle = tokio::spawn(ingestor.run());
        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.abort();

        assert!(upstream.hits() >= 2, "expected several cycles");
        assert_eq!(upstream.peak_in_flight(), 1);
        // skipped ticks are not replayed: far fewer cycles than ticks
        assert!(upstream.hits() <= 6, "got {} hits", upstream.hits());
        assert!(stats.snapshot().cycles_ok >= 1);
    }

    #[tokio::test]
    async fn test_run_loop_ingests_on_ticks() {
        let upstream = FakeUpstream::spawn(vec![(StatusCode::OK, coins_body(&[1, 2]))]).await;
        let storage = Arc::new(DbCoinStorage::new(":memory:").unwrap());
        let api = CoinApiClient::new(&upstream.url, Duration::from_millis(40)).unwrap();
        let ingestor = CoinIngestor::new(api, storage.clone(), Duration::from_millis(50));
        let stats = ingestor.stats();

        let handle = tokio::spawn(ingestor.run());
        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.abort();

        let snap = stats.snapshot();
        assert!(snap.cycles_ok >= 2, "expected several cycles, got {snap:?}");
        // the aborted cycle may have committed before its counters were bumped
        assert!(storage.len().unwrap() as u64 >= snap.rows_inserted);
        assert!(upstream.hits() >= 2);
    }
}
