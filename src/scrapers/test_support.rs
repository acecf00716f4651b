//! Local stand-in for the upstream coin list API.

use axum::{http::StatusCode, routing::get, Router};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;

pub struct FakeUpstream {
    pub url: String,
    hits: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// Counts a request as in flight until its handler finishes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeUpstream {
    /// Serve `responses` in order; the last one repeats once exhausted.
    pub async fn spawn(responses: Vec<(StatusCode, String)>) -> Self {
        Self::spawn_with_delay(responses, Duration::ZERO).await
    }

    /// Like [`FakeUpstream::spawn`], but every response is held back by `delay`.
    pub async fn spawn_with_delay(responses: Vec<(StatusCode, String)>, delay: Duration) -> Self {
        assert!(!responses.is_empty());
        let responses = Arc::new(responses);
        let hits = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak_in_flight = Arc::new(AtomicUsize::new(0));

        let app = {
            let hits = hits.clone();
            let peak_in_flight = peak_in_flight.clone();
            Router::new().route(
                "/api/v1/get-coins",
                get(move || {
                    let responses = responses.clone();
                    let hits = hits.clone();
                    let in_flight = in_flight.clone();
                    let peak_in_flight = peak_in_flight.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        let _guard = InFlight(in_flight);
                        peak_in_flight.fetch_max(now, Ordering::SeqCst);

                        let n = hits.fetch_add(1, Ordering::SeqCst);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let (status, body) = &responses[n.min(responses.len() - 1)];
                        (*status, body.clone())
                    }
                }),
            )
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}/api/v1/get-coins", addr),
            hits,
            peak_in_flight,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Most requests the upstream was serving at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Upstream JSON body with one entry per id.
pub fn coins_body(ids: &[i64]) -> String {
    let coins: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "full_name": format!("Coin {id}"),
                "coin": format!("C{id}"),
                "buy_limit": 100,
                "sell_limit": 0,
                "withdrawal_fee": "0.01",
                "deposit_fees": "0",
                "status": "active",
                "deposit_status": "enabled",
                "withdrawal_status": "enabled",
                "icon": format!("https://cdn.example/{id}.png"),
            })
        })
        .collect();
    serde_json::json!({ "coins": coins }).to_string()
}

/// An http:// URL nothing is listening on.
pub async fn unused_http_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/api/v1/get-coins", addr)
}
