use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tower_http::cors::CorsLayer;

use crate::{
    api::logging::request_logging,
    models::{format_timestamp, normalize_timestamp, CoinObservation, CoinsResponse},
    scrapers::{IngestStats, IngestStatsSnapshot},
    storage::DbCoinStorage,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<DbCoinStorage>,
    pub ingest_stats: Option<Arc<IngestStats>>,
    /// Lookback used when a request names no bound.
    pub snapshot_window: Duration,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/get-coins", get(get_coins))
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let storage = state.storage.clone();
    let observations = tokio::task::spawn_blocking(move || storage.len())
        .await
        .map_err(|e| ApiError::Store(anyhow::anyhow!("health task failed: {e}")))??;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        observations,
        ingest: state.ingest_stats.as_ref().map(|s| s.snapshot()),
    }))
}

/// Recent observations, newest first.
async fn get_coins(
    State(state): State<AppState>,
    Query(params): Query<SnapshotQuery>,
) -> Result<Json<CoinsResponse<CoinObservation>>, ApiError> {
    let bound = params.resolve_bound(state.snapshot_window, Utc::now())?;

    let storage = state.storage.clone();
    let coins = tokio::task::spawn_blocking(move || storage.get_since(bound.as_deref()))
        .await
        .map_err(|e| ApiError::Store(anyhow::anyhow!("snapshot task failed: {e}")))??;

    Ok(Json(CoinsResponse { coins }))
}

// ===== Request/Response Types =====

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    /// Explicit RFC 3339 lower bound.
    pub since: Option<String>,
    /// Lookback in seconds from now.
    pub window_secs: Option<u64>,
    /// Return every stored observation in storage order.
    pub all: Option<bool>,
}

impl SnapshotQuery {
    /// `None` means unbounded.
    fn resolve_bound(
        &self,
        default_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ApiError> {
        if self.all.unwrap_or(false) {
            return Ok(None);
        }
        if let Some(since) = &self.since {
            return normalize_timestamp(since)
                .map(Some)
                .map_err(|e| ApiError::BadRequest(format!("invalid since {:?}: {}", since, e)));
        }

        let window = self
            .window_secs
            .map(Duration::from_secs)
            .unwrap_or(default_window);
        let window = chrono::Duration::from_std(window)
            .map_err(|_| ApiError::BadRequest("window_secs out of range".to_string()))?;
        let bound = now
            .checked_sub_signed(window)
            .ok_or_else(|| ApiError::BadRequest("window_secs out of range".to_string()))?;
        Ok(Some(format_timestamp(bound)))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    observations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingest: Option<IngestStatsSnapshot>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Store(anyhow::Error),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Store(err) => {
                tracing::error!("Store query failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
