//! Upstream coin list client
//!
//! One GET per ingest cycle. Any failure aborts only that cycle.

use crate::models::{Coin, CoinsResponse};
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("non-200 status code received: {0}")]
    Status(u16),

    #[error("failed to decode coin list: {0}")]
    Decode(#[source] serde_json::Error),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) => "transport",
            FetchError::Status(_) => "status",
            FetchError::Decode(_) => "decode",
        }
    }
}

#[derive(Clone)]
pub struct CoinApiClient {
    client: Client,
    url: String,
}

impl CoinApiClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("CoinFeed/1.0 (Ingestor)")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and decode the current coin list.
    pub async fn fetch_coins(&self) -> std::result::Result<Vec<Coin>, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(FetchError::Transport)?;
        let decoded: CoinsResponse<Coin> =
            serde_json::from_slice(&body).map_err(FetchError::Decode)?;

        debug!(count = decoded.coins.len(), bytes = body.len(), "decoded coin list");
        Ok(decoded.coins)
    }
}
