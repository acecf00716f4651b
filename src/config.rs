//! Process configuration, read from the environment (and `.env`).

use anyhow::{bail, Context, Result};
use std::{env, str::FromStr, time::Duration};

pub const DEFAULT_COIN_API_URL: &str = "https://authentication.bit24hr.in/api/v1/get-coins";

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub bind_addr: String,
    pub ingest: IngestConfig,
    pub stream: StreamConfig,
    /// Default lookback for `/get-coins` when no bound is given.
    pub snapshot_window: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub enabled: bool,
    pub api_url: String,
    pub interval: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Relay is off when no sink is configured.
    pub sink_url: Option<String>,
    pub handshake_timeout: Duration,
    pub max_in_flight: usize,
    pub outcome_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: DEFAULT_COIN_API_URL.to_string(),
            interval: Duration::from_millis(1000),
            fetch_timeout: Duration::from_millis(900),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sink_url: None,
            handshake_timeout: Duration::from_secs(10),
            max_in_flight: 32,
            outcome_capacity: 64,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "coins.db".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            ingest: IngestConfig::default(),
            stream: StreamConfig::default(),
            snapshot_window: Duration::from_secs(1),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            database_path: env::var("COIN_DB_PATH").unwrap_or(defaults.database_path),
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            ingest: IngestConfig {
                enabled: env_flag("INGEST_ENABLED", defaults.ingest.enabled),
                api_url: env::var("COIN_API_URL").unwrap_or(defaults.ingest.api_url),
                interval: env_parse("INGEST_INTERVAL_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.ingest.interval),
                fetch_timeout: env_parse("FETCH_TIMEOUT_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.ingest.fetch_timeout),
            },
            stream: StreamConfig {
                sink_url: env::var("STREAM_SINK_URL")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
                handshake_timeout: env_parse("STREAM_HANDSHAKE_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stream.handshake_timeout),
                max_in_flight: env_parse("BROADCAST_MAX_IN_FLIGHT")?
                    .unwrap_or(defaults.stream.max_in_flight),
                outcome_capacity: env_parse("BROADCAST_OUTCOME_CAPACITY")?
                    .unwrap_or(defaults.stream.outcome_capacity),
            },
            snapshot_window: env_parse("SNAPSHOT_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.snapshot_window),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.interval.is_zero() {
            bail!("INGEST_INTERVAL_MS must be greater than zero");
        }
        if self.ingest.fetch_timeout >= self.ingest.interval {
            bail!(
                "fetch timeout ({:?}) must be shorter than the ingest interval ({:?})",
                self.ingest.fetch_timeout,
                self.ingest.interval
            );
        }
        if self.stream.max_in_flight == 0 {
            bail!("BROADCAST_MAX_IN_FLIGHT must be at least 1");
        }
        if self.stream.outcome_capacity == 0 {
            bail!("BROADCAST_OUTCOME_CAPACITY must be at least 1");
        }
        if let Some(url) = &self.stream.sink_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                bail!("STREAM_SINK_URL must be a ws:// or wss:// address, got {}", url);
            }
        }
        Ok(())
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        _ => Ok(None),
    }
}
