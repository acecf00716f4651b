//! CoinFeed Backend Library
//!
//! Periodic coin list ingestion into SQLite, snapshot queries over recent
//! observations, and per-record fan-out to a WebSocket sink.

pub mod api;
pub mod config;
pub mod models;
pub mod scrapers;
pub mod storage;
pub mod stream;
