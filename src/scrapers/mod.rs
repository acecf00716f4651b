pub mod coin_api; // Upstream coin list client
pub mod coin_ingest; // Periodic fetch -> stamp -> store loop
#[cfg(test)]
pub mod test_support; // Fake upstream for tests

pub use coin_api::{CoinApiClient, FetchError};
pub use coin_ingest::{CoinIngestor, CycleError, IngestStats, IngestStatsSnapshot};
