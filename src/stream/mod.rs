pub mod broadcaster; // Per-record fan-out over one shared connection
pub mod relay; // Ingest cycle -> sink forwarding
#[cfg(test)]
pub mod test_support;

pub use broadcaster::{
    BroadcastError, BroadcastReport, BroadcasterConfig, CoinBroadcaster, DeliveryError,
    DeliveryOutcome,
};
pub use relay::run_cycle_relay;
