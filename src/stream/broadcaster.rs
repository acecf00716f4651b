//! Per-record fan-out to a streaming sink
//!
//! One WebSocket connection per batch. Each record is encoded and written by
//! its own task; concurrency is capped by a semaphore. The write half is
//! owned by a single writer task and units submit frames to it over a
//! channel, so the socket never sees concurrent writes.
//!
//! Every unit reports a [`DeliveryOutcome`] on a bounded channel. The channel
//! closes once all units have reported and the connection has been closed.

use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Semaphore},
    task::JoinSet,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Failure that aborts a whole batch before anything is sent.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("invalid sink address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("handshake with {addr} timed out after {timeout:?}")]
    HandshakeTimeout { addr: String, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tungstenite::Error,
    },
}

/// Failure of a single record; siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("failed to write message: {0}")]
    Write(String),

    #[error("connection writer closed before the message was written")]
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Position of the record in the submitted batch.
    pub index: usize,
    pub result: Result<(), DeliveryError>,
}

impl DeliveryOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// All outcomes of one batch, ordered by record index.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BroadcastReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub handshake_timeout: Duration,
    pub max_in_flight: usize,
    pub outcome_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for BroadcasterConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            max_in_flight: config.max_in_flight,
            outcome_capacity: config.outcome_capacity,
        }
    }
}

struct WriteRequest {
    text: String,
    ack: oneshot::Sender<Result<(), DeliveryError>>,
}

#[derive(Debug, Clone, Default)]
pub struct CoinBroadcaster {
    config: BroadcasterConfig,
}

impl CoinBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.config
    }

    /// Connect and start dispatching `records`.
    ///
    /// Returns the outcome channel once the connection is up; the caller
    /// drains it until it closes. A connection failure is returned here and
    /// nothing is sent. An empty batch opens no connection.
    pub async fn start<T>(
        &self,
        addr: &str,
        records: Vec<T>,
    ) -> Result<mpsc::Receiver<DeliveryOutcome>, BroadcastError>
    where
        T: Serialize + Send + 'static,
    {
        let (outcome_tx, outcome_rx) = mpsc::channel(self.config.outcome_capacity.max(1));
        if records.is_empty() {
            return Ok(outcome_rx);
        }

        let ws = self.connect(addr).await?;
        info!(addr, records = records.len(), "📡 Connected to stream sink");

        let permits = self.config.max_in_flight.min(records.len()).max(1);
        let addr = addr.to_string();
        tokio::spawn(async move {
            dispatch(ws, records, permits, outcome_tx).await;
            debug!(%addr, "batch dispatch finished");
        });

        Ok(outcome_rx)
    }

    /// Deliver `records` and wait for every outcome.
    pub async fn broadcast<T>(
        &self,
        addr: &str,
        records: Vec<T>,
    ) -> Result<BroadcastReport, BroadcastError>
    where
        T: Serialize + Send + 'static,
    {
        let mut rx = self.start(addr, records).await?;

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);

        Ok(BroadcastReport { outcomes })
    }

    /// Fire-and-forget: failures are only logged.
    pub fn broadcast_detached<T>(&self, addr: String, records: Vec<T>) -> tokio::task::JoinHandle<()>
    where
        T: Serialize + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            match this.broadcast(&addr, records).await {
                Ok(report) => {
                    for failure in report.failures() {
                        if let Err(e) = &failure.result {
                            warn!(index = failure.index, error = %e, "record delivery failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "broadcast aborted"),
            }
        })
    }

    async fn connect(&self, addr: &str) -> Result<WsStream, BroadcastError> {
        let request = addr
            .into_client_request()
            .map_err(|e| BroadcastError::InvalidAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        match timeout(self.config.handshake_timeout, connect_async(request)).await {
            Ok(Ok((ws, response))) => {
                debug!(addr, status = %response.status(), "websocket handshake complete");
                Ok(ws)
            }
            Ok(Err(source)) => Err(BroadcastError::Connect {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(BroadcastError::HandshakeTimeout {
                addr: addr.to_string(),
                timeout: self.config.handshake_timeout,
            }),
        }
    }
}

async fn dispatch<T>(
    ws: WsStream,
    records: Vec<T>,
    permits: usize,
    outcome_tx: mpsc::Sender<DeliveryOutcome>,
) where
    T: Serialize + Send + 'static,
{
    let (sink, _stream) = ws.split();
    let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(permits);
    let writer = tokio::spawn(run_writer(sink, write_rx));

    let semaphore = Arc::new(Semaphore::new(permits));
    let mut units = JoinSet::new();

    for (index, record) in records.into_iter().enumerate() {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let write_tx = write_tx.clone();
        let outcome_tx = outcome_tx.clone();

        units.spawn(async move {
            let encoded = serde_json::to_string(&record);
            drop(record);
            let result = match encoded {
                Ok(text) => submit(text, &write_tx).await,
                Err(e) => Err(DeliveryError::Encode(e.to_string())),
            };
            drop(permit);

            if let Err(e) = &result {
                warn!(index, error = %e, "record delivery failed");
            }
            let _ = outcome_tx.send(DeliveryOutcome { index, result }).await;
        });
    }

    drop(write_tx);
    while let Some(joined) = units.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "delivery unit panicked");
        }
    }

    if let Err(e) = writer.await {
        warn!(error = %e, "stream writer task failed");
    }
    drop(outcome_tx);
}

async fn submit(text: String, write_tx: &mpsc::Sender<WriteRequest>) -> Result<(), DeliveryError> {
    let (ack, ack_rx) = oneshot::channel();
    write_tx
        .send(WriteRequest { text, ack })
        .await
        .map_err(|_| DeliveryError::ConnectionClosed)?;

    ack_rx.await.map_err(|_| DeliveryError::ConnectionClosed)?
}

async fn run_writer(mut sink: WsSink, mut rx: mpsc::Receiver<WriteRequest>) {
    let mut written = 0usize;
    while let Some(req) = rx.recv().await {
        let result = sink
            .send(Message::Text(req.text))
            .await
            .map_err(|e| DeliveryError::Write(e.to_string()));
        if result.is_ok() {
            written += 1;
        }
        let _ = req.ack.send(result);
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "error closing stream sink");
    }
    debug!(written, "stream writer closed");
}
