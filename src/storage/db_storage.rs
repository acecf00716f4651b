//! SQLite-backed coin observation store
//!
//! - WAL mode so snapshot reads proceed while a cycle is being written
//! - One transaction per ingest cycle, one INSERT per observation
//! - Timestamps stored as canonical RFC 3339 text (sorts chronologically)

use crate::models::{Coin, CoinObservation};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS coins (
    id INTEGER NOT NULL,
    full_name TEXT,
    coin TEXT,
    buy_limit INTEGER,
    sell_limit INTEGER,
    withdrawal_fee TEXT,
    deposit_fees TEXT,
    status TEXT,
    deposit_status TEXT,
    withdrawal_status TEXT,
    icon TEXT,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (id, timestamp)
);

CREATE INDEX IF NOT EXISTS idx_coins_timestamp
    ON coins(timestamp DESC);
"#;

const SELECT_COLUMNS: &str = "SELECT id, full_name, coin, buy_limit, sell_limit, withdrawal_fee, \
     deposit_fees, status, deposit_status, withdrawal_status, icon, timestamp FROM coins";

/// An insert that failed within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Position of the coin in the cycle's input slice.
    pub index: usize,
    pub id: i64,
    pub error: String,
}

/// Result of writing one ingest cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub timestamp: String,
    pub attempted: usize,
    pub inserted: usize,
    pub failures: Vec<RowFailure>,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, index: usize) -> bool {
        self.failures.iter().any(|f| f.index == index)
    }
}

/// Shared handle to the coin table. Clone the `Arc`, not the store.
pub struct DbCoinStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DbCoinStorage {
    /// Open (or create) the store and apply the schema.
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // guarded by our own Mutex

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && db_path != ":memory:" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM coins", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Coin store opened at {} ({} observations)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Write every coin of one cycle stamped with `timestamp`.
    ///
    /// Inserts are independent: a failing row is recorded in the report and
    /// the rest still land. The cycle commits as a unit, so readers see all
    /// of its successful rows or none of them.
    pub fn store_cycle(&self, timestamp: &str, coins: &[Coin]) -> Result<CycleReport> {
        let mut report = CycleReport {
            timestamp: timestamp.to_string(),
            attempted: coins.len(),
            ..Default::default()
        };
        if coins.is_empty() {
            return Ok(report);
        }

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .context("Failed to begin cycle transaction")?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO coins
                 (id, full_name, coin, buy_limit, sell_limit, withdrawal_fee, deposit_fees,
                  status, deposit_status, withdrawal_status, icon, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for (index, coin) in coins.iter().enumerate() {
                let res = stmt.execute(params![
                    coin.id,
                    &coin.full_name,
                    &coin.symbol,
                    coin.buy_limit,
                    coin.sell_limit,
                    &coin.withdrawal_fee,
                    &coin.deposit_fee,
                    &coin.status,
                    &coin.deposit_status,
                    &coin.withdrawal_status,
                    &coin.icon,
                    timestamp,
                ]);
                match res {
                    Ok(_) => {
                        report.inserted += 1;
                        debug!(id = coin.id, coin = %coin.symbol, timestamp, "inserted coin");
                    }
                    Err(e) => {
                        // SQLite rolls the whole transaction back on some errors
                        // (BUSY, IOERR, FULL, RAISE(ROLLBACK)); later inserts would
                        // autocommit one by one.
                        if tx.is_autocommit() {
                            warn!(id = coin.id, error = %e, "cycle transaction rolled back");
                            return Err(anyhow::Error::new(e).context(format!(
                                "Cycle {} rolled back at coin {}",
                                timestamp, coin.id
                            )));
                        }
                        warn!(id = coin.id, error = %e, "failed to insert coin");
                        report.failures.push(RowFailure {
                            index,
                            id: coin.id,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        tx.commit().context("Failed to commit cycle transaction")?;
        Ok(report)
    }

    /// Snapshot read.
    ///
    /// With a bound: rows with `timestamp >= since`, newest first, ties in
    /// insertion order. Without: every row in storage order. One malformed
    /// row fails the whole read.
    pub fn get_since(&self, since: Option<&str>) -> Result<Vec<CoinObservation>> {
        let conn = self.conn.lock();

        let rows = match since {
            Some(since) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "{SELECT_COLUMNS} WHERE timestamp >= ?1 ORDER BY timestamp DESC, rowid ASC"
                ))?;
                let rows = stmt.query_map(params![since], Self::row_to_observation)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY rowid"))?;
                let rows = stmt.query_map([], Self::row_to_observation)?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        };

        rows.context("Failed to read coin observations")
    }

    /// Number of stored observations.
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM coins", [], |row| row.get(0))
            .context("Failed to count coin observations")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    #[inline]
    fn row_to_observation(row: &rusqlite::Row) -> rusqlite::Result<CoinObservation> {
        Ok(CoinObservation {
            coin: Coin {
                id: row.get(0)?,
                full_name: row.get(1)?,
                symbol: row.get(2)?,
                buy_limit: row.get(3)?,
                sell_limit: row.get(4)?,
                withdrawal_fee: row.get(5)?,
                deposit_fee: row.get(6)?,
                status: row.get(7)?,
                deposit_status: row.get(8)?,
                withdrawal_status: row.get(9)?,
                icon: row.get(10)?,
            },
            timestamp: row.get(11)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn raw_execute(&self, sql: &str) {
        self.conn.lock().execute_batch(sql).expect("raw sql");
    }
}
