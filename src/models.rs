use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One asset entry as served by the upstream coin list endpoint.
///
/// Missing fields decode to their zero value and `null` strings decode to
/// `""`; a type mismatch is still a decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Coin {
    pub id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub full_name: String,
    #[serde(rename = "coin", deserialize_with = "null_as_default")]
    pub symbol: String,
    pub buy_limit: i64,
    pub sell_limit: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub withdrawal_fee: String,
    #[serde(rename = "deposit_fees", deserialize_with = "null_as_default")]
    pub deposit_fee: String,
    #[serde(deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(deserialize_with = "null_as_default")]
    pub deposit_status: String,
    #[serde(deserialize_with = "null_as_default")]
    pub withdrawal_status: String,
    #[serde(deserialize_with = "null_as_default")]
    pub icon: String,
}

impl Coin {
    /// Stamp this entry with the capture time of its ingest cycle.
    pub fn observed_at(self, timestamp: &str) -> CoinObservation {
        CoinObservation {
            coin: self,
            timestamp: timestamp.to_string(),
        }
    }
}

/// A coin entry captured during one ingest cycle. `(id, timestamp)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinObservation {
    #[serde(flatten)]
    pub coin: Coin,
    pub timestamp: String,
}

impl CoinObservation {
    #[inline]
    pub fn id(&self) -> i64 {
        self.coin.id
    }
}

/// Body shape shared by the upstream API and our own `/get-coins` response.
/// A missing or `null` list decodes as empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinsResponse<T> {
    #[serde(
        default = "Vec::new",
        deserialize_with = "null_as_default",
        bound(deserialize = "T: Deserialize<'de>")
    )]
    pub coins: Vec<T>,
}

/// Canonical stored form: fixed-width RFC 3339 UTC with microseconds, so the
/// text sorts in chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse any RFC 3339 timestamp and re-emit it in canonical form.
pub fn normalize_timestamp(raw: &str) -> Result<String, chrono::ParseError> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim())?;
    Ok(format_timestamp(parsed.with_timezone(&Utc)))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
