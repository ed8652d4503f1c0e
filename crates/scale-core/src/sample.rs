use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One archived weight reading.
///
/// This is also the on-disk and `history` wire shape:
/// `{ "weight": <any>, "timestamp": <ms>, "datetime": <ISO-8601> }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Opaque to the server. `null` when the reading carried no weight.
    #[serde(default)]
    pub weight: serde_json::Value,
    /// Milliseconds since the Unix epoch, client-supplied or assigned at receipt.
    pub timestamp: i64,
    /// Server wall-clock time of receipt.
    pub datetime: String,
}

impl Sample {
    pub fn new(weight: serde_json::Value, timestamp: i64, received_at: DateTime<Utc>) -> Self {
        Self {
            weight,
            timestamp,
            datetime: iso_millis(received_at),
        }
    }
}

/// `2024-01-31T12:00:00.123Z`, the same shape JavaScript's `toISOString` produces.
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
