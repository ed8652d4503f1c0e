use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::sample::Sample;

/// Why an inbound payload could not be treated as a reading.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A decoded inbound reading: the client's JSON object, kept whole so
/// that fields the relay does not understand are echoed back verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    fields: Map<String, Value>,
}

impl Reading {
    /// Best-effort decode. Anything other than a JSON object is rejected.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        match serde_json::from_slice::<Value>(raw)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DecodeError::NotAnObject(kind(&other))),
        }
    }

    /// Client-supplied timestamp, if it is an integer number of milliseconds.
    pub fn timestamp(&self) -> Option<i64> {
        let value = self.fields.get("timestamp")?;
        if let Some(ms) = value.as_i64() {
            return Some(ms);
        }
        // Some clients emit `1700000000000.0`.
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f as i64)
    }

    pub fn weight(&self) -> Value {
        self.fields.get("weight").cloned().unwrap_or(Value::Null)
    }

    /// Fill in a missing timestamp with the receipt time and build the
    /// sample to archive. The reading itself carries the assigned
    /// timestamp afterwards so the broadcast and the archive agree.
    pub fn stamp(&mut self, received_at: DateTime<Utc>) -> Sample {
        let timestamp = match self.timestamp() {
            Some(ms) => ms,
            None => {
                let ms = received_at.timestamp_millis();
                self.fields.insert("timestamp".into(), Value::from(ms));
                ms
            }
        };
        Sample::new(self.weight(), timestamp, received_at)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
