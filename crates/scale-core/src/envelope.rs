use serde::Serialize;
use serde_json::{Map, Value};

use crate::sample::Sample;

/// Tagged outbound message: `{ "type": ..., "data": ... }`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope<'a> {
    /// Recent samples, sent once to a newly connected client.
    History(&'a [Sample]),
    /// A reading as the client sent it, with its timestamp filled in.
    Weight(&'a Map<String, Value>),
}

impl Envelope<'_> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
