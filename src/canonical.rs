use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw log record as received from the network, before normalization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub payload: String,
    pub received_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(payload: String) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }
}

/// The normalized record delivered to sinks.
///
/// Serializes to exactly three keys: `time` (unix seconds), `event`
/// (parsed JSON object or raw string), and `source` (source display name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalLog {
    pub time: i64,
    pub event: Value,
    pub source: String,
}

impl CanonicalLog {
    /// Normalize a raw record. If the payload parses as a JSON object the
    /// object becomes the event; any other payload stays a raw string.
    pub fn from_raw(record: &RawRecord, source_name: &str) -> Self {
        let event = match serde_json::from_str::<Value>(&record.payload) {
            Ok(Value::Object(map)) => Value::Object(map),
            _ => Value::String(record.payload.clone()),
        };

        Self {
            time: record.received_at.timestamp().max(0),
            event,
            source: source_name.to_string(),
        }
    }
}

/// Serialize a batch as one JSON object per line, without a trailing
/// newline. Both sinks build their payloads from this.
pub fn encode_ndjson(batch: &[CanonicalLog]) -> Result<String, serde_json::Error> {
    let mut lines = Vec::with_capacity(batch.len());
    for log in batch {
        lines.push(serde_json::to_string(log)?);
    }
    Ok(lines.join("\n"))
}
