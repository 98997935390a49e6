//! Helpers over schemaless JSON records
//!
//! Records exchanged with peers are free-form JSON objects. These helpers
//! resolve dot paths (`@self.published`, `organisation.name`), read timestamps
//! in the formats peers emit, and hash records deterministically.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use bridge_traits::SELF_KEY;

/// Envelope fields added by stores and aggregators; never part of listing content
pub const ENVELOPE_FIELDS: &[&str] = &[SELF_KEY, "_self", "_source", "_links", "_embedded"];

/// Resolve a dot path inside a JSON value. Missing segments resolve to `None`.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        Value::Null => None,
        other => Some(other),
    }
}

/// Identifier used for deduplication: `id`, then `@self.id`, then `uuid`
pub fn record_id(record: &Value) -> Option<String> {
    ["id", "@self.id", "uuid"]
        .iter()
        .find_map(|path| resolve_path(record, path).and_then(scalar_string))
}

/// Strings as-is, numbers in their JSON form; anything else is not an identifier
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a timestamp in any of the shapes peers are known to send
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC assumed), bare dates and unix
/// seconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp_str(raw),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Deterministic serialization: object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical form of `object`, ignoring `volatile` keys at the top level
pub fn content_hash(object: &Map<String, Value>, volatile: &[&str]) -> String {
    let filtered: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !volatile.contains(&key.as_str()) && !ENVELOPE_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&Value::Object(filtered)).as_bytes());
    format!("{:x}", hasher.finalize())
}
