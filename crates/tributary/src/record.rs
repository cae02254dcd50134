//! Schema-flexible records and fail-soft accessors.
//!
//! Upstream payloads differ per resource and change independently of the
//! engine, so records stay untyped JSON maps (key order preserved). The
//! helpers here never fail: a missing key or a value of the wrong type reads
//! as `None` (or `false`).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// An upstream object or event.
pub type Record = Map<String, Value>;

/// Discriminator key carried by every upstream record.
pub const KIND_KEY: &str = "object";

/// Discriminator value of change events.
pub const EVENT_KIND: &str = "event";

/// Key set on event payloads by the deletion tagger.
pub const DELETED_KEY: &str = "is_deleted";

/// Get a string value.
pub fn get_str<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

/// Get a boolean value, `false` when absent or not a boolean.
pub fn get_bool(record: &Record, key: &str) -> bool {
    record.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Get an integer value.
pub fn get_i64(record: &Record, key: &str) -> Option<i64> {
    record.get(key).and_then(Value::as_i64)
}

/// Get a nested map.
pub fn get_map<'a>(record: &'a Record, key: &str) -> Option<&'a Record> {
    record.get(key).and_then(Value::as_object)
}

/// Get a nested map for in-place edits.
pub fn get_map_mut<'a>(record: &'a mut Record, key: &str) -> Option<&'a mut Record> {
    record.get_mut(key).and_then(Value::as_object_mut)
}

/// Get the map elements of a nested list, skipping anything that isn't a map.
pub fn get_map_list<'a>(record: &'a Record, key: &str) -> Vec<&'a Record> {
    record
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

/// Read a unix-seconds field and format it as `YYYY-MM-DDTHH:MM:SS.000Z`.
///
/// Zero is treated as absent.
pub fn get_timestamp(record: &Record, key: &str) -> Option<String> {
    let secs = get_i64(record, key).filter(|secs| *secs != 0)?;
    let ts: DateTime<Utc> = DateTime::from_timestamp(secs, 0)?;
    Some(ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Copy every leaf of `input` into `output`, joining nested keys with `_`
/// and prefixing them with `prefix`.
pub fn flatten_into(input: &Record, prefix: &str, output: &mut Record) {
    for (key, value) in input {
        match value {
            Value::Object(inner) => flatten_into(inner, &format!("{prefix}{key}_"), output),
            other => {
                output.insert(format!("{prefix}{key}"), other.clone());
            }
        }
    }
}

/// The discriminator of a record, if any.
pub fn kind(record: &Record) -> Option<&str> {
    get_str(record, KIND_KEY).filter(|kind| !kind.is_empty())
}

/// Whether the record is a change event.
pub fn is_event(record: &Record) -> bool {
    kind(record) == Some(EVENT_KIND)
}

/// The payload of an event (`data.object`), restricted to the given kinds.
///
/// An empty `kinds` slice accepts any payload.
pub fn event_payload<'a>(event: &'a Record, kinds: &[&str]) -> Option<&'a Record> {
    let payload = get_map(get_map(event, "data")?, "object")?;
    accepts(payload, kinds).then_some(payload)
}

/// Mutable variant of [`event_payload`].
pub fn event_payload_mut<'a>(event: &'a mut Record, kinds: &[&str]) -> Option<&'a mut Record> {
    let payload = get_map_mut(get_map_mut(event, "data")?, "object")?;
    if accepts(payload, kinds) {
        Some(payload)
    } else {
        None
    }
}

fn accepts(payload: &Record, kinds: &[&str]) -> bool {
    kinds.is_empty() || kind(payload).is_some_and(|k| kinds.contains(&k))
}
