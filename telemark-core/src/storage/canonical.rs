use crate::model::Snapshot;
use crate::storage::content_store::compute_hash;
use crate::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Serialize `value` as JSON with object keys sorted at every depth and no
/// whitespace. Hash equality between the local store and the ledger depends
/// on this being stable.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&sort_keys(value))?;
    Ok(bytes)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// SHA-256 (hex) of the canonical serialization of a snapshot.
pub fn snapshot_hash(snapshot: &Snapshot) -> Result<String> {
    let bytes = canonical_json(snapshot)?;
    Ok(compute_hash(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Accelerometer, Location, TelemetryData};
    use chrono::{TimeZone, Utc};

    fn snapshot() -> Snapshot {
        Snapshot {
            timestamp: Utc.with_ymd_and_hms(2026, 5, 1, 8, 30, 0).unwrap(),
            data: TelemetryData {
                location: Some(Location::new(1.0, 2.0)),
                accelerometer: Some(Accelerometer::new(0.1, 0.2, 9.8)),
                camera: None,
                last_update: None,
            },
            restored_from_ledger: false,
        }
    }

    #[test]
    fn test_keys_sorted_at_every_depth() {
        let value: Value = serde_json::from_str(r#"{"b":{"z":1,"a":[{"y":2,"x":1}]},"a":0}"#).unwrap();
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":0,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = snapshot();
        let b = snapshot();
        assert_eq!(snapshot_hash(&a).unwrap(), snapshot_hash(&b).unwrap());
        assert_eq!(snapshot_hash(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_hash_survives_reparse() {
        let original = snapshot();
        let bytes = canonical_json(&original).unwrap();
        let reparsed: Snapshot = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(canonical_json(&reparsed).unwrap(), bytes);
        assert_eq!(
            snapshot_hash(&reparsed).unwrap(),
            snapshot_hash(&original).unwrap()
        );
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = snapshot();
        let mut b = snapshot();
        b.data.location = Some(Location::new(1.0, 2.5));
        assert_ne!(snapshot_hash(&a).unwrap(), snapshot_hash(&b).unwrap());
    }
}
