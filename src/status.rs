//! Observability snapshots for tracked keys.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::Algorithm;

/// Point-in-time view of one key's admission state.
///
/// Snapshots are taken after the refill/decay/expire step, so they reflect
/// the present time rather than the last operation.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    /// Algorithm that produced the snapshot.
    pub algorithm: Algorithm,

    /// The key the snapshot describes.
    pub key: String,

    /// Whether a single-token request would currently be denied.
    pub limited: bool,

    /// Milliseconds until a single-token request would be admissible.
    pub wait_ms: u64,

    /// How much of the effective capacity is in use, in [0, 100].
    pub usage_percent: f64,

    /// Algorithm-specific raw fields (token counts, window bounds, ...).
    pub raw: Value,
}

impl KeyStatus {
    /// Flatten the snapshot into a single JSON object: the common fields
    /// plus every raw field at the top level.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("algorithm".into(), Value::from(self.algorithm.as_str()));
        map.insert("key".into(), Value::from(self.key.clone()));
        map.insert("limited".into(), Value::from(self.limited));
        map.insert("wait_ms".into(), Value::from(self.wait_ms));
        map.insert("usage_percent".into(), Value::from(self.usage_percent));
        if let Value::Object(raw) = &self.raw {
            for (field, value) in raw {
                map.entry(field.clone()).or_insert_with(|| value.clone());
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_form_flattens_raw_fields() {
        let status = KeyStatus {
            algorithm: Algorithm::TokenBucket,
            key: "api".into(),
            limited: false,
            wait_ms: 0,
            usage_percent: 25.0,
            raw: json!({"tokens": 7.5, "capacity": 10}),
        };

        let map = status.to_map();
        assert_eq!(map["algorithm"], "token_bucket");
        assert_eq!(map["key"], "api");
        assert_eq!(map["limited"], false);
        assert_eq!(map["tokens"], 7.5);
        assert_eq!(map["capacity"], 10);
    }

    #[test]
    fn raw_fields_do_not_shadow_common_fields() {
        let status = KeyStatus {
            algorithm: Algorithm::FixedWindow,
            key: "api".into(),
            limited: true,
            wait_ms: 400,
            usage_percent: 100.0,
            raw: json!({"key": "impostor", "count": 3}),
        };

        let map = status.to_map();
        assert_eq!(map["key"], "api");
        assert_eq!(map["count"], 3);
    }
}
