//! Value encoding shared by every backend.
//!
//! A value that serializes to a JSON string is stored as the bare string (no
//! quoting), everything else as compact JSON. Decoding tries JSON first and
//! falls back to treating the raw text as a string, so the two directions
//! agree.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::KvResult;

pub fn encode<T: Serialize>(value: &T) -> KvResult<String> {
    match serde_json::to_value(value)? {
        Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

/// Parse a stored value into `T`, or `None` when it cannot be parsed (most
/// likely because the schema changed — the caller recreates the value).
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    if raw.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<T>(raw) {
        return Some(value);
    }
    match serde_json::from_value::<T>(Value::String(raw.to_string())) {
        Ok(value) => Some(value),
        Err(_) => {
            // Do not log the raw value: it may contain private data.
            error!(key, type_name = std::any::type_name::<T>(), "failed to decode stored value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn strings_round_trip_unquoted() {
        let encoded = encode(&"hello world".to_string()).unwrap();
        assert_eq!(encoded, "hello world");
        let decoded: String = decode("k", &encoded).unwrap();
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn structs_round_trip_as_json() {
        let sample = Sample {
            name: "a".to_string(),
            count: 3,
        };
        let encoded = encode(&sample).unwrap();
        assert_eq!(encoded, r#"{"name":"a","count":3}"#);
        let decoded: Sample = decode("k", &encoded).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn malformed_values_decode_to_none() {
        assert_eq!(decode::<Sample>("k", "not json"), None);
        assert_eq!(decode::<Sample>("k", ""), None);
        // A string target accepts anything non-empty.
        assert_eq!(decode::<String>("k", "not json"), Some("not json".to_string()));
    }
}
