//! Serde helpers for config fields that may arrive as strings.
//!
//! Environment placeholders always resolve to strings, so a numeric or
//! boolean field written as `"${MAX_RETRIES:3}"` has to accept `"3"`.

use std::fmt::Display;
use std::str::FromStr;

use serde::de::{DeserializeOwned, Error};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn parse<T, E>(s: &str) -> Result<T, E>
where
    T: FromStr,
    T::Err: Display,
    E: Error,
{
    s.trim()
        .parse::<T>()
        .map_err(|e| E::custom(format!("invalid value '{}': {}", s, e)))
}

/// A `T` given natively or as a string that parses as one.
pub fn from_str_or_value<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + FromStr,
    T::Err: Display,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => parse(&s),
        other => serde_json::from_value(other).map_err(D::Error::custom),
    }
}

/// Optional variant of [`from_str_or_value`]; `null` and a blank string
/// (an unset placeholder) are `None`.
pub fn opt_from_str_or_value<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + FromStr,
    T::Err: Display,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse(&s).map(Some),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(D::Error::custom),
    }
}

/// Read a setting value as `T`, accepting the string form.
pub fn value_as<T>(value: &Value) -> Option<T>
where
    T: DeserializeOwned + FromStr,
{
    match value {
        Value::String(s) => s.trim().parse().ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(deserialize_with = "from_str_or_value")]
        count: u32,
        #[serde(deserialize_with = "from_str_or_value")]
        on: bool,
        #[serde(default, deserialize_with = "opt_from_str_or_value")]
        limit: Option<u32>,
    }

    #[test]
    fn test_native_and_string_forms() {
        let native: Sample = serde_json::from_value(json!({"count": 3, "on": true, "limit": 9})).unwrap();
        let strings: Sample =
            serde_json::from_value(json!({"count": " 3", "on": "true", "limit": "9"})).unwrap();
        assert_eq!((native.count, native.on, native.limit), (3, true, Some(9)));
        assert_eq!((strings.count, strings.on, strings.limit), (3, true, Some(9)));
    }

    #[test]
    fn test_blank_optional_is_none() {
        let s: Sample = serde_json::from_value(json!({"count": 1, "on": "false", "limit": ""})).unwrap();
        assert_eq!(s.limit, None);
        assert!(!s.on);
    }

    #[test]
    fn test_unparseable_string_is_an_error() {
        let err = serde_json::from_value::<Sample>(json!({"count": "high", "on": true})).unwrap_err();
        assert!(err.to_string().contains("invalid value 'high'"));
    }

    #[test]
    fn test_value_as() {
        assert_eq!(value_as::<u64>(&json!("0042")), Some(42));
        assert_eq!(value_as::<u64>(&json!(7)), Some(7));
        assert_eq!(value_as::<bool>(&json!("true")), Some(true));
        assert_eq!(value_as::<u64>(&json!("lots")), None);
    }
}
