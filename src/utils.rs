use std::time::Duration;
use crate::errors::{Result, StreamError};

/// Parse a duration string like "500ms", "12s", "5m" or "1h 30m"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(StreamError::config("Empty duration string"));
    }

    let duration = humantime::parse_duration(trimmed)
        .map_err(|e| StreamError::config(format!("Invalid duration '{}': {}", trimmed, e)))?;

    if duration.is_zero() {
        return Err(StreamError::config("Duration must be positive"));
    }

    Ok(duration)
}

/// Serde adapter so config files can say `health_interval = "12s"`.
pub mod humantime_serde {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Latency travels over the API as fractional milliseconds.
pub mod duration_millis {
    use std::time::Duration;
    use serde::Serializer;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_f64(d.as_secs_f64() * 1000.0),
            None => serializer.serialize_none(),
        }
    }
}
