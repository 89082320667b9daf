//! # Server Payload Shapes
//!
//! The fleet servers are loose about JSON types: identities and counters show
//! up as numbers or numeric strings, flags as booleans, 0/1 or text. These
//! structs accept all of those and normalize them for the mapper.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Generic `{ "data": ... }` wrapper used by the cloud API.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEnvelope<T> {
    pub data: T,
}

/// A data source installed on the edge, enumerated during registration.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledSource {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
}

/// One row of the computed completion-time lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRow {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub prdct_end: Option<String>,
}

/// One machine of the initial snapshot (`/machine/currentList`).
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentListEntry {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(rename = "machineNo", default, deserialize_with = "lenient::string")]
    pub display_number: String,
    #[serde(rename = "mid", default, deserialize_with = "lenient::string")]
    pub name: String,
    #[serde(rename = "program", default, deserialize_with = "lenient::string")]
    pub program_name: String,
    #[serde(rename = "prdctEnd", default, deserialize_with = "lenient::opt_string")]
    pub planned_completion_time: Option<String>,
    /// Remaining cycle, milliseconds.
    #[serde(default, deserialize_with = "lenient::u64")]
    pub period: u64,
    /// Wait time, milliseconds.
    #[serde(default, deserialize_with = "lenient::u64")]
    pub wait: u64,
    #[serde(rename = "partCount", default, deserialize_with = "lenient::u64")]
    pub produced_count: u64,
    #[serde(rename = "planCount", default, deserialize_with = "lenient::u64")]
    pub planned_count: u64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub execution: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub mode: String,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub pause: bool,
    #[serde(rename = "isReceiveMessage", default, deserialize_with = "lenient::bool")]
    pub has_unread_message: bool,
    #[serde(rename = "isReceiveAlarm", default, deserialize_with = "lenient::bool")]
    pub has_unread_alarm: bool,
    #[serde(rename = "isReceivePartCount", default, deserialize_with = "lenient::bool")]
    pub has_pending_part_count_event: bool,
    #[serde(rename = "isChangePalette", default, deserialize_with = "lenient::bool")]
    pub has_pending_palette_change: bool,
}

/// One element of a structured `machine` event. Absent fields leave the
/// matched record untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineStatus {
    #[serde(deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub execution: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub pause: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub program: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub part_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub plan_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub period: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_u64")]
    pub wait: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub is_receive_message: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub is_receive_alarm: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub is_receive_part_count: Option<bool>,
    #[serde(default, deserialize_with = "lenient::opt_bool")]
    pub is_change_palette: Option<bool>,
}

/// Parses the timestamp formats the servers emit. Unknown formats yield `None`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

pub(crate) mod lenient {
    use super::*;

    fn value_to_string(value: Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    fn value_to_u64(value: &Value) -> Option<u64> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<u64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
            }
            _ => None,
        }
    }

    fn value_to_bool(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "y" => Some(true),
                "false" | "0" | "n" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(value_to_string(Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(value_to_string(Value::deserialize(d)?))
    }

    pub fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        Ok(value_to_u64(&Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(value_to_u64(&Value::deserialize(d)?))
    }

    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(value_to_bool(&Value::deserialize(d)?).unwrap_or_default())
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Ok(value_to_bool(&Value::deserialize(d)?))
    }
}
