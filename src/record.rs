//! Module that contains the record types accepted from and persisted for devices.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the field the reading timestamp is stored under.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Ordered mapping of telemetry field names to values.
pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
/// A single schema-less telemetry value.
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<FieldValue>),
    Map(Fields),
}

impl FieldValue {
    /// Name of the variant, used for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Number(_) => "number",
            FieldValue::Text(_) => "string",
            FieldValue::List(_) => "array",
            FieldValue::Map(_) => "object",
        }
    }

    /// Whether any string or object key in this value holds a NUL character.
    ///
    /// Postgres text and jsonb columns cannot store `\u0000`.
    pub fn contains_nul(&self) -> bool {
        match self {
            FieldValue::Null | FieldValue::Bool(_) | FieldValue::Number(_) => false,
            FieldValue::Text(text) => text.contains('\0'),
            FieldValue::List(values) => values.iter().any(FieldValue::contains_nul),
            FieldValue::Map(fields) => fields
                .iter()
                .any(|(name, value)| name.contains('\0') || value.contains_nul()),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(value.into())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

#[derive(Deserialize, Debug)]
/// Struct representing one reading as posted by a device.
///
/// Every field is optional at this level so that a missing field can be reported as an invalid
/// request instead of a decoding failure.
pub struct DeviceReading {
    /// Identifier of the device that sent the reading.
    #[serde(rename = "deviceId", default)]
    pub device_id: Option<String>,
    /// Caller supplied timestamp, passed through as is.
    #[serde(default)]
    pub timestamp: Option<FieldValue>,
    /// Device specific telemetry.
    #[serde(default)]
    pub payload: Option<FieldValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
/// Flat record written to a device log and to its latest snapshot.
pub struct TelemetryRecord(Fields);

impl TelemetryRecord {
    /// Builds the stored record from the reading timestamp and its payload.
    ///
    /// The timestamp is written first and the payload fields are laid over it, so a payload field
    /// named `timestamp` replaces the reading timestamp. The merge is shallow: nested payload
    /// values are kept as they are. A `None` timestamp leaves the field out.
    pub fn compose(timestamp: Option<FieldValue>, payload: Fields) -> TelemetryRecord {
        let mut fields = Fields::new();
        if let Some(timestamp) = timestamp {
            fields.insert(TIMESTAMP_FIELD.to_string(), timestamp);
        }

        for (name, value) in payload {
            if let Some(replaced) = fields.insert(name, value) {
                log::debug!(target: "telemetryd::ingest", "Payload field overrides reading timestamp \'{:?}\'", replaced);
            }
        }

        TelemetryRecord(fields)
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    #[cfg(test)]
    pub fn fields(&self) -> &Fields {
        &self.0
    }
}

impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}
