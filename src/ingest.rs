//! Module for the ingestion of device readings.
//!
//! A reading is validated first and then written twice: appended to the log of the device and
//! copied into its latest snapshot. The two writes are not transactional. If the append fails the
//! snapshot is not touched. If the snapshot write fails the log entry stays in place and the call
//! still reports a failure.
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{Method, StatusCode};
use thiserror::Error;

use crate::log_key::LogKey;
use crate::record::{DeviceReading, FieldValue, TelemetryRecord};
use crate::store::{latest_path, log_path, LatestUpdate, Store, StoreError};

/// Longest accepted device identifier in bytes.
const MAX_DEVICE_ID_LEN: usize = 768;

/// Characters that would change the meaning of the device path.
const FORBIDDEN_DEVICE_ID_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

#[derive(Debug)]
/// One request as handed over by the http front door.
pub struct IngestRequest {
    pub method: Method,
    pub body: Bytes,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("method {0} not allowed, only POST is accepted")]
    MethodNotAllowed(Method),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("appending to the device log failed: {0}")]
    LogAppend(#[source] StoreError),
    #[error("log entry {log_key} written but updating the latest snapshot failed: {source}")]
    LatestUpdate {
        log_key: LogKey,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            IngestError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            IngestError::LogAppend(_) | IngestError::LatestUpdate { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Checks that the device id is usable as a single path segment.
fn validate_device_id(device_id: Option<String>) -> Result<String, IngestError> {
    let device_id = match device_id {
        Some(device_id) if !device_id.is_empty() => device_id,
        _ => return Err(IngestError::InvalidRequest(String::from("missing deviceId"))),
    };

    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(IngestError::InvalidRequest(format!("deviceId longer than {} bytes", MAX_DEVICE_ID_LEN)));
    }

    if device_id.chars().any(|c| c.is_control() || FORBIDDEN_DEVICE_ID_CHARS.contains(&c)) {
        return Err(IngestError::InvalidRequest(String::from("deviceId contains forbidden characters")));
    }

    Ok(device_id)
}

/// Decodes the request body into the device id and the record to store.
fn decode(body: &[u8]) -> Result<(String, TelemetryRecord), IngestError> {
    let reading = match serde_json::from_slice::<DeviceReading>(body) {
        Ok(reading) => reading,
        Err(err) => return Err(IngestError::InvalidRequest(format!("malformed body: {}", err))),
    };

    let device_id = validate_device_id(reading.device_id)?;

    let payload = match reading.payload {
        Some(FieldValue::Map(fields)) => fields,
        None | Some(FieldValue::Null) => return Err(IngestError::InvalidRequest(String::from("missing payload"))),
        Some(other) => {
            return Err(IngestError::InvalidRequest(format!("payload must be an object, got {}", other.kind())));
        }
    };

    let timestamp = match reading.timestamp {
        Some(FieldValue::Null) => None,
        timestamp => timestamp,
    };

    if timestamp.as_ref().map_or(false, FieldValue::contains_nul) {
        return Err(IngestError::InvalidRequest(String::from("timestamp contains a NUL character")));
    }
    if payload.iter().any(|(name, value)| name.contains('\0') || value.contains_nul()) {
        return Err(IngestError::InvalidRequest(String::from("payload contains a NUL character")));
    }

    Ok((device_id, TelemetryRecord::compose(timestamp, payload)))
}

/// Handler that validates readings and writes them to the store.
///
/// The handler holds no state of its own. Calls for the same or different devices may run
/// concurrently.
pub struct IngestionHandler {
    store: Arc<dyn Store>,
}

impl IngestionHandler {
    pub fn new(store: Arc<dyn Store>) -> IngestionHandler {
        IngestionHandler { store }
    }

    /// Handles one request.
    ///
    /// # Returns
    ///
    /// * `Ok(key)` - The key of the new log entry, after the latest snapshot was written or found
    ///     to already hold a newer reading.
    ///
    /// * `Err(...)` - The request was rejected before any write, or one of the two writes failed.
    ///     At most one log entry and one snapshot write happen per call, and the snapshot is only
    ///     written after the log entry.
    ///
    pub async fn handle(&self, request: IngestRequest) -> Result<LogKey, IngestError> {
        if request.method != Method::POST {
            return Err(IngestError::MethodNotAllowed(request.method));
        }

        let (device_id, record) = decode(&request.body)?;

        let log_key = match self.store.append_log(&device_id, &record).await {
            Ok(log_key) => log_key,
            Err(err) => {
                log::error!(target: "telemetryd::ingest", "Could not append to \'{}\': \'{}\'", log_path(&device_id), err);
                return Err(IngestError::LogAppend(err));
            }
        };

        match self.store.set_latest(&device_id, &log_key, &record).await {
            Ok(LatestUpdate::Replaced) => {}
            Ok(LatestUpdate::Superseded) => {
                log::info!(target: "telemetryd::ingest", "Kept newer snapshot at \'{}\', entry \'{}\' is older", latest_path(&device_id), log_key);
            }
            Err(err) => {
                log::error!(target: "telemetryd::ingest", "Entry \'{}/{}\' written but \'{}\' is stale: \'{}\'", log_path(&device_id), log_key, latest_path(&device_id), err);
                return Err(IngestError::LatestUpdate { log_key, source: err });
            }
        }

        log::debug!(target: "telemetryd::ingest", "Stored reading \'{}/{}\': {}", log_path(&device_id), log_key, record);
        Ok(log_key)
    }
}
