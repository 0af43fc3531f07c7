//! Module for the persistence backends device logs and snapshots are written to.
//!
//! Every device owns two locations: an append-only log of records, each stored under a freshly
//! generated [`LogKey`], and a single latest snapshot that is replaced on every accepted reading.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log_key::LogKey;
use crate::record::TelemetryRecord;

pub mod database;
pub mod memory;

pub use database::{DatabaseParameters, PostgresStore};
pub use memory::MemoryStore;

#[derive(Error, Debug)]
/// Failure of a single store write.
pub enum StoreError {
    /// The backend could not be reached, the write did not happen.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend rejected the write.
    #[error("store write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of a latest snapshot write.
pub enum LatestUpdate {
    /// The snapshot now holds the given record.
    Replaced,
    /// A record with a newer log key is already stored, the snapshot was left untouched.
    Superseded,
}

/// Write interface of the device store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends a record to the device log under a newly generated, time ordered key.
    async fn append_log(&self, device_id: &str, record: &TelemetryRecord) -> Result<LogKey, StoreError>;

    /// Replaces the latest snapshot of the device.
    ///
    /// The write only takes effect when `log_key` sorts after the key of the stored snapshot, so a
    /// slower request can never roll back the snapshot of a reading that was logged after it.
    async fn set_latest(&self, device_id: &str, log_key: &LogKey, record: &TelemetryRecord) -> Result<LatestUpdate, StoreError>;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "backend", rename_all = "snake_case")]
/// Selection of the store backend in the configuration file.
pub enum StoreParameters {
    /// Keep everything in process memory.
    Memory,
    /// Write to a postgres database.
    Postgres(DatabaseParameters),
}

/// Path of the log collection of a device.
pub fn log_path(device_id: &str) -> String {
    format!("devices/{}/logs", device_id)
}

/// Path of the latest snapshot of a device.
pub fn latest_path(device_id: &str) -> String {
    format!("devices/{}/latest", device_id)
}
