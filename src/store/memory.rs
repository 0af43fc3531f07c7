//! In-process store backend.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{latest_path, log_path, LatestUpdate, Store, StoreError};
use crate::log_key::{LogKey, LogKeyGenerator};
use crate::record::TelemetryRecord;

#[derive(Debug, Default)]
struct DeviceEntry {
    logs: BTreeMap<LogKey, TelemetryRecord>,
    latest: Option<(LogKey, TelemetryRecord)>,
}

#[derive(Debug, Default)]
/// Store that keeps all devices in memory. Contents are lost when the process exits.
pub struct MemoryStore {
    keys: LogKeyGenerator,
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn devices(&self) -> Result<MutexGuard<'_, HashMap<String, DeviceEntry>>, StoreError> {
        self.devices
            .lock()
            .map_err(|_| StoreError::Unavailable(String::from("memory store lock poisoned")))
    }

    /// Log entries of a device in key order.
    #[cfg(test)]
    pub fn logs(&self, device_id: &str) -> Vec<(LogKey, TelemetryRecord)> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(device_id)
            .map(|entry| entry.logs.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    /// Latest snapshot of a device.
    #[cfg(test)]
    pub fn latest(&self, device_id: &str) -> Option<TelemetryRecord> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(device_id)
            .and_then(|entry| entry.latest.as_ref().map(|(_, record)| record.clone()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_log(&self, device_id: &str, record: &TelemetryRecord) -> Result<LogKey, StoreError> {
        let mut devices = self.devices()?;
        let key = self.keys.next_key();

        devices
            .entry(device_id.to_string())
            .or_default()
            .logs
            .insert(key.clone(), record.clone());

        log::trace!(target: "telemetryd::store", "Stored \'{}/{}\'", log_path(device_id), key);
        Ok(key)
    }

    async fn set_latest(&self, device_id: &str, log_key: &LogKey, record: &TelemetryRecord) -> Result<LatestUpdate, StoreError> {
        let mut devices = self.devices()?;
        let entry = devices.entry(device_id.to_string()).or_default();

        if let Some((stored_key, _)) = &entry.latest {
            if stored_key >= log_key {
                return Ok(LatestUpdate::Superseded);
            }
        }

        entry.latest = Some((log_key.clone(), record.clone()));
        log::trace!(target: "telemetryd::store", "Replaced \'{}\'", latest_path(device_id));
        Ok(LatestUpdate::Replaced)
    }
}
