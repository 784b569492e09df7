use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Device, DeviceId, PingRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device {0} not found")]
    NotFound(DeviceId),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Persistence for device definitions and their ping history.
///
/// Shared by every running monitor, so implementations must tolerate
/// concurrent calls for different devices.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError>;

    /// Removes the device together with all of its history.
    async fn delete_device(&self, id: DeviceId) -> Result<(), StoreError>;

    /// Appends a record and returns the id it was stored under.
    async fn append_ping_record(&self, record: PingRecord) -> Result<u64, StoreError>;

    async fn most_recent_ping_record(&self, device_id: DeviceId) -> Result<Option<PingRecord>, StoreError>;

    async fn most_recent_down_record(&self, device_id: DeviceId) -> Result<Option<PingRecord>, StoreError>;

    /// History of one device inside `[from, to]`, oldest first.
    async fn ping_records(
        &self,
        device_id: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PingRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    devices: BTreeMap<DeviceId, Device>,
    history: HashMap<DeviceId, Vec<PingRecord>>,
    next_record_id: u64,
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let store = Self::new();
        if let Ok(mut tables) = store.tables.lock() {
            for device in devices {
                tables.devices.insert(device.id, device);
            }
        }
        store
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Loads previously persisted history without reassigning ids.
    ///
    /// Records of unknown devices, or older than the device they point at,
    /// belong to a deleted device and are dropped.
    pub fn restore_records(&self, records: impl IntoIterator<Item = PingRecord>) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        for record in records {
            tables.next_record_id = tables.next_record_id.max(record.id);
            let belongs = tables
                .devices
                .get(&record.device_id)
                .is_some_and(|device| record.timestamp >= device.created_at);
            if belongs {
                tables.history.entry(record.device_id).or_default().push(record);
            }
        }
        for records in tables.history.values_mut() {
            records.sort_by_key(|r| (r.timestamp, r.id));
        }
        Ok(())
    }

    pub fn record_count(&self, device_id: DeviceId) -> usize {
        self.tables()
            .map(|t| t.history.get(&device_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn history(&self, device_id: DeviceId) -> Vec<PingRecord> {
        self.tables()
            .map(|t| t.history.get(&device_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        Ok(self.tables()?.devices.values().cloned().collect())
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.tables()?.devices.get(&id).cloned())
    }

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        self.tables()?.devices.insert(device.id, device);
        Ok(())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if tables.devices.remove(&id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        tables.history.remove(&id);
        Ok(())
    }

    async fn append_ping_record(&self, mut record: PingRecord) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        if !tables.devices.contains_key(&record.device_id) {
            return Err(StoreError::NotFound(record.device_id));
        }
        tables.next_record_id += 1;
        record.id = tables.next_record_id;
        let id = record.id;
        tables.history.entry(record.device_id).or_default().push(record);
        Ok(id)
    }

    async fn most_recent_ping_record(&self, device_id: DeviceId) -> Result<Option<PingRecord>, StoreError> {
        Ok(self
            .tables()?
            .history
            .get(&device_id)
            .and_then(|records| records.last().cloned()))
    }

    async fn most_recent_down_record(&self, device_id: DeviceId) -> Result<Option<PingRecord>, StoreError> {
        Ok(self
            .tables()?
            .history
            .get(&device_id)
            .and_then(|records| records.iter().rev().find(|r| !r.reachable).cloned()))
    }

    async fn ping_records(
        &self,
        device_id: DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PingRecord>, StoreError> {
        Ok(self
            .tables()?
            .history
            .get(&device_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.timestamp >= from && r.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    fn record(device_id: DeviceId, secs: i64, reachable: bool) -> PingRecord {
        PingRecord {
            id: 0,
            device_id,
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid ts"),
            latency: reachable.then(|| Duration::from_millis(4)),
            reachable,
            detail: if reachable { "ok".into() } else { "refused".into() },
        }
    }

    #[tokio::test]
    async fn most_recent_matches_last_append() {
        let store = MemoryStore::with_devices([Device::new(1, "10.0.0.1", "gw")]);
        let appended = record(1, 5, true);

        let id = store.append_ping_record(appended.clone()).await.expect("append");
        let latest = store.most_recent_ping_record(1).await.expect("query").expect("record");

        assert_eq!(latest.id, id);
        assert_eq!(latest.reachable, appended.reachable);
        assert_eq!(latest.latency, appended.latency);
        assert_eq!(latest.detail, appended.detail);
    }

    #[tokio::test]
    async fn most_recent_down_skips_up_records() {
        let store = MemoryStore::with_devices([Device::new(1, "10.0.0.1", "gw")]);
        for (secs, up) in [(0, false), (5, false), (10, true)] {
            store.append_ping_record(record(1, secs, up)).await.expect("append");
        }

        let down = store.most_recent_down_record(1).await.expect("query").expect("down");
        assert_eq!(down.timestamp, record(1, 5, false).timestamp);
        assert!(store.most_recent_down_record(2).await.expect("query").is_none());
    }

    #[tokio::test]
    async fn delete_cascades_history() {
        let store = MemoryStore::with_devices([Device::new(1, "a", "a"), Device::new(2, "b", "b")]);
        store.append_ping_record(record(1, 0, true)).await.expect("append");
        store.append_ping_record(record(2, 0, true)).await.expect("append");

        store.delete_device(1).await.expect("delete");

        assert_eq!(store.record_count(1), 0);
        assert_eq!(store.record_count(2), 1);
        assert!(store.append_ping_record(record(1, 5, true)).await.is_err());
        assert!(matches!(store.delete_device(1).await, Err(StoreError::NotFound(1))));
    }

    #[tokio::test]
    async fn restore_drops_records_older_than_their_device() {
        // device 1 was re-created after its earlier history was written
        let mut recreated = Device::new(1, "a", "a");
        recreated.created_at = record(1, 10, true).timestamp;
        let store = MemoryStore::with_devices([recreated]);

        store
            .restore_records([
                PingRecord { id: 3, ..record(1, 0, false) },
                PingRecord { id: 4, ..record(1, 20, true) },
                PingRecord { id: 9, ..record(7, 30, true) },
            ])
            .expect("restore");

        let history = store.history(1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 4);
        let next = store.append_ping_record(record(1, 40, true)).await.expect("append");
        assert_eq!(next, 10, "ids of dropped records are never handed out again");
    }

    #[tokio::test]
    async fn ping_records_filters_window() {
        let store = MemoryStore::with_devices([Device::new(1, "a", "a")]);
        for secs in [0, 10, 20, 30] {
            store.append_ping_record(record(1, secs, true)).await.expect("append");
        }

        let from = record(1, 10, true).timestamp;
        let to = record(1, 20, true).timestamp;
        let window = store.ping_records(1, from, to).await.expect("query");

        assert_eq!(window.len(), 2);
        assert_eq!(window[0].timestamp, from);
    }
}
