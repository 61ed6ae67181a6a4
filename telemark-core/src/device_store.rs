use crate::ledger::LedgerOutbox;
use crate::model::{
    Accelerometer, HistoryEntry, Location, Snapshot, TelemetryUpdate, validate_device_id,
};
use crate::storage::{ContentStore, DeviceCatalog, snapshot_hash};
use crate::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Cached state of one device, guarded by that device's lock.
#[derive(Debug, Default)]
pub struct DeviceSlot {
    latest: Option<Snapshot>,
    loaded: bool,
}

/// Exclusive access to one device. Holders may write local artifacts; call
/// [`DeviceGuard::invalidate`] afterwards so the next ingest re-reads the
/// latest snapshot from disk.
pub struct DeviceGuard {
    slot: OwnedMutexGuard<DeviceSlot>,
}

impl DeviceGuard {
    pub fn invalidate(&mut self) {
        self.slot.latest = None;
        self.slot.loaded = false;
    }
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub hash: String,
    pub snapshot: Snapshot,
    /// The merged snapshot matched an existing blob byte for byte.
    pub reused: bool,
}

/// Ingestion orchestrator: merge, content-address, persist, attest.
///
/// Updates to one device are serialized by a per-device async lock; updates
/// to different devices run in parallel.
pub struct DeviceStore {
    content: Arc<ContentStore>,
    catalog: Arc<DeviceCatalog>,
    outbox: Arc<dyn LedgerOutbox>,
    slots: Mutex<HashMap<String, Arc<AsyncMutex<DeviceSlot>>>>,
}

impl DeviceStore {
    pub fn new(
        content: Arc<ContentStore>,
        catalog: Arc<DeviceCatalog>,
        outbox: Arc<dyn LedgerOutbox>,
    ) -> Self {
        Self {
            content,
            catalog,
            outbox,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    pub fn catalog(&self) -> &Arc<DeviceCatalog> {
        &self.catalog
    }

    pub fn outbox(&self) -> &Arc<dyn LedgerOutbox> {
        &self.outbox
    }

    pub async fn lock(&self, device_id: &str) -> Result<DeviceGuard> {
        validate_device_id(device_id)?;
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(DeviceSlot::default())))
                .clone()
        };

        Ok(DeviceGuard {
            slot: slot.lock_owned().await,
        })
    }

    /// Merge `update` into the device's latest snapshot and persist it.
    ///
    /// The ledger submission is handed to the outbox and never awaited here;
    /// a ledger failure cannot undo the local write.
    pub async fn ingest(&self, device_id: &str, update: &TelemetryUpdate) -> Result<IngestResult> {
        let mut guard = self.lock(device_id).await?;

        if !guard.slot.loaded {
            guard.slot.latest = self.content.latest(device_id).await?;
            guard.slot.loaded = true;
        }

        let snapshot = Snapshot::merged(guard.slot.latest.as_ref(), update, Utc::now());
        let hash = snapshot_hash(&snapshot)?;

        let stored = match self.content.put(device_id, &hash, &snapshot).await {
            Ok(stored) => stored,
            Err(error) => {
                tracing::error!("Failed to store snapshot for device {}: {}", device_id, error);
                guard.invalidate();
                return Err(error);
            }
        };

        // latest.json now holds the merged snapshot even if a later step fails.
        guard.slot.latest = Some(snapshot.clone());

        self.outbox.submit(device_id, &hash);

        if let Some(accelerometer) = &update.accelerometer {
            self.content
                .append_history::<Accelerometer>(
                    device_id,
                    &HistoryEntry::new(snapshot.timestamp, accelerometer.clone()),
                )
                .await?;
        }

        if let Some(location) = &update.location {
            self.content
                .append_history::<Location>(
                    device_id,
                    &HistoryEntry::new(snapshot.timestamp, location.clone()),
                )
                .await?;
        }

        if let Some(image) = update.camera_image() {
            match STANDARD.decode(image) {
                Ok(bytes) => {
                    self.content
                        .put_latest_image(device_id, Bytes::from(bytes))
                        .await?
                }
                Err(error) => {
                    tracing::warn!(
                        "Dropping undecodable camera image from device {}: {}",
                        device_id,
                        error
                    );
                }
            }
        }

        self.catalog.insert(device_id).await?;
        drop(guard);

        tracing::debug!("Ingested update for device {} as {}", device_id, hash);

        Ok(IngestResult {
            hash,
            snapshot,
            reused: stored.reused,
        })
    }

    /// Remove every local artifact and the catalog entry. Ledger records are
    /// untouched.
    pub async fn delete_device(&self, device_id: &str) -> Result<bool> {
        let mut guard = self.lock(device_id).await?;
        let existed = self.content.delete(device_id).await;
        guard.invalidate();
        let existed = existed?;

        let listed = self.catalog.remove(device_id).await?;
        drop(guard);

        self.release_slot(device_id);
        Ok(existed || listed)
    }

    /// Drop the lock slot of a device nobody is waiting on.
    fn release_slot(&self, device_id: &str) {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slots
            .get(device_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(device_id);
        }
    }

    /// Wait for outstanding ledger submissions.
    pub async fn flush_ledger(&self) {
        self.outbox.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::SlowFirstWrite;
    use crate::ledger::{
        DynLedger, FireAndForgetOutbox, HashLedgerClient, LedgerClientOptions, MemoryLedger,
    };
    use crate::model::CameraFrame;

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<MemoryLedger>,
        store: Arc<DeviceStore>,
    }

    async fn fixture() -> Fixture {
        fixture_with(false).await
    }

    async fn fixture_with(slow_first_write: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let backend: DynLedger = if slow_first_write {
            Arc::new(SlowFirstWrite::new(ledger.clone()))
        } else {
            ledger.clone()
        };
        let client = Arc::new(HashLedgerClient::new(
            Some(backend),
            LedgerClientOptions::default(),
        ));
        client.initialize().await;

        let content = Arc::new(ContentStore::new(dir.path().to_path_buf()).unwrap());
        let catalog = Arc::new(DeviceCatalog::open(dir.path()).await.unwrap());
        let outbox = Arc::new(FireAndForgetOutbox::new(client));
        let store = Arc::new(DeviceStore::new(content, catalog, outbox));

        Fixture {
            _dir: dir,
            ledger,
            store,
        }
    }

    #[tokio::test]
    async fn test_ingest_merges_and_attests() {
        let fx = fixture().await;

        let first = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    location: Some(Location::new(1.0, 2.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    accelerometer: Some(Accelerometer::new(0.1, 0.2, 9.8)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        fx.store.flush_ledger().await;

        assert_ne!(first.hash, second.hash);

        let content = fx.store.content();
        let latest = content.latest("d1").await.unwrap().unwrap();
        assert_eq!(latest.data.location, Some(Location::new(1.0, 2.0)));
        assert_eq!(
            latest.data.accelerometer,
            Some(Accelerometer::new(0.1, 0.2, 9.8))
        );

        assert!(content.get("d1", &first.hash).await.unwrap().is_some());
        assert!(content.get("d1", &second.hash).await.unwrap().is_some());
        assert_eq!(content.history::<Location>("d1").await.unwrap().len(), 1);
        assert_eq!(content.history::<Accelerometer>("d1").await.unwrap().len(), 1);

        assert_eq!(fx.ledger.store_calls(), 2);
        assert!(fx.store.catalog().contains("d1").await);
    }

    #[tokio::test]
    async fn test_concurrent_updates_to_one_device_are_serialized() {
        let fx = fixture().await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = fx.store.clone();
            handles.push(tokio::spawn(async move {
                let update = if i % 2 == 0 {
                    TelemetryUpdate {
                        accelerometer: Some(Accelerometer::new(i as f64, 0.0, 0.0)),
                        ..Default::default()
                    }
                } else {
                    TelemetryUpdate {
                        location: Some(Location::new(i as f64, 0.0)),
                        ..Default::default()
                    }
                };
                store.ingest("d1", &update).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        fx.store.flush_ledger().await;

        let content = fx.store.content();
        assert_eq!(content.hash_index("d1").await.unwrap().len(), 16);
        assert_eq!(content.history::<Accelerometer>("d1").await.unwrap().len(), 8);
        assert_eq!(content.history::<Location>("d1").await.unwrap().len(), 8);

        let latest = content.latest("d1").await.unwrap().unwrap();
        assert!(latest.data.location.is_some());
        assert!(latest.data.accelerometer.is_some());
        assert_eq!(fx.ledger.store_calls(), 16);
    }

    #[tokio::test]
    async fn test_camera_image_is_decoded_and_overwritten() {
        let fx = fixture().await;

        for payload in ["Zmlyc3Q=", "c2Vjb25k", "%%not-base64%%"] {
            let update = TelemetryUpdate {
                camera: Some(CameraFrame {
                    image: Some(payload.to_string()),
                    timestamp: Some(1),
                }),
                ..Default::default()
            };
            fx.store.ingest("cam", &update).await.unwrap();
        }

        assert_eq!(
            fx.store.content().latest_image("cam").await.unwrap(),
            Some(Bytes::from_static(b"second"))
        );
    }

    #[tokio::test]
    async fn test_ingest_survives_ledger_outage() {
        let fx = fixture().await;
        fx.ledger.set_reachable(false);

        for i in 0..5 {
            let update = TelemetryUpdate {
                location: Some(Location::new(i as f64, 0.0)),
                ..Default::default()
            };
            fx.store.ingest("d1", &update).await.unwrap();
        }
        fx.store.flush_ledger().await;

        assert_eq!(fx.store.content().hash_index("d1").await.unwrap().len(), 5);
        assert_eq!(fx.store.outbox().stats().failed, 5);
    }

    #[tokio::test]
    async fn test_delete_device_forgets_cached_snapshot() {
        let fx = fixture().await;
        let update = TelemetryUpdate {
            location: Some(Location::new(1.0, 1.0)),
            ..Default::default()
        };
        fx.store.ingest("d1", &update).await.unwrap();

        assert!(fx.store.delete_device("d1").await.unwrap());
        assert!(!fx.store.catalog().contains("d1").await);

        let after = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    accelerometer: Some(Accelerometer::new(1.0, 1.0, 1.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(after.snapshot.data.location.is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_device_id() {
        let fx = fixture().await;
        let result = fx.store.ingest("../etc", &TelemetryUpdate::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ledger_latest_follows_ingest_order() {
        let fx = fixture_with(true).await;

        let first = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    location: Some(Location::new(1.0, 2.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    accelerometer: Some(Accelerometer::new(0.1, 0.2, 9.8)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        fx.store.flush_ledger().await;

        let records = fx.ledger.records("d1");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data_hash, first.hash);
        assert_eq!(records[1].data_hash, second.hash);

        let latest = fx.store.content().latest("d1").await.unwrap().unwrap();
        assert_eq!(snapshot_hash(&latest).unwrap(), second.hash);
    }

    #[tokio::test]
    async fn test_failed_ingest_step_keeps_stored_snapshot_for_next_merge() {
        let fx = fixture().await;
        fx.store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    accelerometer: Some(Accelerometer::new(0.0, 0.0, 1.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A non-empty directory in place of the image file makes the image write fail.
        let image_path = fx._dir.path().join("devices").join("d1").join("latest_image.jpg");
        std::fs::create_dir_all(&image_path).unwrap();
        std::fs::write(image_path.join("occupied"), b"x").unwrap();

        let failed = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    location: Some(Location::new(5.0, 6.0)),
                    camera: Some(CameraFrame {
                        image: Some("Zmlyc3Q=".to_string()),
                        timestamp: Some(1),
                    }),
                    ..Default::default()
                },
            )
            .await;
        assert!(failed.is_err());

        let next = fx
            .store
            .ingest(
                "d1",
                &TelemetryUpdate {
                    accelerometer: Some(Accelerometer::new(0.0, 0.0, 2.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(next.snapshot.data.location, Some(Location::new(5.0, 6.0)));
    }

    #[tokio::test]
    async fn test_delete_device_releases_lock_slot() {
        let fx = fixture().await;
        let update = TelemetryUpdate {
            location: Some(Location::new(1.0, 1.0)),
            ..Default::default()
        };
        fx.store.ingest("d1", &update).await.unwrap();
        fx.store.ingest("d2", &update).await.unwrap();
        assert_eq!(fx.store.slots.lock().unwrap().len(), 2);

        fx.store.delete_device("d1").await.unwrap();

        let slots = fx.store.slots.lock().unwrap();
        assert!(!slots.contains_key("d1"));
        assert!(slots.contains_key("d2"));
    }
}
