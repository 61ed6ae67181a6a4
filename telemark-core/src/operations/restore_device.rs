use crate::device_store::DeviceStore;
use crate::ledger::HashLedgerClient;
use crate::model::{
    Accelerometer, HistoryEntry, HistoryReading, LedgerRecord, Location, Snapshot,
    validate_device_id,
};
use crate::storage::{ContentStore, validate_hash};
use crate::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Rebuilds a device's local timeline from ledger attestations.
///
/// The ledger only holds hashes, so every attested update comes back as a
/// zeroed placeholder tagged `restoredFromLedger`. The hash index and both
/// history series are rebuilt from scratch; blob files already on disk are
/// left as they are.
#[derive(Clone)]
pub struct RestoreDeviceOperation {
    store: Arc<DeviceStore>,
    ledger: Arc<HashLedgerClient>,
    window: Duration,
}

#[derive(Debug, Clone)]
pub struct RestoreDeviceOperationRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDeviceOperationResult {
    pub device_id: String,
    pub records: usize,
    pub placeholders: usize,
    pub latest_hash: String,
    pub is_placeholder: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreDeclined {
    LedgerUnavailable,
    NoLedgerData,
    NoRecentData,
}

impl fmt::Display for RestoreDeclined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            RestoreDeclined::LedgerUnavailable => "ledger is not available",
            RestoreDeclined::NoLedgerData => "no ledger data found for device",
            RestoreDeclined::NoRecentData => "no ledger records within the restore window",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Clone)]
pub enum RestoreDeviceOperationOutcome {
    Restored(RestoreDeviceOperationResult),
    Declined(RestoreDeclined),
}

impl RestoreDeviceOperation {
    pub fn new(store: Arc<DeviceStore>, ledger: Arc<HashLedgerClient>, window: Duration) -> Self {
        Self {
            store,
            ledger,
            window,
        }
    }

    pub async fn run(
        &self,
        request: RestoreDeviceOperationRequest,
    ) -> Result<RestoreDeviceOperationOutcome> {
        let RestoreDeviceOperationRequest { device_id } = request;
        validate_device_id(&device_id)?;

        if !self.ledger.is_available() {
            return Ok(RestoreDeviceOperationOutcome::Declined(
                RestoreDeclined::LedgerUnavailable,
            ));
        }

        if !self.ledger.exists(&device_id).await {
            return Ok(RestoreDeviceOperationOutcome::Declined(
                RestoreDeclined::NoLedgerData,
            ));
        }

        let now = Utc::now();
        let records: Vec<LedgerRecord> = self
            .ledger
            .range(&device_id, now - self.window, now)
            .await
            .into_iter()
            .filter(|record| match validate_hash(&record.data_hash) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(
                        "Skipping ledger record for device {} at {}: {}",
                        device_id,
                        record.timestamp,
                        error
                    );
                    false
                }
            })
            .collect();

        let Some(last) = records.last() else {
            return Ok(RestoreDeviceOperationOutcome::Declined(
                RestoreDeclined::NoRecentData,
            ));
        };
        let latest_hash = last.data_hash.clone();

        tracing::info!(
            "Restoring device {} from {} ledger records",
            device_id,
            records.len()
        );

        let content = self.store.content();

        // Only the local writes run under the device lock.
        let mut guard = self.store.lock(&device_id).await?;
        let written = rebuild(content, &device_id, &records).await;
        guard.invalidate();
        let placeholders = written?;

        self.store.catalog().insert(&device_id).await?;
        drop(guard);

        tracing::info!(
            "Restored device {} with {} placeholder records",
            device_id,
            placeholders
        );

        Ok(RestoreDeviceOperationOutcome::Restored(
            RestoreDeviceOperationResult {
                device_id,
                records: records.len(),
                placeholders,
                latest_hash,
                is_placeholder: true,
            },
        ))
    }
}

/// Replace the index and history of a device with one placeholder per record.
/// The latest pointer ends on the newest record.
async fn rebuild(content: &ContentStore, device_id: &str, records: &[LedgerRecord]) -> Result<usize> {
    content.reset_index(device_id).await?;

    for record in records {
        let snapshot = Snapshot::placeholder(record.timestamp);
        content.put(device_id, &record.data_hash, &snapshot).await?;
        append_reading::<Location>(content, device_id, &snapshot).await?;
        append_reading::<Accelerometer>(content, device_id, &snapshot).await?;
    }

    Ok(records.len())
}

async fn append_reading<T: HistoryReading>(
    content: &ContentStore,
    device_id: &str,
    snapshot: &Snapshot,
) -> Result<()> {
    if let Some(reading) = T::from_data(&snapshot.data) {
        content
            .append_history(device_id, &HistoryEntry::new(snapshot.timestamp, reading))
            .await?;
    }
    Ok(())
}
