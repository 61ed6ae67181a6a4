use crate::ledger::HashLedgerClient;
use crate::model::{
    Accelerometer, HistoryEntry, HistoryReading, LedgerRecord, Location, validate_device_id,
};
use crate::storage::{ContentStore, validate_hash};
use crate::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Local,
    Ledger,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDataSources {
    pub accelerometer: DataSource,
    pub locations: DataSource,
    pub latest_image: DataSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceholderFlags {
    pub accelerometer: bool,
    pub locations: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHistory {
    pub device_id: String,
    pub accelerometer: Vec<HistoryEntry<Accelerometer>>,
    pub locations: Vec<HistoryEntry<Location>>,
    /// Base64 JPEG.
    pub latest_image: Option<String>,
    pub data_source: HistoryDataSources,
    pub is_placeholder_data: PlaceholderFlags,
}

#[derive(Debug, Clone)]
pub enum DeviceHistoryOperationOutcome {
    Found(DeviceHistory),
    NotFound,
}

/// Reads both history series and the latest image of a device. Empty local
/// series are rebuilt from ledger-attested blobs that are still on disk.
#[derive(Clone)]
pub struct DeviceHistoryOperation {
    content: Arc<ContentStore>,
    ledger: Arc<HashLedgerClient>,
    window: Duration,
}

impl DeviceHistoryOperation {
    pub fn new(content: Arc<ContentStore>, ledger: Arc<HashLedgerClient>, window: Duration) -> Self {
        Self {
            content,
            ledger,
            window,
        }
    }

    pub async fn run(&self, device_id: &str) -> Result<DeviceHistoryOperationOutcome> {
        validate_device_id(device_id)?;

        let local = self.content.device_exists(device_id).await?;
        if !local && !self.ledger.exists(device_id).await {
            return Ok(DeviceHistoryOperationOutcome::NotFound);
        }

        let mut accelerometer = self.content.history::<Accelerometer>(device_id).await?;
        let mut locations = self.content.history::<Location>(device_id).await?;
        let mut latest_image = self
            .content
            .latest_image(device_id)
            .await?
            .map(|bytes| STANDARD.encode(&bytes));

        let mut data_source = HistoryDataSources {
            accelerometer: source_of(!accelerometer.is_empty()),
            locations: source_of(!locations.is_empty()),
            latest_image: source_of(latest_image.is_some()),
        };

        if self.ledger.is_available() {
            let mut records: Option<Vec<LedgerRecord>> = None;

            if accelerometer.is_empty() {
                let records = self.attested_records(device_id, &mut records).await;
                accelerometer = self.series_from_blobs(device_id, records).await?;
                if !accelerometer.is_empty() {
                    data_source.accelerometer = DataSource::Ledger;
                }
            }

            if locations.is_empty() {
                let records = self.attested_records(device_id, &mut records).await;
                locations = self.series_from_blobs(device_id, records).await?;
                if !locations.is_empty() {
                    data_source.locations = DataSource::Ledger;
                }
            }

            if latest_image.is_none() {
                latest_image = self.image_from_ledger(device_id).await?;
                if latest_image.is_some() {
                    data_source.latest_image = DataSource::Ledger;
                }
            }
        }

        let is_placeholder_data = PlaceholderFlags {
            accelerometer: accelerometer.iter().any(|entry| entry.reading.is_placeholder()),
            locations: locations.iter().any(|entry| entry.reading.is_placeholder()),
        };

        Ok(DeviceHistoryOperationOutcome::Found(DeviceHistory {
            device_id: device_id.to_string(),
            accelerometer,
            locations,
            latest_image,
            data_source,
            is_placeholder_data,
        }))
    }

    async fn attested_records<'a>(
        &self,
        device_id: &str,
        cache: &'a mut Option<Vec<LedgerRecord>>,
    ) -> &'a [LedgerRecord] {
        if cache.is_none() {
            let now = Utc::now();
            let records = self.ledger.range(device_id, now - self.window, now).await;
            *cache = Some(records);
        }
        cache.as_deref().unwrap_or_default()
    }

    async fn series_from_blobs<T: HistoryReading>(
        &self,
        device_id: &str,
        records: &[LedgerRecord],
    ) -> Result<Vec<HistoryEntry<T>>> {
        let mut series = Vec::new();
        for record in records {
            if validate_hash(&record.data_hash).is_err() {
                tracing::warn!(
                    "Ignoring malformed ledger hash for device {}: {}",
                    device_id,
                    record.data_hash
                );
                continue;
            }

            if let Some(snapshot) = self.content.read_blob(device_id, &record.data_hash).await? {
                if let Some(reading) = T::from_data(&snapshot.data) {
                    series.push(HistoryEntry::new(snapshot.timestamp, reading));
                }
            }
        }
        Ok(series)
    }

    async fn image_from_ledger(&self, device_id: &str) -> Result<Option<String>> {
        let Some(record) = self.ledger.latest(device_id).await else {
            return Ok(None);
        };
        if validate_hash(&record.data_hash).is_err() {
            return Ok(None);
        }

        let snapshot = self.content.read_blob(device_id, &record.data_hash).await?;
        Ok(snapshot
            .and_then(|snapshot| snapshot.data.camera)
            .and_then(|camera| camera.image))
    }
}

fn source_of(present: bool) -> DataSource {
    if present {
        DataSource::Local
    } else {
        DataSource::Unavailable
    }
}
