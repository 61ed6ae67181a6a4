//! Telemetry domain types shared by the store, the ledger client and the operations.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Result, TelemarkError};

/// Upper bound on every per-device history series.
pub const HISTORY_LIMIT: usize = 1000;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Device ids become directory names, so anything that could escape the
/// devices directory is rejected up front.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(TelemarkError::InvalidRequest(
            "device id cannot be empty".to_string(),
        ));
    }

    if device_id == "." || device_id == ".." {
        return Err(TelemarkError::InvalidRequest(format!(
            "invalid device id: {}",
            device_id
        )));
    }

    if device_id
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(TelemarkError::InvalidRequest(format!(
            "device id contains forbidden characters: {:?}",
            device_id
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restored_from_ledger: bool,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            restored_from_ledger: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accelerometer {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restored_from_ledger: bool,
}

impl Accelerometer {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            restored_from_ledger: false,
        }
    }
}

/// A camera frame as sent by the device: base64 JPEG plus capture time in ms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One telemetry reading of a known kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryReading {
    Location(Location),
    Accelerometer(Accelerometer),
    Camera(CameraFrame),
}

/// A partial update as carried by an inbound `update` message. Unknown keys
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerometer: Option<Accelerometer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraFrame>,
}

impl TelemetryUpdate {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.accelerometer.is_none() && self.camera.is_none()
    }

    pub fn readings(&self) -> Vec<TelemetryReading> {
        let mut readings = Vec::new();
        if let Some(location) = &self.location {
            readings.push(TelemetryReading::Location(location.clone()));
        }
        if let Some(accelerometer) = &self.accelerometer {
            readings.push(TelemetryReading::Accelerometer(accelerometer.clone()));
        }
        if let Some(camera) = &self.camera {
            readings.push(TelemetryReading::Camera(camera.clone()));
        }
        readings
    }

    /// The camera image carried by this update, if any.
    pub fn camera_image(&self) -> Option<&str> {
        self.camera.as_ref().and_then(|camera| camera.image.as_deref())
    }
}

impl From<TelemetryReading> for TelemetryUpdate {
    fn from(reading: TelemetryReading) -> Self {
        let mut update = TelemetryUpdate::default();
        match reading {
            TelemetryReading::Location(location) => update.location = Some(location),
            TelemetryReading::Accelerometer(accelerometer) => {
                update.accelerometer = Some(accelerometer)
            }
            TelemetryReading::Camera(camera) => update.camera = Some(camera),
        }
        update
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerometer: Option<Accelerometer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl TelemetryData {
    /// Location and accelerometer readings replace the previous value; a
    /// camera frame only replaces the fields it carries.
    pub fn apply(&mut self, reading: &TelemetryReading) {
        match reading {
            TelemetryReading::Location(location) => self.location = Some(location.clone()),
            TelemetryReading::Accelerometer(accelerometer) => {
                self.accelerometer = Some(accelerometer.clone())
            }
            TelemetryReading::Camera(frame) => {
                let camera = self.camera.get_or_insert_with(CameraFrame::default);
                if frame.image.is_some() {
                    camera.image = frame.image.clone();
                }
                if frame.timestamp.is_some() {
                    camera.timestamp = frame.timestamp;
                }
            }
        }
    }
}

/// The unit of content addressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub data: TelemetryData,
    #[serde(default, skip_serializing_if = "is_false")]
    pub restored_from_ledger: bool,
}

impl Snapshot {
    /// Fold `update` into the previous snapshot's data.
    pub fn merged(previous: Option<&Snapshot>, update: &TelemetryUpdate, now: DateTime<Utc>) -> Self {
        let mut data = previous
            .map(|snapshot| snapshot.data.clone())
            .unwrap_or_default();

        for reading in update.readings() {
            data.apply(&reading);
        }
        data.last_update = Some(now);

        Self {
            timestamp: now,
            data,
            restored_from_ledger: false,
        }
    }

    /// A structural stand-in for a snapshot the ledger attests to but whose
    /// content is gone. Every reading is zeroed and tagged.
    pub fn placeholder(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            data: TelemetryData {
                location: Some(Location::placeholder()),
                accelerometer: Some(Accelerometer::placeholder()),
                camera: None,
                last_update: Some(timestamp),
            },
            restored_from_ledger: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Location,
    Accelerometer,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Location => "location",
            HistoryKind::Accelerometer => "accelerometer",
        }
    }
}

/// A reading type that has its own bounded history series.
pub trait HistoryReading: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: HistoryKind;

    fn placeholder() -> Self;

    fn is_placeholder(&self) -> bool;

    fn from_data(data: &TelemetryData) -> Option<Self>;
}

impl HistoryReading for Location {
    const KIND: HistoryKind = HistoryKind::Location;

    fn placeholder() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            restored_from_ledger: true,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.restored_from_ledger
    }

    fn from_data(data: &TelemetryData) -> Option<Self> {
        data.location.clone()
    }
}

impl HistoryReading for Accelerometer {
    const KIND: HistoryKind = HistoryKind::Accelerometer;

    fn placeholder() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            restored_from_ledger: true,
        }
    }

    fn is_placeholder(&self) -> bool {
        self.restored_from_ledger
    }

    fn from_data(data: &TelemetryData) -> Option<Self> {
        data.accelerometer.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub reading: T,
}

impl<T: HistoryReading> HistoryEntry<T> {
    pub fn new(timestamp: DateTime<Utc>, reading: T) -> Self {
        Self { timestamp, reading }
    }
}

/// Local secondary index entry: content hash to snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashIndexEntry {
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

/// One attestation on the ledger. Ledger time has one-second resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub device_id: String,
    pub data_hash: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// A "data stored" event from the ledger's historical log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoredEvent {
    pub device_id: String,
    pub data_hash: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceOrigin {
    Local,
    LedgerOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub device_id: String,
    pub origin: DeviceOrigin,
    pub timestamp: Option<DateTime<Utc>>,
}
