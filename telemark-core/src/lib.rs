//! Telemark Core - device telemetry storage with ledger attestation
//!
//! Snapshots of device telemetry are stored locally and attested externally:
//! - SHA256 content-addressed snapshot blobs
//! - SQLite per-device hash index and bounded history series
//! - Best-effort hash submission to an append-only ledger
//! - Catalog reconciliation, verification and restoration against the ledger

pub mod device_store;
pub mod error;
pub mod ledger;
pub mod model;
pub mod operations;
pub mod service;
pub mod session;
pub mod storage;

pub use device_store::{DeviceGuard, DeviceStore, IngestResult};
pub use error::{Result, TelemarkError};
pub use ledger::{
    AppendOutcome, ConnectionState, DynLedger, FireAndForgetOutbox, HashLedgerClient,
    JsonRpcLedger, Ledger, LedgerBuilder, LedgerClientOptions, LedgerOutbox, LedgerStatus,
    MemoryLedger, OutboxStats,
};
pub use model::{
    Accelerometer, CameraFrame, CatalogEntry, DataStoredEvent, DeviceOrigin, HISTORY_LIMIT,
    HashIndexEntry, HistoryEntry, HistoryKind, HistoryReading, LedgerRecord, Location, Snapshot,
    TelemetryData, TelemetryReading, TelemetryUpdate, validate_device_id,
};
pub use operations::{
    DataSource, DeviceHistory, DeviceHistoryOperation, DeviceHistoryOperationOutcome,
    HistoryDataSources, ListDevicesOperation, PlaceholderFlags, ReconcileCatalogOperation,
    ReconcileCatalogOperationResult, RestoreDeclined, RestoreDeviceOperation,
    RestoreDeviceOperationOutcome, RestoreDeviceOperationRequest, RestoreDeviceOperationResult,
    VerificationStatus, VerifyDeviceOperation, VerifyReport,
};
pub use service::{LedgerStatusReport, ServiceOptions, TelemetryService};
pub use session::{ConnectedDevice, InboundMessage, SessionRegistry, SessionState};
pub use storage::{
    ContentStore, DeviceCatalog, IndexStore, PutSnapshotResult, canonical_json, compute_hash,
    snapshot_hash, validate_hash,
};
