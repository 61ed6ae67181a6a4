pub mod device_history;
pub mod list_devices;
pub mod reconcile_catalog;
pub mod restore_device;
pub mod verify_device;

pub use device_history::{
    DataSource, DeviceHistory, DeviceHistoryOperation, DeviceHistoryOperationOutcome,
    HistoryDataSources, PlaceholderFlags,
};
pub use list_devices::ListDevicesOperation;
pub use reconcile_catalog::{ReconcileCatalogOperation, ReconcileCatalogOperationResult};
pub use restore_device::{
    RestoreDeclined, RestoreDeviceOperation, RestoreDeviceOperationOutcome,
    RestoreDeviceOperationRequest, RestoreDeviceOperationResult,
};
pub use verify_device::{VerificationStatus, VerifyDeviceOperation, VerifyReport};
