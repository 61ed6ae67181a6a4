use crate::device_store::{DeviceStore, IngestResult};
use crate::ledger::{
    DynLedger, FireAndForgetOutbox, HashLedgerClient, LedgerClientOptions, LedgerOutbox,
    LedgerStatus, OutboxStats,
};
use crate::model::{
    CatalogEntry, LedgerRecord, TelemetryReading, TelemetryUpdate, validate_device_id,
};
use crate::operations::{
    DeviceHistoryOperation, DeviceHistoryOperationOutcome, ListDevicesOperation,
    ReconcileCatalogOperation, ReconcileCatalogOperationResult, RestoreDeviceOperation,
    RestoreDeviceOperationOutcome, RestoreDeviceOperationRequest, VerifyDeviceOperation,
    VerifyReport,
};
use crate::session::{ConnectedDevice, InboundMessage, SessionRegistry, SessionState};
use crate::storage::{ContentStore, DeviceCatalog};
use crate::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// How far back restoration and history fallback look on the ledger.
    pub restore_window: chrono::Duration,
    /// Listing reconciles the catalog first when the last run is older than this.
    pub catalog_max_staleness: Duration,
    pub ledger: LedgerClientOptions,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            restore_window: chrono::Duration::days(30),
            catalog_max_staleness: Duration::from_secs(60),
            ledger: LedgerClientOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatusReport {
    #[serde(flatten)]
    pub ledger: LedgerStatus,
    pub outbox: OutboxStats,
}

/// Entry point for the session layer and the command surface. Owns every
/// store and operation of one data directory.
pub struct TelemetryService {
    store: Arc<DeviceStore>,
    ledger: Arc<HashLedgerClient>,
    sessions: SessionRegistry,
    reconcile: Arc<ReconcileCatalogOperation>,
    list_devices: ListDevicesOperation,
    history: DeviceHistoryOperation,
    restore: RestoreDeviceOperation,
    verify: VerifyDeviceOperation,
}

impl TelemetryService {
    /// Open the stores under `data_dir`. The ledger is not contacted until
    /// [`start`](Self::start).
    pub async fn open(
        data_dir: PathBuf,
        ledger: Option<DynLedger>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let content = Arc::new(ContentStore::new(data_dir.clone())?);
        let catalog = Arc::new(DeviceCatalog::open(&data_dir).await?);
        let ledger = Arc::new(HashLedgerClient::new(ledger, options.ledger.clone()));
        let outbox: Arc<dyn LedgerOutbox> = Arc::new(FireAndForgetOutbox::new(ledger.clone()));
        let store = Arc::new(DeviceStore::new(content.clone(), catalog.clone(), outbox));

        let reconcile = Arc::new(ReconcileCatalogOperation::new(
            content.clone(),
            catalog.clone(),
            ledger.clone(),
        ));
        let list_devices = ListDevicesOperation::new(
            content.clone(),
            catalog,
            ledger.clone(),
            reconcile.clone(),
            options.catalog_max_staleness,
        );
        let history =
            DeviceHistoryOperation::new(content.clone(), ledger.clone(), options.restore_window);
        let restore = RestoreDeviceOperation::new(store.clone(), ledger.clone(), options.restore_window);
        let verify = VerifyDeviceOperation::new(content, ledger.clone());

        Ok(Self {
            store,
            ledger,
            sessions: SessionRegistry::new(),
            reconcile,
            list_devices,
            history,
            restore,
            verify,
        })
    }

    /// Connect the ledger (falling back to local-only mode) and reconcile the
    /// catalog once.
    pub async fn start(&self) -> Result<bool> {
        let connected = self.ledger.initialize().await;
        self.reconcile.run().await?;
        Ok(connected)
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<HashLedgerClient> {
        &self.ledger
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn on_device_registered(&self, device_id: &str) -> Result<()> {
        validate_device_id(device_id)?;
        self.sessions.on_registered(device_id);
        Ok(())
    }

    pub async fn on_device_update(
        &self,
        device_id: &str,
        update: &TelemetryUpdate,
    ) -> Result<IngestResult> {
        let result = self.store.ingest(device_id, update).await?;
        self.sessions.on_update(device_id, result.snapshot.timestamp);
        Ok(result)
    }

    pub fn on_device_disconnected(&self, device_id: &str) {
        self.sessions.on_disconnected(device_id);
    }

    /// Dispatch one inbound message for `session`. Telemetry from a session
    /// that never registered is dropped.
    pub async fn handle_message(
        &self,
        session: &mut SessionState,
        message: InboundMessage,
    ) -> Result<Option<IngestResult>> {
        let update = match message {
            InboundMessage::Register { device_id } => {
                self.on_device_registered(&device_id)?;
                if let Some(previous) = session.device_id() {
                    if previous != device_id {
                        self.sessions.on_disconnected(previous);
                    }
                }
                session.bind(&device_id);
                return Ok(None);
            }
            InboundMessage::Update { payload } => payload,
            InboundMessage::Camera(frame) => TelemetryUpdate::from(TelemetryReading::Camera(frame)),
        };

        let Some(device_id) = session.device_id() else {
            tracing::warn!("Dropping telemetry from unregistered session");
            return Ok(None);
        };

        if update.is_empty() {
            tracing::debug!("Ignoring empty update from device {}", device_id);
            return Ok(None);
        }

        let result = self.on_device_update(device_id, &update).await?;
        Ok(Some(result))
    }

    /// Tear down a session, marking its device offline.
    pub fn close_session(&self, session: &mut SessionState) {
        if let Some(device_id) = session.unbind() {
            self.on_device_disconnected(&device_id);
        }
    }

    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        self.sessions.connected()
    }

    pub async fn list_devices(&self) -> Result<Vec<CatalogEntry>> {
        self.list_devices.run().await
    }

    pub async fn get_history(&self, device_id: &str) -> Result<DeviceHistoryOperationOutcome> {
        self.history.run(device_id).await
    }

    pub async fn verify(&self, device_id: &str) -> Result<VerifyReport> {
        self.verify.run(device_id).await
    }

    pub async fn restore(&self, device_id: &str) -> Result<RestoreDeviceOperationOutcome> {
        self.restore
            .run(RestoreDeviceOperationRequest {
                device_id: device_id.to_string(),
            })
            .await
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<bool> {
        self.store.delete_device(device_id).await
    }

    pub fn ledger_status(&self) -> LedgerStatusReport {
        LedgerStatusReport {
            ledger: self.ledger.status(),
            outbox: self.store.outbox().stats(),
        }
    }

    /// Raw ledger enumeration; empty while the ledger is unavailable.
    pub async fn list_ledger_devices(&self) -> Vec<String> {
        self.ledger
            .enumerate_device_ids()
            .await
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    /// The `index`-th ledger record of a device, oldest first.
    pub async fn ledger_record(&self, device_id: &str, index: u64) -> Result<Option<LedgerRecord>> {
        validate_device_id(device_id)?;
        Ok(self.ledger.record_at(device_id, index).await)
    }

    pub async fn reconcile_catalog(&self) -> Result<ReconcileCatalogOperationResult> {
        self.reconcile.run().await
    }

    /// Retry ledger initialization when running in local-only mode.
    pub async fn reconnect_ledger(&self) -> bool {
        self.ledger.reconnect().await
    }

    pub async fn flush_ledger(&self) {
        self.store.flush_ledger().await;
    }
}
