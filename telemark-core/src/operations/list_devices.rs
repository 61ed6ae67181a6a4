use super::ReconcileCatalogOperation;
use crate::ledger::HashLedgerClient;
use crate::model::{CatalogEntry, DeviceOrigin};
use crate::storage::{ContentStore, DeviceCatalog};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Lists catalog members with their origin and latest known timestamp.
#[derive(Clone)]
pub struct ListDevicesOperation {
    content: Arc<ContentStore>,
    catalog: Arc<DeviceCatalog>,
    ledger: Arc<HashLedgerClient>,
    reconciler: Arc<ReconcileCatalogOperation>,
    max_staleness: Duration,
}

impl ListDevicesOperation {
    pub fn new(
        content: Arc<ContentStore>,
        catalog: Arc<DeviceCatalog>,
        ledger: Arc<HashLedgerClient>,
        reconciler: Arc<ReconcileCatalogOperation>,
        max_staleness: Duration,
    ) -> Self {
        Self {
            content,
            catalog,
            ledger,
            reconciler,
            max_staleness,
        }
    }

    pub async fn run(&self) -> Result<Vec<CatalogEntry>> {
        if let Err(error) = self.reconciler.run_if_stale(self.max_staleness).await {
            tracing::warn!("Catalog reconciliation failed, listing current registry: {}", error);
        }

        let ledger_available = self.ledger.is_available();
        let mut entries = Vec::new();

        for device_id in self.catalog.snapshot().await {
            if self.content.device_exists(&device_id).await? {
                let timestamp = self
                    .content
                    .latest(&device_id)
                    .await?
                    .map(|snapshot| snapshot.timestamp);
                entries.push(CatalogEntry {
                    device_id,
                    origin: DeviceOrigin::Local,
                    timestamp,
                });
                continue;
            }

            if !ledger_available {
                entries.push(CatalogEntry {
                    device_id,
                    origin: DeviceOrigin::LedgerOnly,
                    timestamp: None,
                });
                continue;
            }

            // A reachable ledger that never saw this id means it is stale.
            if let Some(record) = self.ledger.latest(&device_id).await {
                entries.push(CatalogEntry {
                    device_id,
                    origin: DeviceOrigin::LedgerOnly,
                    timestamp: Some(record.timestamp),
                });
            }
        }

        Ok(entries)
    }
}
