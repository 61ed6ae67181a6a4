use crate::Result;
use crate::ledger::HashLedgerClient;
use crate::storage::{ContentStore, DeviceCatalog};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Folds locally stored and ledger-discovered device ids into the catalog.
pub struct ReconcileCatalogOperation {
    content: Arc<ContentStore>,
    catalog: Arc<DeviceCatalog>,
    ledger: Arc<HashLedgerClient>,
    last_run: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileCatalogOperationResult {
    pub local_devices: usize,
    /// `None` when the ledger scan was skipped or failed.
    pub ledger_devices: Option<usize>,
    pub added: usize,
    pub total: usize,
}

impl ReconcileCatalogOperation {
    pub fn new(
        content: Arc<ContentStore>,
        catalog: Arc<DeviceCatalog>,
        ledger: Arc<HashLedgerClient>,
    ) -> Self {
        Self {
            content,
            catalog,
            ledger,
            last_run: Mutex::new(None),
        }
    }

    pub async fn run(&self) -> Result<ReconcileCatalogOperationResult> {
        let mut last_run = self.last_run.lock().await;
        let result = self.reconcile().await?;
        *last_run = Some(Instant::now());
        Ok(result)
    }

    /// Reconcile only when the previous run is older than `max_staleness`.
    /// Concurrent callers wait for the run in progress instead of scanning
    /// the ledger again.
    pub async fn run_if_stale(
        &self,
        max_staleness: Duration,
    ) -> Result<Option<ReconcileCatalogOperationResult>> {
        let mut last_run = self.last_run.lock().await;
        if let Some(at) = *last_run {
            if at.elapsed() < max_staleness {
                return Ok(None);
            }
        }

        let result = self.reconcile().await?;
        *last_run = Some(Instant::now());
        Ok(Some(result))
    }

    async fn reconcile(&self) -> Result<ReconcileCatalogOperationResult> {
        let local_ids = self.content.list_device_ids().await?;
        let local_devices = local_ids.len();

        let ledger_ids = if self.ledger.is_available() {
            self.ledger.enumerate_device_ids().await
        } else {
            None
        };
        let ledger_devices = ledger_ids.as_ref().map(|ids| ids.len());

        let candidates = local_ids
            .into_iter()
            .chain(ledger_ids.into_iter().flatten());
        let added = self.catalog.merge(candidates).await?;
        let total = self.catalog.len().await;

        tracing::info!(
            "Catalog reconciled: local={} ledger={:?} added={} total={}",
            local_devices,
            ledger_devices,
            added,
            total
        );

        Ok(ReconcileCatalogOperationResult {
            local_devices,
            ledger_devices,
            added,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerClientOptions, MemoryLedger};
    use crate::model::Snapshot;
    use crate::storage::snapshot_hash;
    use chrono::Utc;

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<MemoryLedger>,
        content: Arc<ContentStore>,
        catalog: Arc<DeviceCatalog>,
        operation: ReconcileCatalogOperation,
    }

    async fn fixture(connect: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let client = Arc::new(HashLedgerClient::new(
            Some(ledger.clone()),
            LedgerClientOptions::default(),
        ));
        if connect {
            client.initialize().await;
        }

        let content = Arc::new(ContentStore::new(dir.path().to_path_buf()).unwrap());
        let catalog = Arc::new(DeviceCatalog::open(dir.path()).await.unwrap());
        let operation = ReconcileCatalogOperation::new(content.clone(), catalog.clone(), client);

        Fixture {
            _dir: dir,
            ledger,
            content,
            catalog,
            operation,
        }
    }

    async fn store_local(content: &ContentStore, device_id: &str) {
        let snapshot = Snapshot::placeholder(Utc::now());
        let hash = snapshot_hash(&snapshot).unwrap();
        content.put(device_id, &hash, &snapshot).await.unwrap();
    }

    #[tokio::test]
    async fn test_merges_local_and_ledger_ids() {
        let fx = fixture(true).await;
        store_local(&fx.content, "local-1").await;
        fx.ledger.seed_record("remote-1", "h", Utc::now());
        fx.ledger.seed_record("local-1", "h", Utc::now());

        let result = fx.operation.run().await.unwrap();
        assert_eq!(result.local_devices, 1);
        assert_eq!(result.ledger_devices, Some(2));
        assert_eq!(result.added, 2);

        let devices: Vec<String> = fx.catalog.snapshot().await.into_iter().collect();
        assert_eq!(devices, vec!["local-1", "remote-1"]);
    }

    #[tokio::test]
    async fn test_skips_ledger_when_unavailable() {
        let fx = fixture(false).await;
        store_local(&fx.content, "local-1").await;
        fx.ledger.seed_record("remote-1", "h", Utc::now());

        let result = fx.operation.run().await.unwrap();
        assert_eq!(result.ledger_devices, None);
        assert_eq!(result.total, 1);
    }

    #[tokio::test]
    async fn test_run_if_stale_skips_recent_runs() {
        let fx = fixture(true).await;

        assert!(fx.operation.run_if_stale(Duration::from_secs(60)).await.unwrap().is_some());
        assert!(fx.operation.run_if_stale(Duration::from_secs(60)).await.unwrap().is_none());
        assert!(fx.operation.run_if_stale(Duration::ZERO).await.unwrap().is_some());
    }
}
