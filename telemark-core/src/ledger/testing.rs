use super::{Ledger, MemoryLedger};
use crate::Result;
use crate::model::{DataStoredEvent, LedgerRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Memory ledger whose first write stalls, so later writes could overtake it.
pub struct SlowFirstWrite {
    inner: Arc<MemoryLedger>,
    delayed: AtomicBool,
}

impl SlowFirstWrite {
    pub fn new(inner: Arc<MemoryLedger>) -> Self {
        Self {
            inner,
            delayed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Ledger for SlowFirstWrite {
    fn backend_name(&self) -> &'static str {
        "slow-first-write"
    }

    fn address(&self) -> Option<String> {
        None
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn store_data(&self, device_id: &str, data_hash: &str) -> Result<()> {
        if !self.delayed.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.store_data(device_id, data_hash).await
    }

    async fn data_count(&self, device_id: &str) -> Result<u64> {
        self.inner.data_count(device_id).await
    }

    async fn latest_data(&self, device_id: &str) -> Result<Option<LedgerRecord>> {
        self.inner.latest_data(device_id).await
    }

    async fn historical_data(&self, device_id: &str, index: u64) -> Result<Option<LedgerRecord>> {
        self.inner.historical_data(device_id, index).await
    }

    async fn data_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerRecord>> {
        self.inner.data_in_range(device_id, from, to).await
    }

    async fn stored_events(&self) -> Result<Vec<DataStoredEvent>> {
        self.inner.stored_events().await
    }
}
