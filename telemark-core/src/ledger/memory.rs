use super::Ledger;
use crate::model::{DataStoredEvent, LedgerRecord};
use crate::{Result, TelemarkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryLedgerState {
    records: HashMap<String, Vec<LedgerRecord>>,
    events: Vec<DataStoredEvent>,
    block_number: u64,
}

/// In-process ledger. Used by the `memory` backend and by tests, which can
/// toggle reachability and seed records with explicit timestamps.
pub struct MemoryLedger {
    address: String,
    reachable: AtomicBool,
    store_calls: AtomicU64,
    state: Mutex<MemoryLedgerState>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            address: "memory".to_string(),
            reachable: AtomicBool::new(true),
            store_calls: AtomicU64::new(0),
            state: Mutex::new(MemoryLedgerState::default()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of successful `store_data` calls.
    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Append a record with an explicit timestamp, bypassing reachability.
    pub fn seed_record(&self, device_id: &str, data_hash: &str, timestamp: DateTime<Utc>) {
        let mut state = self.state();
        append_record(&mut state, device_id, data_hash, truncate_to_seconds(timestamp));
    }

    pub fn records(&self, device_id: &str) -> Vec<LedgerRecord> {
        self.state()
            .records
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryLedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TelemarkError::LedgerUnavailable(
                "memory ledger is unreachable".to_string(),
            ))
        }
    }
}

fn truncate_to_seconds(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp)
}

fn append_record(
    state: &mut MemoryLedgerState,
    device_id: &str,
    data_hash: &str,
    timestamp: DateTime<Utc>,
) {
    state.block_number += 1;

    let record = LedgerRecord {
        device_id: device_id.to_string(),
        data_hash: data_hash.to_string(),
        timestamp,
    };
    state
        .records
        .entry(device_id.to_string())
        .or_default()
        .push(record);

    state.events.push(DataStoredEvent {
        device_id: device_id.to_string(),
        data_hash: data_hash.to_string(),
        timestamp,
        block_number: state.block_number,
    });
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn address(&self) -> Option<String> {
        Some(self.address.clone())
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_reachable()
    }

    async fn store_data(&self, device_id: &str, data_hash: &str) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = self.state();
        append_record(&mut state, device_id, data_hash, truncate_to_seconds(Utc::now()));
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn data_count(&self, device_id: &str) -> Result<u64> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .records
            .get(device_id)
            .map(|records| records.len() as u64)
            .unwrap_or(0))
    }

    async fn latest_data(&self, device_id: &str) -> Result<Option<LedgerRecord>> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .records
            .get(device_id)
            .and_then(|records| records.last().cloned()))
    }

    async fn historical_data(&self, device_id: &str, index: u64) -> Result<Option<LedgerRecord>> {
        self.ensure_reachable()?;
        Ok(self
            .state()
            .records
            .get(device_id)
            .and_then(|records| records.get(index as usize).cloned()))
    }

    async fn data_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerRecord>> {
        self.ensure_reachable()?;
        let mut records: Vec<LedgerRecord> = self
            .state()
            .records
            .get(device_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.timestamp >= from && record.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }

    async fn stored_events(&self) -> Result<Vec<DataStoredEvent>> {
        self.ensure_reachable()?;
        Ok(self.state().events.clone())
    }
}
