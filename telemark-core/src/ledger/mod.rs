//! Ledger backends and the availability-aware hash ledger client.
//!
//! A [`Ledger`] is a raw backend: every call can fail. [`HashLedgerClient`]
//! wraps one, applies timeouts and converts failures into "no data" results
//! so the rest of the crate never has to handle ledger errors.

pub mod client;
pub mod factory;
pub mod jsonrpc;
pub mod memory;
pub mod outbox;
#[cfg(test)]
pub(crate) mod testing;

use crate::Result;
use crate::model::{DataStoredEvent, LedgerRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use client::{
    AppendOutcome, ConnectionState, HashLedgerClient, LedgerClientOptions, LedgerStatus,
};
pub use factory::LedgerBuilder;
pub use jsonrpc::JsonRpcLedger;
pub use memory::MemoryLedger;
pub use outbox::{FireAndForgetOutbox, LedgerOutbox, OutboxStats};

/// An external append-only ledger keyed by device id.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Contract or log address, when the backend has one.
    fn address(&self) -> Option<String>;

    /// Probe connectivity.
    async fn connect(&self) -> Result<()>;

    async fn store_data(&self, device_id: &str, data_hash: &str) -> Result<()>;

    async fn data_count(&self, device_id: &str) -> Result<u64>;

    async fn latest_data(&self, device_id: &str) -> Result<Option<LedgerRecord>>;

    async fn historical_data(&self, device_id: &str, index: u64) -> Result<Option<LedgerRecord>>;

    /// Records with `from <= timestamp <= to`, ascending by timestamp.
    async fn data_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerRecord>>;

    /// Every "data stored" event in the ledger's history. Cost grows with the
    /// total number of events.
    async fn stored_events(&self) -> Result<Vec<DataStoredEvent>>;
}

pub type DynLedger = Arc<dyn Ledger>;
