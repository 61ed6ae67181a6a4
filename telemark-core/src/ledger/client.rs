use super::DynLedger;
use crate::Result;
use crate::model::LedgerRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LedgerClientOptions {
    /// Upper bound for a single ledger call.
    pub call_timeout: Duration,
    pub connect_retries: u32,
    pub retry_delay: Duration,
}

impl Default for LedgerClientOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            connect_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatus {
    pub status: ConnectionState,
    pub backend: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Confirmed,
    Failed,
    /// The client is in local-only mode; nothing was sent.
    Unavailable,
}

/// Availability-aware front of a [`super::Ledger`].
///
/// Until [`initialize`](Self::initialize) succeeds, and whenever no backend is
/// configured, every query returns its "no data" value. Calls are bounded by
/// `call_timeout`; errors and timeouts are logged and swallowed.
pub struct HashLedgerClient {
    ledger: Option<DynLedger>,
    options: LedgerClientOptions,
    available: AtomicBool,
}

impl HashLedgerClient {
    pub fn new(ledger: Option<DynLedger>, options: LedgerClientOptions) -> Self {
        Self {
            ledger,
            options,
            available: AtomicBool::new(false),
        }
    }

    /// A client with no backend. It stays in local-only mode forever.
    pub fn disabled() -> Self {
        Self::new(None, LedgerClientOptions::default())
    }

    /// Probe the backend up to `connect_retries` times. Returns whether the
    /// ledger is ready.
    pub async fn initialize(&self) -> bool {
        let Some(ledger) = &self.ledger else {
            tracing::info!("No ledger backend configured; running in local-only mode");
            return false;
        };

        let attempts = self.options.connect_retries.max(1);
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.options.call_timeout, ledger.connect()).await {
                Ok(Ok(())) => {
                    self.available.store(true, Ordering::SeqCst);
                    tracing::info!(
                        "Ledger {} ready (address={:?})",
                        ledger.backend_name(),
                        ledger.address()
                    );
                    return true;
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        "Ledger connection attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        error
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        "Ledger connection attempt {}/{} timed out after {:?}",
                        attempt,
                        attempts,
                        self.options.call_timeout
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.options.retry_delay).await;
            }
        }

        self.available.store(false, Ordering::SeqCst);
        tracing::warn!("Ledger unavailable; running in local-only mode");
        false
    }

    /// Re-run initialization if the client is currently in local-only mode.
    pub async fn reconnect(&self) -> bool {
        if self.is_available() {
            return true;
        }
        self.initialize().await
    }

    pub fn is_available(&self) -> bool {
        self.ledger.is_some() && self.available.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LedgerStatus {
        let status = if self.is_available() {
            ConnectionState::Connected
        } else {
            ConnectionState::NotConnected
        };

        LedgerStatus {
            status,
            backend: self
                .ledger
                .as_ref()
                .map(|ledger| ledger.backend_name())
                .unwrap_or("disabled")
                .to_string(),
            address: self.ledger.as_ref().and_then(|ledger| ledger.address()),
        }
    }

    pub async fn append(&self, device_id: &str, hash: &str) -> AppendOutcome {
        let Some(ledger) = self.backend() else {
            return AppendOutcome::Unavailable;
        };

        match self.bounded("append", ledger.store_data(device_id, hash)).await {
            Some(()) => AppendOutcome::Confirmed,
            None => AppendOutcome::Failed,
        }
    }

    /// Whether the ledger holds at least one record for the device.
    pub async fn exists(&self, device_id: &str) -> bool {
        self.count(device_id).await > 0
    }

    pub async fn count(&self, device_id: &str) -> u64 {
        let Some(ledger) = self.backend() else {
            return 0;
        };
        self.bounded("count", ledger.data_count(device_id))
            .await
            .unwrap_or(0)
    }

    pub async fn latest(&self, device_id: &str) -> Option<LedgerRecord> {
        let ledger = self.backend()?;
        self.bounded("latest", ledger.latest_data(device_id))
            .await
            .flatten()
    }

    pub async fn record_at(&self, device_id: &str, index: u64) -> Option<LedgerRecord> {
        let ledger = self.backend()?;
        self.bounded("record_at", ledger.historical_data(device_id, index))
            .await
            .flatten()
    }

    /// Records in `[from, to]`, ascending by timestamp.
    pub async fn range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<LedgerRecord> {
        let Some(ledger) = self.backend() else {
            return Vec::new();
        };

        let mut records = self
            .bounded("range", ledger.data_in_range(device_id, from, to))
            .await
            .unwrap_or_default();
        records.sort_by_key(|record| record.timestamp);
        records
    }

    /// Distinct device ids seen in the ledger's event log. `None` means the
    /// scan could not be made, which is different from an empty ledger.
    pub async fn enumerate_device_ids(&self) -> Option<BTreeSet<String>> {
        let ledger = self.backend()?;
        let events = self
            .bounded("enumerate_device_ids", ledger.stored_events())
            .await?;

        Some(events.into_iter().map(|event| event.device_id).collect())
    }

    fn backend(&self) -> Option<&DynLedger> {
        if self.available.load(Ordering::SeqCst) {
            self.ledger.as_ref()
        } else {
            None
        }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.options.call_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                tracing::warn!("Ledger {} failed: {}", operation, error);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "Ledger {} timed out after {:?}",
                    operation,
                    self.options.call_timeout
                );
                None
            }
        }
    }
}
