use super::{AppendOutcome, HashLedgerClient};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStats {
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    /// Submissions dropped because the ledger was in local-only mode.
    pub skipped: u64,
}

/// Hand-off point between ingestion and the ledger. `submit` must return
/// without waiting on the ledger.
#[async_trait]
pub trait LedgerOutbox: Send + Sync {
    fn submit(&self, device_id: &str, hash: &str);

    /// Wait for every submission made so far to resolve.
    async fn flush(&self);

    fn stats(&self) -> OutboxStats;
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

enum Job {
    Append(String),
    Flush(oneshot::Sender<()>),
}

/// Hands submissions to one queue per device and never retries beyond the
/// client's own policy. A worker task drains each queue in order, so the
/// ledger sees a device's hashes in the order they were ingested. Lost
/// submissions are only logged.
pub struct FireAndForgetOutbox {
    client: Arc<HashLedgerClient>,
    counters: Arc<Counters>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
}

impl FireAndForgetOutbox {
    pub fn new(client: Arc<HashLedgerClient>) -> Self {
        Self {
            client,
            counters: Arc::new(Counters::default()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Job>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, device_id: &str, job: Job) {
        let mut queues = self.queues();
        let sender = queues
            .entry(device_id.to_string())
            .or_insert_with(|| self.spawn_worker(device_id));

        if let Err(mpsc::error::SendError(job)) = sender.send(job) {
            tracing::warn!("Ledger queue for device {} was closed, restarting it", device_id);
            let sender = self.spawn_worker(device_id);
            if sender.send(job).is_err() {
                tracing::error!("Failed to queue ledger submission for device {}", device_id);
            }
            queues.insert(device_id.to_string(), sender);
        }
    }

    fn spawn_worker(&self, device_id: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let client = self.client.clone();
        let counters = self.counters.clone();
        let device_id = device_id.to_string();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Append(hash) => record_append(&client, &counters, &device_id, &hash).await,
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        tx
    }
}

async fn record_append(client: &HashLedgerClient, counters: &Counters, device_id: &str, hash: &str) {
    match client.append(device_id, hash).await {
        AppendOutcome::Confirmed => {
            counters.confirmed.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Ledger recorded hash {} for device {}", hash, device_id);
        }
        AppendOutcome::Failed => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                "Ledger did not record hash {} for device {}",
                hash,
                device_id
            );
        }
        AppendOutcome::Unavailable => {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                "Ledger unavailable, hash {} for device {} kept locally only",
                hash,
                device_id
            );
        }
    }
}

#[async_trait]
impl LedgerOutbox for FireAndForgetOutbox {
    fn submit(&self, device_id: &str, hash: &str) {
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        self.enqueue(device_id, Job::Append(hash.to_string()));
    }

    async fn flush(&self) {
        // Each queue answers the marker once everything queued before it resolved.
        let pending: Vec<oneshot::Receiver<()>> = {
            let queues = self.queues();
            queues
                .values()
                .filter_map(|sender| {
                    let (tx, rx) = oneshot::channel();
                    sender.send(Job::Flush(tx)).ok().map(|_| rx)
                })
                .collect()
        };

        for done in pending {
            if done.await.is_err() {
                tracing::warn!("Ledger queue closed before draining");
            }
        }
    }

    fn stats(&self) -> OutboxStats {
        OutboxStats {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            confirmed: self.counters.confirmed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
        }
    }
}
