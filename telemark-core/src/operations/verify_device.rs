use crate::ledger::HashLedgerClient;
use crate::model::validate_device_id;
use crate::storage::{ContentStore, snapshot_hash};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Mismatch,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub device_id: String,
    pub verified: bool,
    pub status: VerificationStatus,
    pub local_hash: Option<String>,
    pub ledger_hash: Option<String>,
    pub ledger_timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

/// Compares the hash of the local latest snapshot with the ledger's latest
/// attestation for the device.
#[derive(Clone)]
pub struct VerifyDeviceOperation {
    content: Arc<ContentStore>,
    ledger: Arc<HashLedgerClient>,
}

impl VerifyDeviceOperation {
    pub fn new(content: Arc<ContentStore>, ledger: Arc<HashLedgerClient>) -> Self {
        Self { content, ledger }
    }

    pub async fn run(&self, device_id: &str) -> Result<VerifyReport> {
        validate_device_id(device_id)?;

        let mut report = VerifyReport {
            device_id: device_id.to_string(),
            verified: false,
            status: VerificationStatus::Pending,
            local_hash: None,
            ledger_hash: None,
            ledger_timestamp: None,
            message: String::new(),
        };

        if !self.ledger.exists(device_id).await {
            report.message = "no ledger record for device yet".to_string();
            return Ok(report);
        }

        let latest = match self.content.latest(device_id).await {
            Ok(latest) => latest,
            Err(error) => {
                tracing::error!("Failed to read latest snapshot of {}: {}", device_id, error);
                report.status = VerificationStatus::Error;
                report.message = format!("local snapshot unreadable: {}", error);
                return Ok(report);
            }
        };

        let Some(latest) = latest else {
            report.status = VerificationStatus::Error;
            report.message = "no local snapshot for device".to_string();
            return Ok(report);
        };

        let local_hash = snapshot_hash(&latest)?;
        report.local_hash = Some(local_hash.clone());

        let Some(record) = self.ledger.latest(device_id).await else {
            report.message = "ledger latest record unavailable".to_string();
            return Ok(report);
        };

        report.ledger_timestamp = Some(record.timestamp);
        if record.data_hash == local_hash {
            report.verified = true;
            report.status = VerificationStatus::Verified;
            report.message = "local data matches ledger".to_string();
        } else {
            tracing::warn!(
                "Ledger mismatch for {}: local={} ledger={}",
                device_id,
                local_hash,
                record.data_hash
            );
            report.status = VerificationStatus::Mismatch;
            report.message = "local data differs from ledger".to_string();
        }
        report.ledger_hash = Some(record.data_hash);

        Ok(report)
    }
}
