use super::{DynLedger, JsonRpcLedger, MemoryLedger};
use crate::{Result, TelemarkError};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct LedgerBuilder {
    backend: Option<String>,
    endpoint: Option<String>,
    contract_address: Option<String>,
    request_timeout: Option<Duration>,
}

impl LedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn contract_address(mut self, address: impl Into<String>) -> Self {
        self.contract_address = Some(address.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(TelemarkError::Config(
                "ledger backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    /// Build the configured backend. `disabled` yields `None`, which runs the
    /// store in local-only mode.
    pub fn build(&self) -> Result<Option<DynLedger>> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "jsonrpc" => {
                let endpoint = self.endpoint.as_deref().unwrap_or_default().trim();
                if endpoint.is_empty() {
                    return Err(TelemarkError::Config(
                        "endpoint is required for jsonrpc ledger backend".to_string(),
                    ));
                }

                let ledger = JsonRpcLedger::new(
                    endpoint,
                    self.contract_address
                        .clone()
                        .filter(|address| !address.trim().is_empty()),
                    self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                )?;
                Ok(Some(Arc::new(ledger)))
            }
            "memory" => Ok(Some(Arc::new(MemoryLedger::new()))),
            "disabled" | "none" => Ok(None),
            other => Err(TelemarkError::Config(format!(
                "unsupported ledger backend: {}",
                other
            ))),
        }
    }
}
