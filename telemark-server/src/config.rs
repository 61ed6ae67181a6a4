use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use telemark_core::{
    DynLedger, LedgerBuilder, LedgerClientOptions, Result, ServiceOptions, TelemarkError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_catalog_max_staleness_secs")]
    pub catalog_max_staleness_secs: u64,
    #[serde(default = "default_restore_window_days")]
    pub restore_window_days: i64,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Ledger backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_backend")]
    pub backend: LedgerBackend,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: default_ledger_backend(),
            endpoint: None,
            contract_address: None,
            call_timeout_ms: default_call_timeout_ms(),
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Jsonrpc,
    Memory,
    Disabled,
}

impl LedgerBackend {
    fn as_str(&self) -> &'static str {
        match self {
            LedgerBackend::Jsonrpc => "jsonrpc",
            LedgerBackend::Memory => "memory",
            LedgerBackend::Disabled => "disabled",
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_catalog_max_staleness_secs() -> u64 {
    60
}

fn default_restore_window_days() -> i64 {
    30
}

fn default_ledger_backend() -> LedgerBackend {
    LedgerBackend::Disabled
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("TELEMARK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| TelemarkError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TelemarkError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            return Err(TelemarkError::Config("bind_addr cannot be empty".to_string()));
        }
        if self.restore_window_days <= 0 {
            return Err(TelemarkError::Config(
                "restore_window_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            restore_window: chrono::Duration::days(self.restore_window_days),
            catalog_max_staleness: Duration::from_secs(self.catalog_max_staleness_secs),
            ledger: LedgerClientOptions {
                call_timeout: Duration::from_millis(self.ledger.call_timeout_ms),
                connect_retries: self.ledger.connect_retries,
                retry_delay: Duration::from_millis(self.ledger.retry_delay_ms),
            },
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn build_ledger(&self) -> Result<Option<DynLedger>> {
        let mut builder = LedgerBuilder::new()
            .backend(self.ledger.backend.as_str())
            .request_timeout(Duration::from_millis(self.ledger.call_timeout_ms));

        if let Some(endpoint) = &self.ledger.endpoint {
            builder = builder.endpoint(endpoint.clone());
        }
        if let Some(address) = &self.ledger.contract_address {
            builder = builder.contract_address(address.clone());
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("telemark.yaml");
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "bind_addr: \"127.0.0.1:3000\"\ndata_dir: \"/tmp/telemark\"\n");

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.catalog_max_staleness_secs, 60);
        assert_eq!(config.restore_window_days, 30);
        assert_eq!(config.ledger.backend, LedgerBackend::Disabled);
        assert_eq!(config.ledger.connect_retries, 3);
        assert!(config.build_ledger().unwrap().is_none());

        let options = config.service_options();
        assert_eq!(options.ledger.call_timeout, Duration::from_millis(5000));
        assert_eq!(options.restore_window, chrono::Duration::days(30));
    }

    #[test]
    fn test_load_jsonrpc_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
bind_addr: "0.0.0.0:3000"
data_dir: "./data"
ledger:
  backend: jsonrpc
  endpoint: "http://127.0.0.1:7545"
  contract_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3"
  call_timeout_ms: 1500
"#,
        );

        let config = Config::from_file(&path).unwrap();
        let ledger = config.build_ledger().unwrap().unwrap();
        assert_eq!(ledger.backend_name(), "jsonrpc");
        assert_eq!(
            ledger.address().as_deref(),
            Some("0x5FbDB2315678afecb367f032d93F642f64180aa3")
        );
    }

    #[test]
    fn test_jsonrpc_without_endpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "bind_addr: \"0.0.0.0:3000\"\ndata_dir: \"./data\"\nledger:\n  backend: jsonrpc\n",
        );

        let config = Config::from_file(&path).unwrap();
        assert!(config.build_ledger().is_err());
    }
}
