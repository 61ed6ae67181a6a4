use super::Ledger;
use crate::model::{DataStoredEvent, LedgerRecord};
use crate::{Result, TelemarkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DATA_STORED_EVENT: &str = "DataStored";

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Ledger gateway spoken to over JSON-RPC 2.0 on HTTP.
///
/// Methods: `net_version` (connectivity), `ledger_storeData`,
/// `ledger_getDataCount`, `ledger_getLatestData`, `ledger_getHistoricalData`,
/// `ledger_getDataInTimeRange` and `ledger_getPastEvents`. Timestamps are
/// unix seconds.
pub struct JsonRpcLedger {
    endpoint: String,
    contract_address: Option<String>,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(
        endpoint: impl Into<String>,
        contract_address: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(TelemarkError::Config(
                "jsonrpc ledger endpoint cannot be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| TelemarkError::Config(error.to_string()))?;

        Ok(Self {
            endpoint,
            contract_address,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_optional<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<R>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| TelemarkError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TelemarkError::Http(format!(
                "ledger call {} failed: status={}",
                method,
                response.status()
            )));
        }

        let payload: RpcResponse<R> = response
            .json()
            .await
            .map_err(|error| TelemarkError::Http(error.to_string()))?;

        if let Some(error) = payload.error {
            return Err(TelemarkError::LedgerCall(format!(
                "{} returned error {}: {}",
                method, error.code, error.message
            )));
        }

        Ok(payload.result)
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        self.call_optional(method, params).await?.ok_or_else(|| {
            TelemarkError::LedgerCall(format!("{} returned no result", method))
        })
    }

    fn device_params(&self, device_id: &str) -> Value {
        json!({
            "contract": self.contract_address,
            "deviceId": device_id,
        })
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    fn backend_name(&self) -> &'static str {
        "jsonrpc"
    }

    fn address(&self) -> Option<String> {
        self.contract_address.clone()
    }

    async fn connect(&self) -> Result<()> {
        let network: Value = self.call("net_version", json!([])).await?;
        tracing::info!(
            "Connected to ledger gateway {} (network {})",
            self.endpoint,
            network
        );
        Ok(())
    }

    async fn store_data(&self, device_id: &str, data_hash: &str) -> Result<()> {
        let mut params = self.device_params(device_id);
        params["dataHash"] = json!(data_hash);

        let receipt: Value = self.call("ledger_storeData", params).await?;
        tracing::debug!(
            "Ledger accepted hash {} for device {}: {}",
            data_hash,
            device_id,
            receipt
        );
        Ok(())
    }

    async fn data_count(&self, device_id: &str) -> Result<u64> {
        self.call("ledger_getDataCount", self.device_params(device_id))
            .await
    }

    async fn latest_data(&self, device_id: &str) -> Result<Option<LedgerRecord>> {
        self.call_optional("ledger_getLatestData", self.device_params(device_id))
            .await
    }

    async fn historical_data(&self, device_id: &str, index: u64) -> Result<Option<LedgerRecord>> {
        let mut params = self.device_params(device_id);
        params["index"] = json!(index);
        self.call_optional("ledger_getHistoricalData", params).await
    }

    async fn data_in_range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerRecord>> {
        let mut params = self.device_params(device_id);
        params["startTime"] = json!(from.timestamp());
        params["endTime"] = json!(to.timestamp());

        let mut records: Vec<LedgerRecord> = self
            .call_optional("ledger_getDataInTimeRange", params)
            .await?
            .unwrap_or_default();
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }

    async fn stored_events(&self) -> Result<Vec<DataStoredEvent>> {
        let params = json!({
            "contract": self.contract_address,
            "event": DATA_STORED_EVENT,
            "fromBlock": 0,
            "toBlock": "latest",
        });

        let events: Vec<DataStoredEvent> = self
            .call_optional("ledger_getPastEvents", params)
            .await?
            .unwrap_or_default();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use axum::{Json, Router, extract::State, routing::post};
    use chrono::TimeZone;
    use std::sync::Arc;

    /// Minimal gateway emulator backed by a memory ledger.
    async fn handle_rpc(State(ledger): State<Arc<MemoryLedger>>, Json(request): Json<Value>) -> Json<Value> {
        let id = request["id"].clone();
        let params = &request["params"];
        let device_id = params["deviceId"].as_str().unwrap_or_default().to_string();

        let result = match request["method"].as_str().unwrap_or_default() {
            "net_version" => json!("5777"),
            "ledger_storeData" => {
                let hash = params["dataHash"].as_str().unwrap_or_default();
                ledger.store_data(&device_id, hash).await.unwrap();
                json!("0xreceipt")
            }
            "ledger_getDataCount" => json!(ledger.data_count(&device_id).await.unwrap()),
            "ledger_getLatestData" => json!(ledger.latest_data(&device_id).await.unwrap()),
            "ledger_getHistoricalData" => {
                let index = params["index"].as_u64().unwrap_or_default();
                json!(ledger.historical_data(&device_id, index).await.unwrap())
            }
            "ledger_getDataInTimeRange" => {
                let from = DateTime::from_timestamp(params["startTime"].as_i64().unwrap(), 0).unwrap();
                let to = DateTime::from_timestamp(params["endTime"].as_i64().unwrap(), 0).unwrap();
                json!(ledger.data_in_range(&device_id, from, to).await.unwrap())
            }
            "ledger_getPastEvents" => json!(ledger.stored_events().await.unwrap()),
            other => {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("method not found: {}", other) },
                }));
            }
        };

        Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }

    async fn spawn_gateway(ledger: Arc<MemoryLedger>) -> String {
        let app = Router::new().route("/", post(handle_rpc)).with_state(ledger);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_round_trip_through_gateway() {
        let backing = Arc::new(MemoryLedger::new());
        let base = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        backing.seed_record("d1", "aa", base);
        backing.seed_record("d1", "bb", base + chrono::Duration::seconds(5));

        let endpoint = spawn_gateway(backing.clone()).await;
        let ledger =
            JsonRpcLedger::new(endpoint, Some("0xabc".to_string()), Duration::from_secs(5)).unwrap();

        ledger.connect().await.unwrap();
        ledger.store_data("d2", "cc").await.unwrap();

        assert_eq!(ledger.data_count("d1").await.unwrap(), 2);
        assert_eq!(ledger.latest_data("d1").await.unwrap().unwrap().data_hash, "bb");
        assert!(ledger.latest_data("nobody").await.unwrap().is_none());
        assert_eq!(
            ledger.historical_data("d1", 0).await.unwrap().unwrap().timestamp,
            base
        );

        let range = ledger
            .data_in_range("d1", base, base + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].data_hash, "aa");

        let events = ledger.stored_events().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(backing.records("d2").len(), 1);
        assert_eq!(ledger.address().as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ledger = JsonRpcLedger::new(
            format!("http://{}/", addr),
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(ledger.connect().await.is_err());
    }

    #[test]
    fn test_empty_endpoint_is_config_error() {
        let result = JsonRpcLedger::new("  ", None, Duration::from_secs(1));
        assert!(matches!(result, Err(TelemarkError::Config(_))));
    }
}
