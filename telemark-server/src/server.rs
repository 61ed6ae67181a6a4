use crate::config::Config;
use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use telemark_core::{
    DeviceHistoryOperationOutcome, InboundMessage, RestoreDeviceOperationOutcome, Result,
    SessionState, TelemarkError, TelemetryService,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub service: Arc<TelemetryService>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        let resp = ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        };
        (StatusCode::OK, axum::Json(resp)).into_response()
    }
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.into()),
    };
    (status, axum::Json(resp)).into_response()
}

fn error_response(error: TelemarkError) -> Response {
    let status = match error {
        TelemarkError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    }
    failure(status, error.to_string())
}

pub async fn run_server(config: Config) -> Result<()> {
    let ledger = config.build_ledger()?;
    let service = Arc::new(
        TelemetryService::open(config.data_dir.clone(), ledger, config.service_options()).await?,
    );

    let connected = service.start().await?;
    tracing::info!(
        "Data directory {:?}, ledger {}",
        config.data_dir,
        if connected { "connected" } else { "not connected" }
    );

    let reconcile_service = service.clone();
    let interval = config.reconcile_interval();
    tokio::spawn(async move {
        reconcile_loop(reconcile_service, interval).await;
    });

    let state = Arc::new(ServerState {
        service: service.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.flush_ledger().await;
    tracing::info!("Server stopped");

    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/connected", get(connected_devices))
        .route("/api/devices/:device_id", delete(delete_device))
        .route("/api/devices/:device_id/history", get(device_history))
        .route("/api/devices/:device_id/restore", post(restore_device))
        .route("/api/ledger/status", get(ledger_status))
        .route("/api/ledger/verify/:device_id", get(verify_device))
        .route("/api/ledger/devices", get(ledger_devices))
        .route(
            "/api/ledger/devices/:device_id/records/:index",
            get(ledger_record),
        )
        .route("/ws", get(ws_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn reconcile_loop(service: Arc<TelemetryService>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // the first tick fires immediately; startup already reconciled
    interval.tick().await;

    loop {
        interval.tick().await;

        if !service.ledger().is_available() && service.reconnect_ledger().await {
            tracing::info!("Ledger reconnected");
        }

        if let Err(e) = service.reconcile_catalog().await {
            tracing::warn!("Periodic catalog reconciliation failed: {}", e);
        }
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let ledger = state.service.ledger().status();

    let response = serde_json::json!({
        "status": "ok",
        "ledger": ledger.status,
        "connected_devices": state.service.connected_devices().len(),
    });

    (StatusCode::OK, axum::Json(response))
}

async fn list_devices(State(state): State<Arc<ServerState>>) -> Response {
    match state.service.list_devices().await {
        Ok(devices) => ApiResponse::ok(devices),
        Err(e) => error_response(e),
    }
}

async fn connected_devices(State(state): State<Arc<ServerState>>) -> Response {
    ApiResponse::ok(state.service.connected_devices())
}

async fn device_history(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Response {
    match state.service.get_history(&device_id).await {
        Ok(DeviceHistoryOperationOutcome::Found(history)) => ApiResponse::ok(history),
        Ok(DeviceHistoryOperationOutcome::NotFound) => {
            failure(StatusCode::NOT_FOUND, format!("device not found: {}", device_id))
        }
        Err(e) => error_response(e),
    }
}

async fn restore_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Response {
    match state.service.restore(&device_id).await {
        Ok(RestoreDeviceOperationOutcome::Restored(result)) => ApiResponse::ok(result),
        Ok(RestoreDeviceOperationOutcome::Declined(reason)) => {
            let resp = ApiResponse {
                success: false,
                data: Some(serde_json::json!({ "reason": reason })),
                error: Some(reason.to_string()),
            };
            (StatusCode::BAD_REQUEST, axum::Json(resp)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn delete_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Response {
    match state.service.delete_device(&device_id).await {
        Ok(deleted) => ApiResponse::ok(serde_json::json!({
            "deviceId": device_id,
            "deleted": deleted,
        })),
        Err(e) => error_response(e),
    }
}

async fn ledger_status(State(state): State<Arc<ServerState>>) -> Response {
    ApiResponse::ok(state.service.ledger_status())
}

async fn verify_device(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Response {
    match state.service.verify(&device_id).await {
        Ok(report) => ApiResponse::ok(report),
        Err(e) => error_response(e),
    }
}

async fn ledger_devices(State(state): State<Arc<ServerState>>) -> Response {
    ApiResponse::ok(state.service.list_ledger_devices().await)
}

async fn ledger_record(
    State(state): State<Arc<ServerState>>,
    Path((device_id, index)): Path<(String, u64)>,
) -> Response {
    match state.service.ledger_record(&device_id, index).await {
        Ok(Some(record)) => ApiResponse::ok(record),
        Ok(None) => failure(
            StatusCode::NOT_FOUND,
            format!("no ledger record {} for device {}", index, device_id),
        ),
        Err(e) => error_response(e),
    }
}

async fn ws_handler(State(state): State<Arc<ServerState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let mut session = SessionState::new();

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("WebSocket receive error: {}", e);
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let inbound = match InboundMessage::parse(&text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!("Ignoring malformed device message: {}", e);
                continue;
            }
        };

        if let Err(e) = state.service.handle_message(&mut session, inbound).await {
            tracing::warn!(
                "Failed to handle message from device {:?}: {}",
                session.device_id(),
                e
            );
        }
    }

    state.service.close_session(&mut session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use telemark_core::{
        LedgerClientOptions, Location, MemoryLedger, ServiceOptions, TelemetryUpdate,
    };
    use tower::ServiceExt;

    async fn test_app() -> (tempfile::TempDir, Arc<TelemetryService>, Router) {
        let dir = tempfile::tempdir().unwrap();
        let options = ServiceOptions {
            catalog_max_staleness: Duration::ZERO,
            ledger: LedgerClientOptions {
                call_timeout: Duration::from_secs(2),
                connect_retries: 1,
                retry_delay: Duration::from_millis(10),
            },
            ..Default::default()
        };
        let service = Arc::new(
            TelemetryService::open(
                dir.path().to_path_buf(),
                Some(Arc::new(MemoryLedger::new())),
                options,
            )
            .await
            .unwrap(),
        );
        service.start().await.unwrap();

        let app = build_router(Arc::new(ServerState {
            service: service.clone(),
        }));
        (dir, service, app)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (_dir, _service, app) = test_app().await;
        let (status, json) = send(&app, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["ledger"], "connected");
    }

    #[tokio::test]
    async fn devices_history_and_verify() {
        let (_dir, service, app) = test_app().await;
        service
            .on_device_update(
                "d1",
                &TelemetryUpdate {
                    location: Some(Location::new(1.0, 2.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        service.flush_ledger().await;

        let (status, json) = send(&app, get("/api/devices")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"][0]["deviceId"], "d1");
        assert_eq!(json["data"][0]["origin"], "local");

        let (status, json) = send(&app, get("/api/devices/d1/history")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["locations"][0]["latitude"], 1.0);
        assert_eq!(json["data"]["dataSource"]["locations"], "local");

        let (status, json) = send(&app, get("/api/ledger/verify/d1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "verified");

        let (_, json) = send(&app, get("/api/ledger/devices")).await;
        assert_eq!(json["data"][0], "d1");

        let (status, json) = send(&app, get("/api/ledger/devices/d1/records/0")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["deviceId"], "d1");
        assert_eq!(json["data"]["dataHash"].as_str().unwrap().len(), 64);

        let (status, _) = send(&app, get("/api/ledger/devices/d1/records/7")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = send(&app, get("/api/ledger/status")).await;
        assert_eq!(json["data"]["status"], "connected");
        assert_eq!(json["data"]["backend"], "memory");
        assert_eq!(json["data"]["outbox"]["confirmed"], 1);
    }

    #[tokio::test]
    async fn unknown_device_history_is_404() {
        let (_dir, _service, app) = test_app().await;
        let (status, json) = send(&app, get("/api/devices/ghost/history")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn declined_restore_is_400() {
        let (_dir, _service, app) = test_app().await;
        let request = Request::post("/api/devices/ghost/restore")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["data"]["reason"], "no_ledger_data");
    }

    #[tokio::test]
    async fn invalid_device_id_is_400() {
        let (_dir, _service, app) = test_app().await;
        let (status, json) = send(&app, get("/api/ledger/verify/%2E%2E")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn delete_device_removes_local_data() {
        let (_dir, service, app) = test_app().await;
        service
            .on_device_update(
                "d1",
                &TelemetryUpdate {
                    location: Some(Location::new(1.0, 2.0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let request = Request::delete("/api/devices/d1").body(Body::empty()).unwrap();
        let (status, json) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["deleted"], true);
        assert!(!service.store().content().device_exists("d1").await.unwrap());
    }

    #[tokio::test]
    async fn connected_devices_starts_empty() {
        let (_dir, _service, app) = test_app().await;
        let (status, json) = send(&app, get("/api/devices/connected")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"].as_array().unwrap().len(), 0);
    }
}
