//! Session ingress: inbound device messages and the set of connected devices.

use crate::model::{CameraFrame, TelemetryUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A message sent by a device over its session, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundMessage {
    Register {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Update {
        #[serde(default)]
        payload: TelemetryUpdate,
    },
    Camera(CameraFrame),
}

impl InboundMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Per-connection state. A session is bound to at most one device.
#[derive(Debug, Default)]
pub struct SessionState {
    device_id: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn bind(&mut self, device_id: &str) {
        self.device_id = Some(device_id.to_string());
    }

    pub fn unbind(&mut self) -> Option<String> {
        self.device_id.take()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    devices: Mutex<HashMap<String, ConnectedDevice>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectedDevice>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_registered(&self, device_id: &str) {
        let now = Utc::now();
        self.devices().insert(
            device_id.to_string(),
            ConnectedDevice {
                device_id: device_id.to_string(),
                connected_at: now,
                last_update: None,
            },
        );
        tracing::info!("Device {} connected", device_id);
    }

    pub fn on_update(&self, device_id: &str, at: DateTime<Utc>) {
        if let Some(device) = self.devices().get_mut(device_id) {
            device.last_update = Some(at);
        }
    }

    pub fn on_disconnected(&self, device_id: &str) {
        if self.devices().remove(device_id).is_some() {
            tracing::info!("Device {} disconnected", device_id);
        }
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.devices().contains_key(device_id)
    }

    /// Connected devices ordered by id.
    pub fn connected(&self) -> Vec<ConnectedDevice> {
        let mut devices: Vec<ConnectedDevice> = self.devices().values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}
