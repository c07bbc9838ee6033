//! Gateway connection status
//!
//! Tracks each gateway's device-cloud connection status, seeded from the
//! device list and updated by `device_status` push events. Status `1`
//! means connected.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Connection status value reported for a connected gateway
pub const CONNECTED: i64 = 1;

/// Map of gateway connect id to connection status
#[derive(Debug, Default)]
pub struct DeviceStatusMap {
    statuses: RwLock<HashMap<String, i64>>,
}

impl DeviceStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one `device_status` push payload
    ///
    /// Reads `DeviceCore` at the top level or under `Device`. Returns the
    /// updated `(device_id, status)` pair, or `None` if the payload was
    /// unusable.
    pub fn apply_push(&self, payload: &Value) -> Option<(String, i64)> {
        let core = payload
            .get("DeviceCore")
            .or_else(|| payload.get("Device").and_then(|d| d.get("DeviceCore")))
            .filter(|core| core.as_object().is_some_and(|o| !o.is_empty()));

        let Some(core) = core else {
            tracing::info!(payload = %payload, "Got bad device status object");
            return None;
        };

        let Some(device_id) = core.get("devConnectwareId").and_then(Value::as_str) else {
            tracing::info!(payload = %payload, "Device status without device id");
            return None;
        };

        let Some(status) = core.get("dpConnectionStatus").and_then(parse_status) else {
            tracing::warn!(device_id = %device_id, "Got unknown device connection status");
            return None;
        };

        self.set(device_id, status);
        tracing::debug!(device_id = %device_id, status, "Device status updated");
        Some((device_id.to_string(), status))
    }

    /// Seed statuses from a device listing
    ///
    /// Returns how many devices were recorded.
    pub fn load_devices(&self, devices: &[Value]) -> usize {
        let mut loaded = 0;

        for device in devices {
            let Some(device_id) = device.get("devConnectwareId").and_then(Value::as_str) else {
                tracing::warn!(device = %device, "Device without connect id");
                continue;
            };
            match device.get("dpConnectionStatus").and_then(parse_status) {
                Some(status) => {
                    self.set(device_id, status);
                    loaded += 1;
                }
                None => {
                    tracing::error!(
                        device_id = %device_id,
                        status = ?device.get("dpConnectionStatus"),
                        "Got unknown device connection status"
                    );
                }
            }
        }

        loaded
    }

    pub fn status(&self, device_id: &str) -> Option<i64> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .copied()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.status(device_id) == Some(CONNECTED)
    }

    pub fn len(&self) -> usize {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set(&self, device_id: &str, status: i64) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), status);
    }
}

/// Numbers as-is, strings of digits converted
fn parse_status(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}
