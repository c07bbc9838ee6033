//! Push frame parsing
//!
//! The push backend speaks Socket.IO. A text frame carries one event in
//! either framing:
//!
//! ```text
//! 42["device_data", {"DataPoint": {...}}]        packet-type prefix + array
//! ["device_status", {"Device": {...}}]           bare array
//! {"event": "device_data", "data": {...}}        object envelope
//! ```
//!
//! Engine.IO control frames (`2`, `3`, `40`) carry no event and are
//! reported as [`TransportError::Frame`] so the reader can skip them.

use serde::Deserialize;
use serde_json::Value;

use super::error::TransportError;

pub const DEVICE_DATA_EVENT: &str = "device_data";
pub const DEVICE_STATUS_EVENT: &str = "device_status";

/// One event received on the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// A new data point; payload goes to `Dispatcher::new_data`
    DeviceData(Value),
    /// A gateway connection status change
    DeviceStatus(Value),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl PushEvent {
    /// Parse one text frame
    pub fn parse(frame: &str) -> Result<Self, TransportError> {
        let body = strip_packet_type(frame.trim());
        let value: Value =
            serde_json::from_str(body).map_err(|e| TransportError::Frame(e.to_string()))?;

        let (name, payload) = match value {
            Value::Array(mut parts) if !parts.is_empty() => {
                let payload = if parts.len() > 1 {
                    parts.swap_remove(1)
                } else {
                    Value::Null
                };
                match parts.swap_remove(0) {
                    Value::String(name) => (name, payload),
                    other => return Err(TransportError::Frame(format!("event name is {}", other))),
                }
            }
            obj @ Value::Object(_) => {
                let envelope: Envelope =
                    serde_json::from_value(obj).map_err(|e| TransportError::Frame(e.to_string()))?;
                (envelope.event, envelope.data)
            }
            other => return Err(TransportError::Frame(format!("unexpected frame {}", other))),
        };

        Self::from_parts(&name, payload)
    }

    /// Build an event from its name and payload
    pub fn from_parts(name: &str, payload: Value) -> Result<Self, TransportError> {
        match name {
            DEVICE_DATA_EVENT => Ok(PushEvent::DeviceData(payload)),
            DEVICE_STATUS_EVENT => Ok(PushEvent::DeviceStatus(payload)),
            other => Err(TransportError::UnknownEvent(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::DeviceData(_) => DEVICE_DATA_EVENT,
            PushEvent::DeviceStatus(_) => DEVICE_STATUS_EVENT,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            PushEvent::DeviceData(v) | PushEvent::DeviceStatus(v) => v,
        }
    }
}

/// Drop a leading Engine.IO/Socket.IO packet type (`42`) before the JSON body
fn strip_packet_type(frame: &str) -> &str {
    let start = frame
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(frame.len());
    &frame[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_array_frame() {
        let frame = r#"["device_data", {"DataPoint": {"streamId": "dev1/t1", "data": 1, "timestamp": 2}}]"#;
        let event = PushEvent::parse(frame).unwrap();
        assert_eq!(event.name(), DEVICE_DATA_EVENT);
        assert_eq!(event.payload()["DataPoint"]["streamId"], "dev1/t1");
    }

    #[test]
    fn test_parse_prefixed_frame() {
        let frame = r#"42["device_status",{"Device":{"DeviceCore":{"devConnectwareId":"d1","dpConnectionStatus":1}}}]"#;
        let event = PushEvent::parse(frame).unwrap();
        assert!(matches!(event, PushEvent::DeviceStatus(_)));
    }

    #[test]
    fn test_parse_object_frame() {
        let frame = json!({"event": "device_data", "data": {"streamId": "dev1/t1"}}).to_string();
        let event = PushEvent::parse(&frame).unwrap();
        assert_eq!(event, PushEvent::DeviceData(json!({"streamId": "dev1/t1"})));
    }

    #[test]
    fn test_unknown_event() {
        let err = PushEvent::parse(r#"["alarm", {}]"#).unwrap_err();
        assert_eq!(err, TransportError::UnknownEvent("alarm".to_string()));
    }

    #[test]
    fn test_control_frames_are_not_events() {
        assert!(matches!(PushEvent::parse("2"), Err(TransportError::Frame(_))));
        assert!(matches!(PushEvent::parse("40"), Err(TransportError::Frame(_))));
        assert!(matches!(PushEvent::parse("[]"), Err(TransportError::Frame(_))));
        assert!(matches!(PushEvent::parse("[1, 2]"), Err(TransportError::Frame(_))));
        assert!(matches!(PushEvent::parse("not json"), Err(TransportError::Frame(_))));
    }

    #[test]
    fn test_event_without_payload() {
        let event = PushEvent::parse(r#"["device_data"]"#).unwrap();
        assert_eq!(event.payload(), &Value::Null);
    }
}
