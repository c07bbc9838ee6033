//! Transport Adapter
//!
//! Connects the dispatcher to the dashboard backend.
//!
//! ## Architecture
//!
//! - **PushChannel**: WebSocket push connection with reconnect and a single
//!   serialized message handler
//! - **PushEvent**: Socket.IO frame parsing (`device_data`, `device_status`)
//! - **CloudClient**: REST client for stream history, devices, I/O output
//!   and serial send
//! - **HistorySource**: the one-shot fetch contract the dispatcher backfills
//!   through

mod client;
mod error;
mod event;
mod push;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::streams::FetchError;

pub use client::CloudClient;
pub use error::{ClientError, ClientResult, TransportError};
pub use event::{PushEvent, DEVICE_DATA_EVENT, DEVICE_STATUS_EVENT};
pub use push::{PushChannel, ReconnectConfig};

/// Source of historical data for a stream
///
/// Implementations perform one request per call; the dispatcher takes
/// care of sharing it between concurrent callers.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetch `{items: [...]}` for `(device_id, topic)`
    async fn fetch_history(&self, device_id: &str, topic: &str) -> Result<Value, FetchError>;
}

/// State of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No attempt has been made yet, or the channel has stopped
    Unknown,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
