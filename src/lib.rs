//! # xbgw-streams
//!
//! Live data-stream routing for XBee gateway dashboards. Device readings
//! arrive from a push channel or from a history backfill and are fanned out
//! to the widgets registered for them.
//!
//! ## Features
//!
//! - **Topic tree**: per-device registrations with `[!]` radio wildcards and
//!   a `!` any-device key
//! - **De-duplicated backfill**: concurrent history requests for one stream
//!   share a single fetch
//! - **Normalization**: every listener sees the same `{value, timestamp}`
//!   shape, whatever the source
//! - **Push transport**: Socket.IO WebSocket with reconnect and backoff
//!
//! ## Modules
//!
//! - [`streams`]: Topic grammar, topic tree and dispatcher
//! - [`transport`]: Push channel and REST client
//! - [`status`]: Gateway connection status
//! - [`config`]: TOML configuration with environment overrides
//! - [`logging`]: `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xbgw_streams::{CloudClient, Config, Dispatcher, PushChannel, PushEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default();
//!     let client = Arc::new(CloudClient::new(&config.cloud)?);
//!     let dispatcher = Dispatcher::new(client);
//!
//!     let _sub = dispatcher.listen("00000000-00000000-00409DFF-FF123456", "xbee.analog/[!]/AD1",
//!         |point, _raw, _device, topic| println!("{topic}: {}", point.value));
//!
//!     let push = PushChannel::connect(&config.push, CancellationToken::new());
//!     let router = dispatcher.clone();
//!     push.on_message(move |event| {
//!         if let PushEvent::DeviceData(payload) = event {
//!             router.new_data(&payload);
//!         }
//!     })?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod status;
pub mod streams;
pub mod transport;

// Re-export top-level types for convenience
pub use streams::{
    Backfill, DataPoint, Delivery, DeviceKey, Dispatcher, FetchError, PointValue, StreamError,
    StreamId, StreamKind, StreamResult, Subscription, Topic, TopicTree,
};

pub use transport::{
    ClientError, CloudClient, ConnectionState, HistorySource, PushChannel, PushEvent,
    ReconnectConfig, TransportError,
};

pub use status::DeviceStatusMap;

pub use config::{CloudConfig, Config, ConfigError, LoggingConfig, PushConfig};
