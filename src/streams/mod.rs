//! Live Data-Stream Routing
//!
//! Routes device readings to the widgets that display them.
//!
//! ## Architecture
//!
//! - **Topic**: Stream identifiers, topic segments and `${field}` templates
//! - **Point**: Normalization of raw items into canonical data points
//! - **TopicTree**: Registration tree mapping `(device, topic)` to listeners
//! - **Dispatcher**: Push fan-out and de-duplicated history backfill
//!
//! ## Usage
//!
//! ```ignore
//! let dispatcher = Dispatcher::new(Arc::new(client));
//!
//! let sub = dispatcher.listen("dev1", "xbee.analog/[!]/AD1", |point, _raw, device, topic| {
//!     println!("{device}/{topic} = {}", point.value);
//! });
//! dispatcher.get_initial_data("dev1", "xbee.analog/[00:13:A2:00:40:A0:44:33]!/AD1").await?;
//!
//! // Unmount
//! drop(sub);
//! ```

mod dispatcher;
mod error;
mod point;
mod topic;
mod tree;

pub use dispatcher::{Backfill, Delivery, Dispatcher, Subscription, DATA_POINT_FIELD, STREAM_ID_FIELD};
pub use error::{FetchError, PointError, StreamError, StreamResult, TopicError};
pub use point::{history_items, normalize_item, parse_timestamp, unwrap_current_value, DataPoint, PointValue};
pub use topic::{expand_template, DeviceKey, Segment, StreamId, StreamKind, Topic, ANY_QUALIFIER, WILDCARD};
pub use tree::{listener, Listener, ListenerId, TopicTree};
