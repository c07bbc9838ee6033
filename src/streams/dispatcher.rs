//! Data-stream dispatcher
//!
//! Bridges push messages and history backfills into the topic tree.
//!
//! ```text
//! push frame ──► new_data ──┐
//!                           ├─► normalize ─► TopicTree::resolve ─► listeners
//! fetch_history ─► backfill ┘
//! ```
//!
//! At most one history fetch per `(device_id, topic)` is in flight. Callers
//! of [`Dispatcher::get_initial_data`] that arrive while it is pending share
//! its outcome. The fetch runs on its own task, so it settles, clears its
//! cache entry and routes its items even when every waiter has gone away.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;

use super::error::{StreamError, StreamResult};
use super::point::{history_items, normalize_item, DataPoint};
use super::topic::{DeviceKey, StreamId, Topic};
use super::tree::{Listener, ListenerId, TopicTree};
use crate::transport::HistorySource;

/// Wrapper key push frames put the data point under
pub const DATA_POINT_FIELD: &str = "DataPoint";

/// Field holding `<device_id>/<topic>` in a push data point
pub const STREAM_ID_FIELD: &str = "streamId";

type SharedFetch = Shared<BoxFuture<'static, StreamResult<Backfill>>>;

/// Outcome of a history backfill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backfill {
    /// The response was routed to the listeners registered when it landed
    Delivered {
        /// Items normalized and delivered
        points: usize,
        /// Items dropped by normalization
        dropped: usize,
    },
    /// The dispatcher was cleared before the fetch settled
    Cancelled,
}

/// Outcome of routing one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Number of listeners invoked (possibly zero)
    Delivered(usize),
    /// Message was malformed and has been logged
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    device_id: String,
    topic: String,
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.topic)
    }
}

struct PendingFetch {
    id: u64,
    fetch: SharedFetch,
    waiters: usize,
}

struct Inner {
    tree: Mutex<TopicTree>,
    pending: Mutex<HashMap<StreamKey, PendingFetch>>,
    source: Arc<dyn HistorySource>,
    /// Held for the duration of one delivery so deliveries never overlap
    delivery: Mutex<()>,
    cancel: Mutex<CancellationToken>,
    next_fetch: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes canonical data points to widget listeners
///
/// Cheap to clone; clones share the same tree and pending-fetch cache.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(TopicTree::new()),
                pending: Mutex::new(HashMap::new()),
                source,
                delivery: Mutex::new(()),
                cancel: Mutex::new(CancellationToken::new()),
                next_fetch: AtomicU64::new(0),
            }),
        }
    }

    /// Register `callback` for deliveries to `(device_id, topic)`
    ///
    /// `device_id` may be `!` for any device, and `topic` may carry a `[!]`
    /// qualifier for any radio.
    pub fn listen<F>(&self, device_id: &str, topic: &str, callback: F) -> Subscription
    where
        F: Fn(&DataPoint, &Value, &str, &str) + Send + Sync + 'static,
    {
        self.listen_with(device_id, topic, Arc::new(callback))
    }

    /// [`listen`](Self::listen) with an already shared listener
    pub fn listen_with(&self, device_id: &str, topic: &str, listener: Listener) -> Subscription {
        let device = DeviceKey::parse(device_id);
        let topic = Topic::parse(topic);
        let id = lock(&self.inner.tree).register(&device, &topic, listener);

        tracing::debug!(device_id = %device, topic = %topic, "Listener registered");

        Subscription {
            inner: Arc::downgrade(&self.inner),
            device,
            topic,
            id,
        }
    }

    /// Backfill `(device_id, topic)` with historical data
    ///
    /// Joins the pending fetch for the key if there is one. Items are routed
    /// exactly like push data. A fetch failure is returned to every caller
    /// that shared it; nothing is retried.
    pub async fn get_initial_data(&self, device_id: &str, topic: &str) -> StreamResult<Backfill> {
        let key = StreamKey {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
        };
        let (fetch, _waiter) = self.join_or_start(key);
        fetch.await
    }

    fn join_or_start(&self, key: StreamKey) -> (SharedFetch, Waiter) {
        let mut pending = lock(&self.inner.pending);

        if let Some(entry) = pending.get_mut(&key) {
            entry.waiters += 1;
            tracing::debug!(stream = %key, waiters = entry.waiters, "Joined pending history fetch");
            let waiter = Waiter::new(&self.inner, key, entry.id);
            return (entry.fetch.clone(), waiter);
        }

        let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
        let cancel = lock(&self.inner.cancel).child_token();
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move { inner.run_fetch(task_key, id, cancel).await });

        let fetch = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(StreamError::Join(e.to_string())))
        }
        .boxed()
        .shared();

        tracing::debug!(stream = %key, fetch_id = id, "Started history fetch");
        pending.insert(
            key.clone(),
            PendingFetch {
                id,
                fetch: fetch.clone(),
                waiters: 1,
            },
        );
        (fetch, Waiter::new(&self.inner, key, id))
    }

    /// Route one inbound push message
    ///
    /// Accepts `{"DataPoint": {...}}` or the bare data point. Malformed
    /// messages are logged and dropped; nothing is raised to the caller.
    pub fn new_data(&self, raw: &Value) -> Delivery {
        let payload = raw.get(DATA_POINT_FIELD).unwrap_or(raw);

        let Some(stream_id) = payload.get(STREAM_ID_FIELD).and_then(Value::as_str) else {
            tracing::warn!(payload = %raw, "Dropping push message without stream id");
            return Delivery::Dropped;
        };

        let stream = match StreamId::parse(stream_id) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping push message");
                return Delivery::Dropped;
            }
        };

        match normalize_item(payload) {
            Ok(point) => Delivery::Delivered(self.inner.deliver(
                &stream.device_id,
                &stream.topic,
                &point,
                raw,
            )),
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "Dropping malformed data point");
                Delivery::Dropped
            }
        }
    }

    /// Drop every listener and cancel in-flight fetches
    ///
    /// Waiters of cancelled fetches receive [`Backfill::Cancelled`]; a
    /// backfill requested after this call starts a fresh fetch.
    /// Outstanding subscriptions become no-ops.
    pub fn clear(&self) {
        let previous = std::mem::replace(&mut *lock(&self.inner.cancel), CancellationToken::new());
        previous.cancel();

        // Listeners may own subscriptions, so they are dropped after the locks
        let cancelled = std::mem::take(&mut *lock(&self.inner.pending));
        let detached = lock(&self.inner.tree).take();
        tracing::info!(
            listeners = detached.listener_count(),
            fetches = cancelled.len(),
            "Dispatcher cleared"
        );
        drop(cancelled);
        drop(detached);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.tree).listener_count()
    }

    /// True when the tree holds no nodes and no fetch is in flight
    pub fn is_idle(&self) -> bool {
        lock(&self.inner.tree).is_empty() && lock(&self.inner.pending).is_empty()
    }

    /// Number of history fetches currently in flight
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Callers still awaiting the pending fetch for a key, if one is in flight
    pub fn pending_waiters(&self, device_id: &str, topic: &str) -> Option<usize> {
        let key = StreamKey {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
        };
        lock(&self.inner.pending).get(&key).map(|p| p.waiters)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tree", &*lock(&self.inner.tree))
            .field("pending", &lock(&self.inner.pending).len())
            .finish()
    }
}

impl Inner {
    async fn run_fetch(
        self: Arc<Self>,
        key: StreamKey,
        id: u64,
        cancel: CancellationToken,
    ) -> StreamResult<Backfill> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.source.fetch_history(&key.device_id, &key.topic) => Some(result),
        };

        let waiters = self.settle(&key, id);

        match result {
            None => {
                tracing::debug!(stream = %key, waiters, "History fetch cancelled");
                Ok(Backfill::Cancelled)
            }
            Some(Err(e)) => {
                tracing::warn!(stream = %key, waiters, error = %e, "History fetch failed");
                Err(StreamError::Fetch(e))
            }
            Some(Ok(response)) => {
                let backfill = self.deliver_history(&key, &response);
                tracing::debug!(stream = %key, waiters, result = ?backfill, "History fetch delivered");
                Ok(backfill)
            }
        }
    }

    /// Remove the cache entry for a settled fetch, returning its live waiter count
    fn settle(&self, key: &StreamKey, id: u64) -> usize {
        let mut pending = lock(&self.pending);
        match pending.get(key) {
            Some(entry) if entry.id == id => pending.remove(key).map_or(0, |e| e.waiters),
            _ => 0,
        }
    }

    fn deliver_history(&self, key: &StreamKey, response: &Value) -> Backfill {
        let mut points = 0;
        let mut dropped = 0;

        for item in history_items(response) {
            match normalize_item(item) {
                Ok(point) => {
                    self.deliver(&key.device_id, &key.topic, &point, item);
                    points += 1;
                }
                Err(e) => {
                    tracing::warn!(stream = %key, error = %e, "Dropping malformed history item");
                    dropped += 1;
                }
            }
        }

        Backfill::Delivered { points, dropped }
    }

    /// Invoke every listener matching `(device_id, topic)`
    ///
    /// Listeners run outside the tree lock, so they may register or release.
    /// They must not feed messages back into the dispatcher.
    fn deliver(&self, device_id: &str, topic: &str, point: &DataPoint, raw: &Value) -> usize {
        let parsed = Topic::parse(topic);
        let _gate = lock(&self.delivery);
        let listeners = lock(&self.tree).resolve(device_id, &parsed);

        for listener in &listeners {
            listener(point, raw, device_id, topic);
        }

        tracing::trace!(
            device_id = %device_id,
            topic = %topic,
            listeners = listeners.len(),
            "Delivered data point"
        );
        listeners.len()
    }
}

/// One caller awaiting a pending fetch; leaves the waiter count on drop
struct Waiter {
    inner: Weak<Inner>,
    key: StreamKey,
    id: u64,
}

impl Waiter {
    fn new(inner: &Arc<Inner>, key: StreamKey, id: u64) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            key,
            id,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut pending = lock(&inner.pending);
        if let Some(entry) = pending.get_mut(&self.key) {
            if entry.id == self.id {
                entry.waiters = entry.waiters.saturating_sub(1);
            }
        }
    }
}

/// Capability to release one listener registration
///
/// Dropping the handle releases the registration; use
/// [`detach`](Self::detach) to keep the listener for the dispatcher's
/// lifetime instead.
#[must_use = "dropping a Subscription releases its listener"]
pub struct Subscription {
    inner: Weak<Inner>,
    device: DeviceKey,
    topic: Topic,
    id: ListenerId,
}

impl Subscription {
    /// Remove the listener. Safe to call more than once, after
    /// [`Dispatcher::clear`], or after the dispatcher is gone.
    pub fn release(&mut self) {
        let Some(inner) = std::mem::take(&mut self.inner).upgrade() else {
            return;
        };
        let removed = lock(&inner.tree).release(&self.device, &self.topic, self.id);
        if let Some(listener) = removed {
            tracing::debug!(device_id = %self.device, topic = %self.topic, "Listener released");
            drop(listener);
        }
    }

    /// Give up the handle without releasing the listener
    pub fn detach(mut self) {
        self.inner = Weak::new();
    }

    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }

    pub fn device(&self) -> &DeviceKey {
        &self.device
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("device", &self.device)
            .field("topic", &self.topic.as_str())
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::error::FetchError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// History source that blocks every fetch until the test opens the gate
    struct GatedSource {
        calls: AtomicUsize,
        gate: Semaphore,
        response: Mutex<Result<Value, FetchError>>,
    }

    impl GatedSource {
        fn new(response: Result<Value, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                response: Mutex::new(response),
            })
        }

        fn open(&self) {
            // Permits are returned when a fetch finishes, one is enough
            self.gate.add_permits(1);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HistorySource for GatedSource {
        async fn fetch_history(&self, _device_id: &str, _topic: &str) -> Result<Value, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|_| FetchError::Unavailable)?;
            self.response.lock().unwrap().clone()
        }
    }

    type Seen = Arc<Mutex<Vec<(String, DataPoint, String, String)>>>;

    fn recorder(seen: &Seen, name: &str) -> Listener {
        let seen = Arc::clone(seen);
        let name = name.to_string();
        crate::streams::tree::listener(move |point, _raw, device, topic| {
            seen.lock().unwrap().push((
                name.clone(),
                point.clone(),
                device.to_string(),
                topic.to_string(),
            ));
        })
    }

    fn names(seen: &Seen) -> Vec<String> {
        seen.lock().unwrap().iter().map(|s| s.0.clone()).collect()
    }

    fn idle_dispatcher() -> Dispatcher {
        Dispatcher::new(GatedSource::new(Ok(json!({"items": []}))))
    }

    fn push(stream_id: &str, data: Value, timestamp: Value) -> Value {
        json!({"DataPoint": {"streamId": stream_id, "data": data, "timestamp": timestamp}})
    }

    async fn wait_until_settled(dispatcher: &Dispatcher) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.pending_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("fetch did not settle");
    }

    #[test]
    fn test_exact_then_wildcard_fan_out() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let topic = "xbee.analog/[00:13:A2:00:40:A0:44:33]!/AD1";

        let _l2 = dispatcher.listen_with("!", topic, recorder(&seen, "L2"));
        let _l1 = dispatcher.listen_with("D", topic, recorder(&seen, "L1"));

        let delivery = dispatcher.new_data(&push(&format!("D/{}", topic), json!(3), json!(10)));

        assert_eq!(delivery, Delivery::Delivered(2));
        assert_eq!(names(&seen), vec!["L1", "L2"]);
    }

    #[test]
    fn test_wildcard_qualifier_listener_receives_push() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let _sub = dispatcher.listen_with("dev1", "xbee.analog/[!]/AD1", recorder(&seen, "w"));

        let delivery = dispatcher.new_data(&push(
            "dev1/xbee.analog/[addrX]/AD1",
            json!(512),
            json!("1404150843000"),
        ));

        assert_eq!(delivery, Delivery::Delivered(1));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (_, point, device, topic) = &seen[0];
        assert_eq!(*point, DataPoint::new(512i64, 1404150843000));
        assert_eq!(device, "dev1");
        assert_eq!(topic, "xbee.analog/[addrX]/AD1");
    }

    #[test]
    fn test_listener_gets_raw_message() {
        let dispatcher = idle_dispatcher();
        let raw_seen: Arc<Mutex<Option<Value>>> = Arc::default();
        let sink = Arc::clone(&raw_seen);
        let _sub = dispatcher.listen("dev1", "t1", move |_, raw, _, _| {
            *sink.lock().unwrap() = Some(raw.clone());
        });

        let message = json!({"DataPoint": {"streamId": "dev1/t1", "data": 1, "timestamp": 2, "quality": 99}});
        dispatcher.new_data(&message);

        assert_eq!(raw_seen.lock().unwrap().as_ref(), Some(&message));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let mut sub = dispatcher.listen_with("dev1", "t1", recorder(&seen, "a"));

        sub.release();
        sub.release();
        assert!(sub.is_released());

        dispatcher.new_data(&push("dev1/t1", json!(1), json!(1)));
        assert!(seen.lock().unwrap().is_empty());
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn test_drop_releases_and_detach_keeps() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();

        {
            let _scoped = dispatcher.listen_with("dev1", "t1", recorder(&seen, "scoped"));
        }
        dispatcher
            .listen_with("dev1", "t1", recorder(&seen, "detached"))
            .detach();

        dispatcher.new_data(&push("dev1/t1", json!(1), json!(1)));
        assert_eq!(names(&seen), vec!["detached"]);
    }

    #[test]
    fn test_release_after_clear_is_noop() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let mut old = dispatcher.listen_with("dev1", "t1", recorder(&seen, "old"));

        dispatcher.clear();
        let _fresh = dispatcher.listen_with("dev1", "t1", recorder(&seen, "fresh"));

        old.release();
        dispatcher.new_data(&push("dev1/t1", json!(1), json!(1)));
        assert_eq!(names(&seen), vec!["fresh"]);
    }

    #[test]
    fn test_release_after_dispatcher_dropped() {
        let dispatcher = idle_dispatcher();
        let mut sub = dispatcher.listen("dev1", "t1", |_, _, _, _| {});
        drop(dispatcher);
        sub.release();
        assert!(sub.is_released());
    }

    #[test]
    fn test_mount_unmount_cycles_leave_no_residue() {
        let dispatcher = idle_dispatcher();
        for _ in 0..50 {
            let subs: Vec<_> = (0..4)
                .map(|_| dispatcher.listen("dev1", "xbee.digitalIn/[!]/DIO0", |_, _, _, _| {}))
                .collect();
            assert_eq!(dispatcher.listener_count(), 4);
            drop(subs);
        }
        assert_eq!(dispatcher.listener_count(), 0);
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn test_malformed_messages_are_dropped() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let _sub = dispatcher.listen_with("!", "t1", recorder(&seen, "any"));

        assert_eq!(dispatcher.new_data(&json!({"DataPoint": {"data": 1, "timestamp": 1}})), Delivery::Dropped);
        assert_eq!(dispatcher.new_data(&push("no-topic", json!(1), json!(1))), Delivery::Dropped);
        assert_eq!(dispatcher.new_data(&push("dev1/t1", json!(1), json!("aa"))), Delivery::Dropped);
        assert_eq!(dispatcher.new_data(&push("dev1/t1", json!(null), json!(1))), Delivery::Dropped);
        assert_eq!(dispatcher.new_data(&json!("not an object")), Delivery::Dropped);
        assert!(seen.lock().unwrap().is_empty());

        // Bare data point without wrapper is accepted
        let bare = json!({"streamId": "dev1/t1", "data": 4, "timestamp": 112});
        assert_eq!(dispatcher.new_data(&bare), Delivery::Delivered(1));
    }

    #[test]
    fn test_listener_may_release_during_delivery() {
        let dispatcher = idle_dispatcher();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let slot_in = Arc::clone(&slot);
        let hits_in = Arc::clone(&hits);
        let sub = dispatcher.listen("dev1", "t1", move |_, _, _, _| {
            hits_in.fetch_add(1, Ordering::SeqCst);
            if let Some(mut sub) = slot_in.lock().unwrap().take() {
                sub.release();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        dispatcher.new_data(&push("dev1/t1", json!(1), json!(1)));
        dispatcher.new_data(&push("dev1/t1", json!(2), json!(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_backfill_issues_one_fetch() {
        let source = GatedSource::new(Ok(json!({"items": [{"value": 5, "timestamp": 100}]})));
        let dispatcher = Dispatcher::new(source.clone());
        let seen: Seen = Arc::default();
        let _w1 = dispatcher.listen_with("dev1", "t1", recorder(&seen, "w1"));
        let _w2 = dispatcher.listen_with("dev1", "t1", recorder(&seen, "w2"));

        let (r1, r2, _) = tokio::join!(
            dispatcher.get_initial_data("dev1", "t1"),
            dispatcher.get_initial_data("dev1", "t1"),
            async {
                assert_eq!(dispatcher.pending_waiters("dev1", "t1"), Some(2));
                source.open();
            }
        );

        let expected = Backfill::Delivered { points: 1, dropped: 0 };
        assert_eq!(r1, Ok(expected));
        assert_eq!(r2, Ok(expected));
        assert_eq!(source.calls(), 1);
        assert_eq!(names(&seen), vec!["w1", "w2"]);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|(_, point, _, _)| *point == DataPoint::new(5i64, 100)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_backfill_drops_unparseable_items() {
        let source = GatedSource::new(Ok(json!({"items": [
            {"value": 1, "timestamp": 112},
            {"value": 2, "timestamp": "aa"},
            {"currentValue": {"value": 3, "timestamp": "113"}}
        ]})));
        source.open();
        let dispatcher = Dispatcher::new(source);
        let seen: Seen = Arc::default();
        let _sub = dispatcher.listen_with("dev1", "t1", recorder(&seen, "w"));

        let result = dispatcher.get_initial_data("dev1", "t1").await;

        assert_eq!(result, Ok(Backfill::Delivered { points: 2, dropped: 1 }));
        let timestamps: Vec<i64> = seen.lock().unwrap().iter().map(|s| s.1.timestamp).collect();
        assert_eq!(timestamps, vec![112, 113]);
    }

    #[tokio::test]
    async fn test_fetch_failure_reaches_every_waiter_then_retries() {
        let failure = FetchError::Status {
            status: 503,
            message: "down".to_string(),
        };
        let source = GatedSource::new(Err(failure.clone()));
        let dispatcher = Dispatcher::new(source.clone());

        let (r1, r2, _) = tokio::join!(
            dispatcher.get_initial_data("dev1", "t1"),
            dispatcher.get_initial_data("dev1", "t1"),
            async { source.open() }
        );

        assert_eq!(r1, Err(StreamError::Fetch(failure.clone())));
        assert_eq!(r2, Err(StreamError::Fetch(failure.clone())));
        assert_eq!(source.calls(), 1);
        assert_eq!(dispatcher.pending_count(), 0);

        // Entry was cleared, so the next call issues a fresh fetch
        let r3 = dispatcher.get_initial_data("dev1", "t1").await;
        assert_eq!(r3, Err(StreamError::Fetch(failure)));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_fetch_independently() {
        let source = GatedSource::new(Ok(json!({"items": []})));
        source.open();
        let dispatcher = Dispatcher::new(source.clone());

        let (a, b) = tokio::join!(
            dispatcher.get_initial_data("dev1", "t1"),
            dispatcher.get_initial_data("dev1", "t2"),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_still_settles_and_delivers() {
        let source = GatedSource::new(Ok(json!({"items": [{"value": true, "timestamp": 7}]})));
        let dispatcher = Dispatcher::new(source.clone());

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            dispatcher.get_initial_data("dev1", "t1"),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(dispatcher.pending_count(), 1);
        assert_eq!(dispatcher.pending_waiters("dev1", "t1"), Some(0));

        // Listener registered after the caller gave up still gets the result
        let seen: Seen = Arc::default();
        let _late = dispatcher.listen_with("dev1", "t1", recorder(&seen, "late"));
        source.open();
        wait_until_settled(&dispatcher).await;

        // Delivery runs right after the entry is cleared
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("backfill was not delivered");
        assert_eq!(seen.lock().unwrap()[0].1, DataPoint::new(true, 7));
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_fetches() {
        let source = GatedSource::new(Ok(json!({"items": [{"value": 1, "timestamp": 1}]})));
        let dispatcher = Dispatcher::new(source.clone());
        let seen: Seen = Arc::default();
        let _sub = dispatcher.listen_with("dev1", "t1", recorder(&seen, "w"));

        let (result, _) = tokio::join!(dispatcher.get_initial_data("dev1", "t1"), async {
            dispatcher.clear();
        });

        assert_eq!(result, Ok(Backfill::Cancelled));
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(seen.lock().unwrap().is_empty());

        // New fetches after clear are not affected by the old token
        source.open();
        let again = dispatcher.get_initial_data("dev1", "t1").await;
        assert_eq!(again, Ok(Backfill::Delivered { points: 1, dropped: 0 }));
    }

    #[tokio::test]
    async fn test_backfill_right_after_clear_starts_fresh_fetch() {
        let source = GatedSource::new(Ok(json!({"items": [{"value": 9, "timestamp": 90}]})));
        let dispatcher = Dispatcher::new(source.clone());
        let seen: Seen = Arc::default();

        let (before, after) = tokio::join!(dispatcher.get_initial_data("dev1", "t1"), async {
            // Logout then login before the cancelled task gets to run
            dispatcher.clear();
            assert_eq!(dispatcher.pending_count(), 0);
            let _sub = dispatcher.listen_with("dev1", "t1", recorder(&seen, "fresh"));
            source.open();
            dispatcher.get_initial_data("dev1", "t1").await
        });

        assert_eq!(before, Ok(Backfill::Cancelled));
        assert_eq!(after, Ok(Backfill::Delivered { points: 1, dropped: 0 }));
        assert_eq!(names(&seen), vec!["fresh"]);
        assert_eq!(seen.lock().unwrap()[0].1, DataPoint::new(9i64, 90));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_count_follows_live_callers() {
        let source = GatedSource::new(Ok(json!({"items": []})));
        let dispatcher = Dispatcher::new(source.clone());

        let (kept, gave_up, _) = tokio::join!(
            dispatcher.get_initial_data("dev1", "t1"),
            tokio::time::timeout(Duration::from_millis(20), dispatcher.get_initial_data("dev1", "t1")),
            async {
                assert_eq!(dispatcher.pending_waiters("dev1", "t1"), Some(2));
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(dispatcher.pending_waiters("dev1", "t1"), Some(1));
                source.open();
            }
        );

        assert!(gave_up.is_err());
        assert_eq!(kept, Ok(Backfill::Delivered { points: 0, dropped: 0 }));
        assert_eq!(dispatcher.pending_waiters("dev1", "t1"), None);
    }

    /// Listener whose closure owns another listener's subscription
    fn owning_listener(dispatcher: &Dispatcher, seen: &Seen) -> Subscription {
        let child = dispatcher.listen_with("dev1", "child", recorder(seen, "child"));
        dispatcher.listen("dev1", "parent", move |_, _, _, _| {
            let _ = child.is_released();
        })
    }

    #[test]
    fn test_release_drops_listener_owning_subscription() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let mut parent = owning_listener(&dispatcher, &seen);
        assert_eq!(dispatcher.listener_count(), 2);

        parent.release();

        assert_eq!(dispatcher.listener_count(), 0);
        assert_eq!(dispatcher.new_data(&push("dev1/child", json!(1), json!(1))), Delivery::Delivered(0));
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn test_clear_drops_listener_owning_subscription() {
        let dispatcher = idle_dispatcher();
        let seen: Seen = Arc::default();
        let parent = owning_listener(&dispatcher, &seen);

        dispatcher.clear();

        assert_eq!(dispatcher.listener_count(), 0);
        assert!(dispatcher.is_idle());
        let _fresh = dispatcher.listen_with("dev1", "child", recorder(&seen, "fresh"));
        drop(parent);
        dispatcher.new_data(&push("dev1/child", json!(1), json!(1)));
        assert_eq!(names(&seen), vec!["fresh"]);
    }
}
