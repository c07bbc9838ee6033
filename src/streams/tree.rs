//! Topic Tree
//!
//! Maps `(device, topic)` registrations to ordered listener lists.
//!
//! ```text
//! devices ─┬─ "dev1" ── xbee.analog ─┬─ [00:13:A2:..]! ── AD1 → [L1, L2]
//!          │                         └─ [!] ────────────── AD1 → [L3]
//!          └─ any ───── xbee.analog ─── [00:13:A2:..]! ── AD1 → [L4]
//! ```
//!
//! Resolution walks the concrete child first and the `[!]` child second at
//! every qualifier segment, for the exact device first and the wildcard
//! device second. Listeners at one node keep registration order.
//!
//! The tree holds no locks; the dispatcher owns it behind a mutex.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::point::DataPoint;
use super::topic::{DeviceKey, Segment, Topic};

/// Callback invoked with `(point, raw_message, device_id, topic)`
pub type Listener = Arc<dyn Fn(&DataPoint, &Value, &str, &str) + Send + Sync>;

/// Wrap a closure as a [`Listener`]
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&DataPoint, &Value, &str, &str) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Identifies one registration in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    any_qualifier: Option<Box<Node>>,
    listeners: Vec<(ListenerId, Listener)>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.children.is_empty() && self.any_qualifier.is_none()
    }

    fn child_mut(&mut self, segment: &Segment) -> &mut Node {
        match segment {
            Segment::AnyQualifier => self.any_qualifier.get_or_insert_with(Box::default).as_mut(),
            other => self.children.entry(other.as_str().to_string()).or_default(),
        }
    }

    fn collect(&self, segments: &[Segment], out: &mut Vec<Listener>) {
        let Some((segment, rest)) = segments.split_first() else {
            out.extend(self.listeners.iter().map(|(_, l)| Arc::clone(l)));
            return;
        };

        if let Some(child) = self.children.get(segment.as_str()) {
            child.collect(rest, out);
        }
        if segment.is_qualifier() {
            if let Some(wildcard) = &self.any_qualifier {
                wildcard.collect(rest, out);
            }
        }
    }

    /// Remove one registration, pruning children left empty
    fn remove(&mut self, segments: &[Segment], id: ListenerId) -> Option<Listener> {
        let Some((segment, rest)) = segments.split_first() else {
            let index = self.listeners.iter().position(|(lid, _)| *lid == id)?;
            return Some(self.listeners.remove(index).1);
        };

        match segment {
            Segment::AnyQualifier => {
                let child = self.any_qualifier.as_deref_mut()?;
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.any_qualifier = None;
                }
                removed
            }
            other => {
                let key = other.as_str();
                let child = self.children.get_mut(key)?;
                let removed = child.remove(rest, id);
                if child.is_empty() {
                    self.children.remove(key);
                }
                removed
            }
        }
    }

    fn node_count(&self) -> usize {
        1 + self.children.values().map(Node::node_count).sum::<usize>()
            + self.any_qualifier.as_ref().map_or(0, |n| n.node_count())
    }
}

/// Hierarchical registry of stream listeners
#[derive(Default)]
pub struct TopicTree {
    devices: HashMap<String, Node>,
    any_device: Node,
    next_id: u64,
    listener_count: usize,
}

impl TopicTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener under the exact `(device, topic)` key
    ///
    /// Registering the same callback twice creates two registrations.
    pub fn register(&mut self, device: &DeviceKey, topic: &Topic, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let mut node = match device {
            DeviceKey::Device(device_id) => self.devices.entry(device_id.clone()).or_default(),
            DeviceKey::Any => &mut self.any_device,
        };
        for segment in topic.segments() {
            node = node.child_mut(segment);
        }
        node.listeners.push((id, listener));
        self.listener_count += 1;

        id
    }

    /// Every listener matching a delivery to `(device_id, topic)`
    ///
    /// Exact device before wildcard device; within each, the concrete path
    /// before `[!]` paths; registration order at each node.
    pub fn resolve(&self, device_id: &str, topic: &Topic) -> Vec<Listener> {
        let mut out = Vec::new();
        if let Some(root) = self.devices.get(device_id) {
            root.collect(topic.segments(), &mut out);
        }
        self.any_device.collect(topic.segments(), &mut out);
        out
    }

    /// Remove one registration, handing back its listener
    ///
    /// Returns `None` if it was already gone. The caller decides where the
    /// listener is dropped, which matters when it owns a handle that locks
    /// this tree again.
    pub fn release(&mut self, device: &DeviceKey, topic: &Topic, id: ListenerId) -> Option<Listener> {
        let removed = match device {
            DeviceKey::Device(device_id) => {
                let root = self.devices.get_mut(device_id)?;
                let removed = root.remove(topic.segments(), id);
                if root.is_empty() {
                    self.devices.remove(device_id);
                }
                removed
            }
            DeviceKey::Any => self.any_device.remove(topic.segments(), id),
        };

        if removed.is_some() {
            self.listener_count -= 1;
        }
        removed
    }

    /// Move every registration out into a detached tree
    ///
    /// Ids keep counting up, so handles to the old registrations never match
    /// new ones.
    pub fn take(&mut self) -> TopicTree {
        let next_id = self.next_id;
        let old = std::mem::take(self);
        self.next_id = next_id;
        old
    }

    /// Drop every registration
    pub fn clear(&mut self) {
        drop(self.take());
    }

    pub fn listener_count(&self) -> usize {
        self.listener_count
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.any_device.is_empty()
    }

    /// Number of interior and leaf nodes below the device level
    pub fn node_count(&self) -> usize {
        let below = |root: &Node| root.node_count() - 1;
        self.devices.values().map(below).sum::<usize>() + below(&self.any_device)
    }

    /// Device ids with at least one registration (wildcard excluded)
    pub fn devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}

impl fmt::Debug for TopicTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicTree")
            .field("devices", &self.devices.len())
            .field("listeners", &self.listener_count)
            .finish()
    }
}
