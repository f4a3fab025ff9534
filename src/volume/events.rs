//! Volume Lifecycle Events
//!
//! Ordered stream of `{new, mod, del}` notifications for every object the
//! engine manages. Consumers see a volume's `new` before any event of its
//! replicas or nexus, and object `del`s before the owning volume's `del`.

use crate::topology::{Nexus, Replica};
use crate::volume::volume::VolumeSnapshot;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// What happened to the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Mod,
    Del,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::New => write!(f, "new"),
            EventKind::Mod => write!(f, "mod"),
            EventKind::Del => write!(f, "del"),
        }
    }
}

/// The object the event is about, captured at emission time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventObject {
    Volume(VolumeSnapshot),
    Replica(Replica),
    Nexus(Nexus),
}

impl EventObject {
    /// UUID of the volume the object belongs to
    pub fn uuid(&self) -> &str {
        match self {
            EventObject::Volume(v) => &v.uuid,
            EventObject::Replica(r) => &r.uuid,
            EventObject::Nexus(n) => &n.uuid,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            EventObject::Volume(_) => "volume",
            EventObject::Replica(_) => "replica",
            EventObject::Nexus(_) => "nexus",
        }
    }
}

/// One lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    pub kind: EventKind,
    pub object: EventObject,
}

impl VolumeEvent {
    pub fn uuid(&self) -> &str {
        self.object.uuid()
    }
}

/// Broadcast bus for lifecycle events
///
/// Slow subscribers lag rather than block emitters; emission with no
/// subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VolumeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, kind: EventKind, object: EventObject) {
        debug!(
            kind = %kind,
            object = object.kind_name(),
            uuid = object.uuid(),
            "Lifecycle event"
        );
        let _ = self.sender.send(VolumeEvent { kind, object });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ShareProtocol;

    #[test]
    fn test_event_kind_display() {
        assert_eq!(format!("{}", EventKind::New), "new");
        assert_eq!(format!("{}", EventKind::Mod), "mod");
        assert_eq!(format!("{}", EventKind::Del), "del");
    }

    #[test]
    fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        let replica = Replica {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            pool: "pool-1".into(),
            size: 100,
            thin: false,
            share: ShareProtocol::None,
            uri: "bdev:///vol-1".into(),
        };
        bus.publish(EventKind::New, EventObject::Replica(replica));

        let event = receiver.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::New);
        assert_eq!(event.uuid(), "vol-1");
        assert_eq!(event.object.kind_name(), "replica");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let replica = Replica {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            pool: "pool-1".into(),
            size: 100,
            thin: false,
            share: ShareProtocol::None,
            uri: "bdev:///vol-1".into(),
        };
        // Must not panic or error.
        bus.publish(EventKind::Del, EventObject::Replica(replica));
    }
}
