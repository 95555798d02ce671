//! Output lanes of the localizer.
//!
//! Each [`Topic`] owns one [`tokio::sync::broadcast`] channel.  The scan
//! cycle publishes and moves on; a consumer that falls behind loses the
//! oldest events (`RecvError::Lagged`) instead of stalling registration.
//!
//! | Topic | Carries | When |
//! |---|---|---|
//! | [`Topic::Pose`] | map-frame pose | converged cycles |
//! | [`Topic::Transforms`] | map → body transform | converged cycles |
//! | [`Topic::AlignedPoints`] | scan in the map frame | every cycle |
//! | [`Topic::Metrics`] | alignment metrics | every cycle |
//! | [`Topic::Diagnostics`] | health report | fixed rate |
//!
//! ```rust
//! use scanloc_middleware::{EventBus, Topic};
//!
//! let bus = EventBus::default();
//! let rx = bus.subscribe_to(Topic::Metrics);
//! assert_eq!(bus.subscriber_count(Topic::Metrics), 1);
//! # drop(rx);
//! ```

use scanloc_types::{Event, EventPayload, LocError};
use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per lane before slow receivers start lagging.
pub const DEFAULT_CAPACITY: usize = 256;

const LANE_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Pose,
    Transforms,
    AlignedPoints,
    Metrics,
    Diagnostics,
}

impl Topic {
    pub const ALL: [Topic; LANE_COUNT] = [
        Topic::Pose,
        Topic::Transforms,
        Topic::AlignedPoints,
        Topic::Metrics,
        Topic::Diagnostics,
    ];

    /// The lane a payload travels on.
    pub fn of(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::Pose(_) => Topic::Pose,
            EventPayload::Transform(_) => Topic::Transforms,
            EventPayload::AlignedPoints(_) => Topic::AlignedPoints,
            EventPayload::Metrics(_) => Topic::Metrics,
            EventPayload::Diagnostics(_) => Topic::Diagnostics,
        }
    }

    fn lane(self) -> usize {
        self as usize
    }
}

/// Cloneable handle; clones publish into the same lanes.
#[derive(Clone, Debug)]
pub struct EventBus {
    lanes: [broadcast::Sender<Event>; LANE_COUNT],
}

impl EventBus {
    /// `capacity` is applied to each lane separately.
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Topic::ALL.map(|_| broadcast::channel(capacity).0),
        }
    }

    /// Send on an explicit lane.
    ///
    /// `Ok(n)` is the number of receivers handed the event;
    /// [`LocError::Channel`] means the lane has no receivers.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, LocError> {
        self.lanes[topic.lane()]
            .send(event)
            .map_err(|_| LocError::Channel(format!("no receivers on {topic:?}")))
    }

    /// Send on the lane matching the payload.
    pub fn publish(&self, event: Event) -> Result<usize, LocError> {
        self.publish_to(Topic::of(&event.payload), event)
    }

    /// Like [`publish`](Self::publish), but an empty lane just yields `0`.
    pub fn emit(&self, event: Event) -> usize {
        let topic = Topic::of(&event.payload);
        self.publish_to(topic, event).unwrap_or_else(|_| {
            trace!(?topic, "no receivers, event dropped");
            0
        })
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            inner: self.lanes[topic.lane()].subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lanes[topic.lane()].receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiving side
// ─────────────────────────────────────────────────────────────────────────────

/// Receiver for one lane, from [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: Topic,
    inner: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// `Lagged(n)` reports `n` events lost to overflow; `Closed` means every
    /// bus handle is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.inner.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.inner.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
