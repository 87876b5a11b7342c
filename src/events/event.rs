//! # Events carried by the bus.
//!
//! An [`Event`] is an immutable record: a numeric **event id** shared by all
//! events of the same type name, the **channel** (the type name itself), and
//! an optional opaque payload. Producers build events through
//! [`EventBus::make_event`](crate::events::EventBus::make_event), which
//! assigns the event id, attach a payload, and publish; subscribers downcast
//! the payload back to the concrete type they expect.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically at creation time. Delivery order on the bus is enqueue
//! order; `seq` lets consumers re-establish creation order if they ever
//! buffer events themselves.
//!
//! ## Example
//! ```
//! use wavecap::events::EventBus;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let ev = bus.make_event("SOURCE_OPENED").with_payload(7u32);
//! assert_eq!(ev.channel(), "SOURCE_OPENED");
//! assert_eq!(ev.payload_as::<u32>(), Some(&7));
//! # bus.shutdown().await;
//! # }
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Immutable event record delivered to subscribers.
///
/// Cloning is cheap: the payload is reference-counted and never mutated
/// after publication.
#[derive(Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// Numeric id assigned to this event's type name at first registration.
    event_id: u32,
    /// Channel / type name.
    channel: Arc<str>,
    /// Opaque typed payload, if any.
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Event {
    /// Creates an event shell. Called by the bus, which owns the
    /// type-name-to-id registry.
    pub(crate) fn new(event_id: u32, channel: Arc<str>) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            event_id,
            channel,
            payload: None,
        }
    }

    /// The numeric id shared by every event of this type name.
    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    /// The channel (type name) this event is published on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Attaches an opaque typed payload.
    #[must_use]
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Downcasts the payload to a concrete type.
    ///
    /// Returns `None` when no payload is attached or the type does not match.
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// True if any payload is attached.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("seq", &self.seq)
            .field("event_id", &self.event_id)
            .field("channel", &self.channel)
            .field("payload", &self.payload.as_ref().map(|_| "<opaque>"))
            .finish()
    }
}
