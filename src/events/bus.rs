//! # Event bus: FIFO dispatch to registered listeners.
//!
//! [`EventBus`] decouples producers from any number of subscribers. Events
//! are enqueued in publish order onto a single queue; one background
//! dispatcher task pops them and invokes every matching handler.
//!
//! ## Architecture
//! ```text
//! publish(ev) ──► [bounded FIFO queue] ──► dispatcher task
//!                                              │
//!                                              ├─► listeners on ev.channel()  (registration order)
//!                                              └─► listeners on "*"           (registration order)
//! ```
//!
//! ## Rules
//! - `publish` never blocks; if the queue is full the event is dropped with
//!   a warning (the system operates without observers).
//! - Per-subscription delivery order equals publish order: there is exactly
//!   one dispatcher.
//! - A subscription matching both its own channel and `"*"` receives each
//!   event **once**.
//! - Handler panics are caught and logged; siblings are unaffected.
//! - Handlers may call [`register_listener`](EventBus::register_listener) /
//!   [`remove_listener`](EventBus::remove_listener) re-entrantly, including
//!   on their own id; removal from inside a handler takes effect at the
//!   next dispatch.
//! - Events published after [`shutdown`](EventBus::shutdown) begins are
//!   silently dropped.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::Event;

/// Identifier returned by listener registration; unique and strictly
/// increasing for the lifetime of the bus, starting at 1.
pub type ListenerId = u64;

/// Handler invoked by the dispatcher for each matching event.
pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

/// Channel name that matches every event.
pub const ALL_CHANNELS: &str = "*";

struct Listener {
    id: ListenerId,
    channels: Vec<String>,
    /// Tombstone: set by `remove_listener` so a dispatch snapshotted before
    /// the removal does not start a delivery after it.
    removed: AtomicBool,
    handler: EventHandler,
}

#[derive(Default)]
struct HandlerTable {
    /// Per-channel subscription index, in registration order.
    channels: HashMap<String, Vec<Arc<Listener>>>,
    /// Per-id index; joint owner of each listener with its channel entries.
    by_id: HashMap<ListenerId, Arc<Listener>>,
}

#[derive(Default)]
struct TypeTable {
    ids: HashMap<String, u32>,
    interned: HashMap<String, Arc<str>>,
    next_id: u32,
}

/// In-process publish/subscribe broker with FIFO dispatch.
pub struct EventBus {
    table: Arc<Mutex<HandlerTable>>,
    types: Mutex<TypeTable>,
    next_listener: AtomicU64,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Creates the bus and spawns its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let table: Arc<Mutex<HandlerTable>> = Arc::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Self::dispatch_loop(
            rx,
            Arc::clone(&table),
            cancel.clone(),
        ));

        Self {
            table,
            types: Mutex::new(TypeTable::default()),
            next_listener: AtomicU64::new(1),
            tx,
            cancel,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Allocates an event shell for the given type name, registering the
    /// name and assigning its numeric event id on first use.
    pub fn make_event(&self, channel: &str) -> Event {
        let mut types = self.types.lock().expect("event type table poisoned");
        let id = match types.ids.get(channel) {
            Some(id) => *id,
            None => {
                types.next_id += 1;
                let id = types.next_id;
                types.ids.insert(channel.to_string(), id);
                id
            }
        };
        let interned = types
            .interned
            .entry(channel.to_string())
            .or_insert_with(|| Arc::from(channel))
            .clone();
        Event::new(id, interned)
    }

    /// Enqueues an event for dispatch. Never blocks.
    ///
    /// Dropped silently after shutdown; dropped with a warning if the queue
    /// is full.
    pub fn publish(&self, event: Event) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                tracing::warn!(channel = ev.channel(), seq = ev.seq, "event bus queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Registers a handler on one channel. `"*"` subscribes to every event.
    ///
    /// Returns a unique, strictly increasing [`ListenerId`].
    pub fn register_listener(
        &self,
        channel: &str,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.register_listener_multi(&[channel], handler)
    }

    /// Registers a handler on several channels at once; the subscription is
    /// installed into every channel index and the id index atomically.
    pub fn register_listener_multi(
        &self,
        channels: &[&str],
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_listener.fetch_add(1, AtomicOrdering::Relaxed);
        let listener = Arc::new(Listener {
            id,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            removed: AtomicBool::new(false),
            handler: Box::new(handler),
        });

        let mut table = self.table.lock().expect("handler table poisoned");
        for channel in &listener.channels {
            table
                .channels
                .entry(channel.clone())
                .or_default()
                .push(Arc::clone(&listener));
        }
        table.by_id.insert(id, listener);
        id
    }

    /// Removes a subscription from every index it appears in.
    ///
    /// Unknown ids are a no-op. Once this returns, no further delivery to
    /// the handler starts (a delivery already in progress completes).
    pub fn remove_listener(&self, id: ListenerId) {
        let mut table = self.table.lock().expect("handler table poisoned");
        let Some(listener) = table.by_id.remove(&id) else {
            return;
        };
        listener.removed.store(true, AtomicOrdering::Release);
        for channel in &listener.channels {
            if let Some(list) = table.channels.get_mut(channel) {
                list.retain(|l| l.id != id);
                if list.is_empty() {
                    table.channels.remove(channel);
                }
            }
        }
    }

    /// Stops the dispatcher and drops any queued events.
    ///
    /// Idempotent; publishes racing with shutdown are dropped silently.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher handle poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn dispatch_loop(
        mut rx: mpsc::Receiver<Event>,
        table: Arc<Mutex<HandlerTable>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => Self::dispatch_one(&table, &ev),
                    None => break,
                },
            }
        }
    }

    /// Delivers one event: channel subscribers first, then `"*"`, each in
    /// registration order, at most once per subscription.
    fn dispatch_one(table: &Mutex<HandlerTable>, event: &Event) {
        let targets: Vec<Arc<Listener>> = {
            let table = table.lock().expect("handler table poisoned");
            let mut seen = HashSet::new();
            let mut targets = Vec::new();
            for key in [event.channel(), ALL_CHANNELS] {
                if let Some(list) = table.channels.get(key) {
                    for listener in list {
                        if seen.insert(listener.id) {
                            targets.push(Arc::clone(listener));
                        }
                    }
                }
            }
            targets
        };

        for listener in targets {
            if listener.removed.load(AtomicOrdering::Acquire) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (listener.handler)(event)));
            if result.is_err() {
                tracing::warn!(
                    listener = listener.id,
                    channel = event.channel(),
                    "event handler panicked; subscription continues"
                );
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{timeout, Duration};

    async fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let item = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("delivery timed out")
                .expect("channel closed");
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn fan_out_in_registration_order() {
        let bus = EventBus::new(64);
        let (tx, mut rx) = unbounded_channel();

        let tx_a = tx.clone();
        bus.register_listener("x", move |ev| {
            let _ = tx_a.send(("a", *ev.payload_as::<i32>().unwrap()));
        });
        let tx_b = tx.clone();
        bus.register_listener("x", move |ev| {
            let _ = tx_b.send(("b", *ev.payload_as::<i32>().unwrap()));
        });
        let tx_c = tx.clone();
        bus.register_listener(ALL_CHANNELS, move |ev| {
            let _ = tx_c.send(("c", *ev.payload_as::<i32>().unwrap()));
        });

        bus.publish(bus.make_event("x").with_payload(7i32));

        let got = drain(&mut rx, 3).await;
        assert_eq!(got, vec![("a", 7), ("b", 7), ("c", 7)]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn listener_ids_strictly_increase() {
        let bus = EventBus::new(8);
        let a = bus.register_listener("x", |_| {});
        let b = bus.register_listener("y", |_| {});
        let c = bus.register_listener_multi(&["x", "y"], |_| {});
        assert!(a >= 1);
        assert!(b > a);
        assert!(c > b);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn removal_stops_delivery_and_is_idempotent() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = unbounded_channel();

        let tx_a = tx.clone();
        let id = bus.register_listener("x", move |_| {
            let _ = tx_a.send("a");
        });
        bus.remove_listener(id);
        bus.remove_listener(id);

        // A sentinel on another listener proves the event went through.
        let tx_s = tx.clone();
        bus.register_listener("x", move |_| {
            let _ = tx_s.send("sentinel");
        });

        bus.publish(bus.make_event("x"));
        assert_eq!(drain(&mut rx, 1).await, vec!["sentinel"]);
        assert!(rx.try_recv().is_err());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn overlapping_channel_and_wildcard_delivers_once() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = unbounded_channel();

        bus.register_listener_multi(&["x", ALL_CHANNELS], move |ev| {
            let _ = tx.send(ev.seq);
        });

        bus.publish(bus.make_event("x"));
        bus.publish(bus.make_event("y"));

        let got = drain(&mut rx, 2).await;
        assert!(got[1] > got[0]);
        assert!(rx.try_recv().is_err());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn per_subscription_order_matches_publish_order() {
        let bus = EventBus::new(64);
        let (tx, mut rx) = unbounded_channel();

        bus.register_listener("x", move |ev| {
            let _ = tx.send(*ev.payload_as::<i32>().unwrap());
        });
        for i in 0..20 {
            bus.publish(bus.make_event("x").with_payload(i));
        }

        let got = drain(&mut rx, 20).await;
        assert_eq!(got, (0..20).collect::<Vec<_>>());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stall_siblings() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = unbounded_channel();

        bus.register_listener("x", |_| panic!("boom"));
        bus.register_listener("x", move |_| {
            let _ = tx.send("survivor");
        });

        bus.publish(bus.make_event("x"));
        assert_eq!(drain(&mut rx, 1).await, vec!["survivor"]);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn event_ids_stable_per_type_name() {
        let bus = EventBus::new(8);
        let a = bus.make_event("alpha");
        let b = bus.make_event("beta");
        let a2 = bus.make_event("alpha");
        assert_eq!(a.event_id(), a2.event_id());
        assert_ne!(a.event_id(), b.event_id());
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_dropped() {
        let bus = EventBus::new(8);
        let (tx, mut rx) = unbounded_channel();
        bus.register_listener("x", move |_| {
            let _ = tx.send(());
        });
        bus.shutdown().await;
        bus.publish(bus.make_event("x"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handler_may_remove_other_listener_reentrantly() {
        let bus = Arc::new(EventBus::new(8));
        let (tx, mut rx) = unbounded_channel();

        let tx_b = tx.clone();
        let victim = bus.register_listener("x", move |_| {
            let _ = tx_b.send("victim");
        });

        // Registered after the victim, so the victim still sees the first
        // event; the second event must not reach it.
        let bus2 = Arc::clone(&bus);
        bus.register_listener("x", move |_| {
            bus2.remove_listener(victim);
        });

        bus.publish(bus.make_event("x"));
        assert_eq!(drain(&mut rx, 1).await, vec!["victim"]);
        bus.publish(bus.make_event("x"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        bus.shutdown().await;
    }
}
