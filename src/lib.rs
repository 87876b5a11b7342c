//! # wavecap
//!
//! **wavecap** is the capture-management core of a wireless capture server:
//! it probes, opens, and supervises packet-capture drivers speaking a framed
//! key/value protocol over child-process or TCP transports, and broadcasts
//! their lifecycle over an in-process event bus.
//!
//! ## Features
//!
//! | Area              | Description                                                      | Key types / traits                          |
//! |-------------------|------------------------------------------------------------------|---------------------------------------------|
//! | **Event bus**     | FIFO publish/subscribe with a single dispatcher.                 | [`EventBus`], [`Event`]                     |
//! | **Protocol**      | Framed key/value wire format, crc-checked.                       | [`Frame`](proto::Frame), [`proto::FrameCodec`] |
//! | **Drivers**       | Immutable descriptors that probe, list, and connect.             | [`DriverBuilder`], [`DriverRegistry`]       |
//! | **Coordinators**  | First-wins probe race, aggregate interface listing.              | [`ProbeCoordinator`], [`ListCoordinator`]   |
//! | **Supervision**   | Active source set, error state, capped-backoff retry.            | [`SourceTracker`], [`RetryPolicy`]          |
//! | **Errors**        | One tagged error type across the whole runtime.                  | [`CaptureError`]                            |
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use wavecap::source::{Connect, NullSink};
//! use wavecap::testing::{Script, ScriptedConnector};
//! use wavecap::{Config, DriverBuilder, DriverRegistry, EventBus, SourceTracker};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let bus = Arc::new(EventBus::new(256));
//!     let registry = Arc::new(DriverRegistry::new());
//!     registry.register(DriverBuilder::new(
//!         "pcap",
//!         ScriptedConnector::new("pcap", Script::default()) as Arc<dyn Connect>,
//!     ));
//!
//!     let tracker = SourceTracker::new(
//!         Config::default(),
//!         Arc::clone(&bus),
//!         registry,
//!         Arc::new(NullSink),
//!     );
//!
//!     let id = tracker.open_source("wlan0", None).await.unwrap();
//!     assert_eq!(tracker.list_sources().await.len(), 1);
//!
//!     tracker.remove_source(id).await;
//!     tracker.shutdown().await;
//!     bus.shutdown().await;
//! }
//! ```
//!
//! Real deployments register drivers backed by
//! [`IpcConnector`](source::IpcConnector) (capture child processes over
//! stdio) and feed decoded frames into their ingest pipeline through
//! [`PacketSink`](source::PacketSink); the [`testing`] module provides
//! scripted in-memory engines instead.

mod config;
mod error;

pub mod coordinators;
pub mod drivers;
pub mod events;
pub mod proto;
pub mod source;
pub mod testing;
pub mod tracker;

// ---- Public re-exports ----

pub use config::Config;
pub use coordinators::{ListCoordinator, ProbeCoordinator};
pub use drivers::{DriverBuilder, DriverRegistry};
pub use error::CaptureError;
pub use events::{Event, EventBus, ListenerId};
pub use source::{SourceDefinition, SourceId, SourceState, SourceStatus};
pub use tracker::{
    RetryPolicy, SourceRef, SourceTracker, SourceWorker, SOURCE_CLOSED, SOURCE_ERROR,
    SOURCE_MESSAGE, SOURCE_OPENED,
};
