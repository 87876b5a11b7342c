//! # Event subsystem.
//!
//! - [`Event`] — immutable typed record with a per-type-name numeric id.
//! - [`EventBus`] — FIFO publish/subscribe broker with a single dispatcher.
//! - [`LogListener`] — wildcard subscriber that mirrors events to the log.

mod bus;
mod event;
mod log;

pub use bus::{EventBus, EventHandler, ListenerId, ALL_CHANNELS};
pub use event::Event;
pub use log::LogListener;
