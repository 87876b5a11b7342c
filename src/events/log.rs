//! # LogListener — mirror bus events into the log.
//!
//! A convenience subscriber that renders every bus event through `tracing`.
//! Source lifecycle payloads get a structured line; anything else is logged
//! at debug level with its channel and sequence number.
//!
//! ## Example output
//! ```text
//! INFO source event channel="SOURCE_OPENED" source=3 uuid=5b2c... message="wlan0 running"
//! INFO source event channel="SOURCE_ERROR" source=3 uuid=5b2c... message="transport closed: eof"
//! ```

use crate::source::SourceEvent;

use super::bus::{EventBus, ListenerId, ALL_CHANNELS};

/// Wildcard subscriber that writes events to the log.
pub struct LogListener;

impl LogListener {
    /// Registers the listener on `"*"` and returns its id so the caller can
    /// detach it later.
    pub fn attach(bus: &EventBus) -> ListenerId {
        bus.register_listener(ALL_CHANNELS, |ev| match ev.payload_as::<SourceEvent>() {
            Some(src) => {
                tracing::info!(
                    channel = ev.channel(),
                    source = src.source_id,
                    uuid = %src.uuid,
                    message = %src.message,
                    "source event"
                );
            }
            None => {
                tracing::debug!(channel = ev.channel(), seq = ev.seq, "event");
            }
        })
    }
}
