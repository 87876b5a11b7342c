//! # Source records and lifecycle state.
//!
//! A source is a live capture endpoint bound to a driver and a transport.
//! The tracker keeps one [`SourceStatus`] per active source; everything in
//! it serializes, so the status surface can expose the active set as JSON
//! without reaching into tracker internals.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::proto::Frame;

/// Runtime source id, monotonically assigned and never reused within a
/// process.
pub type SourceId = u64;

/// Lifecycle state of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// A probe coordinator is resolving the owning driver.
    Probing,
    /// The open handshake is in flight.
    Opening,
    /// Capturing.
    Running,
    /// Open or capture failed; the retry timer will re-open it.
    Error,
    /// Removed; terminal.
    Closed,
}

impl SourceState {
    /// Short stable label for logs and status output.
    pub fn as_label(&self) -> &'static str {
        match self {
            SourceState::Probing => "probing",
            SourceState::Opening => "opening",
            SourceState::Running => "running",
            SourceState::Error => "error",
            SourceState::Closed => "closed",
        }
    }
}

/// Snapshot of one active source, as exposed on the status surface.
#[derive(Clone, Debug, Serialize)]
pub struct SourceStatus {
    /// Runtime id, unique for the process lifetime.
    pub id: SourceId,
    /// Stable UUID; from the driver when it can derive one.
    pub uuid: Uuid,
    /// Owning driver name.
    pub driver: String,
    /// Definition the source was opened from, verbatim.
    pub definition: String,
    /// Interface component of the definition.
    pub interface: String,
    /// Whether the driver reported channel tuning capability.
    pub channel_capable: bool,
    /// Human description reported by the driver.
    pub description: String,
    /// Capture child pid, `None` for remote or native sources.
    pub pid: Option<u32>,
    /// Current lifecycle state.
    pub state: SourceState,
    /// Most recent error message, if the source has ever failed.
    pub last_error: Option<String>,
    /// Seconds until the next re-open attempt, when in error state.
    pub retry_in: Option<u64>,
}

/// Payload published on the bus for every source state transition.
#[derive(Clone, Debug, Serialize)]
pub struct SourceEvent {
    /// Runtime id of the source.
    pub source_id: SourceId,
    /// UUID of the source.
    pub uuid: Uuid,
    /// Human-readable transition detail.
    pub message: String,
}

/// Downstream consumer of decoded capture frames.
///
/// The packet-ingest pipeline sits behind this seam; the tracker hands it
/// every `DATA` frame (and any unrecognized frame type) from running
/// sources.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Called for each decoded frame from the given source.
    async fn on_frame(&self, source: SourceId, frame: Frame);
}

/// Sink that discards everything; the default when no ingest pipeline is
/// attached.
pub struct NullSink;

#[async_trait]
impl PacketSink for NullSink {
    async fn on_frame(&self, _source: SourceId, _frame: Frame) {}
}
