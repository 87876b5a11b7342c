//! # Capture sources: definitions, transports, lifecycle records.
//!
//! - [`SourceDefinition`] — lossless parse of the `interface:k=v,...`
//!   grammar.
//! - [`Transport`] / [`Connect`] / [`SourceLink`] — framed streams to
//!   capture engines and the child-spawn seam.
//! - [`SourceStatus`] / [`SourceState`] / [`SourceEvent`] — what the
//!   tracker knows about each active source and publishes on transitions.
//! - [`PacketSink`] — interface to the downstream packet-ingest pipeline.

mod definition;
mod source;
mod transport;

pub use definition::SourceDefinition;
pub use source::{NullSink, PacketSink, SourceEvent, SourceId, SourceState, SourceStatus};
pub use transport::{
    ChildGuard, Connect, FrameReader, FrameWriter, IpcConnector, SourceLink, Transport,
};
