//! # Framed key/value capture protocol.
//!
//! - [`Frame`] / [`KeyedObject`] — one protocol message and its parts.
//! - [`FrameCodec`] — length-prefixed, crc-checked wire framing.
//! - Typed payloads ([`Hello`], [`ProbeRequest`], [`OpenReply`], ...) for
//!   the recognized frame types.

mod codec;
mod frame;

pub use codec::{FrameCodec, FRAME_MAGIC, MAX_PAYLOAD};
pub use frame::{
    frame_types, ChannelSet, ErrorReport, Frame, FramePayload, Hello, InterfaceEntry, KeyedObject,
    ListReply, ListRequest, OpenReply, OpenRequest, ProbeReply, ProbeRequest, TextMessage,
};
