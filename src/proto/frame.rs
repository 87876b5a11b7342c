//! # Capture protocol frames.
//!
//! One frame is a type string plus an ordered sequence of keyed objects.
//! Each keyed object carries a self-describing JSON dictionary, so fields
//! can be added over time without breaking older peers; unknown keys inside
//! a known frame type are ignored.
//!
//! The typed payload structs ([`Hello`], [`ProbeRequest`], ...) pair each
//! frame type with the conventional object key it travels under, via the
//! [`FramePayload`] trait. [`Frame::compose`] and [`Frame::payload`] move
//! between the typed and the wire representation.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CaptureError;

/// Recognized frame type strings.
pub mod frame_types {
    /// First frame on any transport; announces the driver speaking.
    pub const HELLO: &str = "HELLO";
    /// Ask a driver whether it can handle a definition.
    pub const PROBE: &str = "PROBE";
    /// Answer to [`PROBE`].
    pub const PROBE_RESP: &str = "PROBE_RESP";
    /// Ask a driver to enumerate capturable interfaces.
    pub const LIST: &str = "LIST";
    /// Answer to [`LIST`].
    pub const LIST_RESP: &str = "LIST_RESP";
    /// Ask a driver to open a source.
    pub const OPEN: &str = "OPEN";
    /// Answer to [`OPEN`].
    pub const OPEN_RESP: &str = "OPEN_RESP";
    /// Driver-side failure on an open source.
    pub const ERROR: &str = "ERROR";
    /// Human-readable driver message.
    pub const MESSAGE: &str = "MESSAGE";
    /// Captured packet data.
    pub const DATA: &str = "DATA";
    /// Runtime re-tune of an open source (channel/frequency).
    pub const CONFIGURE: &str = "CONFIGURE";
}

/// One (key, payload) tuple inside a frame.
///
/// The payload is an opaque byte string on the wire; by convention it holds
/// a JSON dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedObject {
    /// Object key.
    pub key: String,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
}

impl KeyedObject {
    /// Serializes `value` into a keyed object.
    pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<Self, CaptureError> {
        let data = serde_json::to_vec(value).map_err(|e| CaptureError::Internal {
            reason: format!("keyed object serialization failed: {e}"),
        })?;
        Ok(Self {
            key: key.to_string(),
            data,
        })
    }

    /// Deserializes the payload dictionary.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CaptureError> {
        serde_json::from_slice(&self.data)
            .map_err(|e| CaptureError::protocol(format!("malformed '{}' object: {e}", self.key)))
    }
}

/// One protocol message: a type string plus ordered keyed objects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Overall frame type, one of [`frame_types`] for known frames.
    pub frame_type: String,
    /// Keyed objects in wire order.
    pub objects: Vec<KeyedObject>,
}

impl Frame {
    /// Creates an empty frame of the given type.
    pub fn new(frame_type: &str) -> Self {
        Self {
            frame_type: frame_type.to_string(),
            objects: Vec::new(),
        }
    }

    /// Appends a keyed object.
    #[must_use]
    pub fn with_object(mut self, object: KeyedObject) -> Self {
        self.objects.push(object);
        self
    }

    /// First object with the given key, if present.
    pub fn object(&self, key: &str) -> Option<&KeyedObject> {
        self.objects.iter().find(|o| o.key == key)
    }

    /// Builds a frame around one typed payload.
    pub fn compose<P: FramePayload + Serialize>(payload: &P) -> Result<Self, CaptureError> {
        Ok(Self::new(P::FRAME_TYPE).with_object(KeyedObject::encode(P::KEY, payload)?))
    }

    /// Extracts a typed payload, checking the frame type and locating the
    /// conventional key; other objects in the frame are ignored.
    pub fn payload<P: FramePayload + DeserializeOwned>(&self) -> Result<P, CaptureError> {
        if self.frame_type != P::FRAME_TYPE {
            return Err(CaptureError::protocol(format!(
                "expected {} frame, got {}",
                P::FRAME_TYPE,
                self.frame_type
            )));
        }
        self.object(P::KEY)
            .ok_or_else(|| {
                CaptureError::protocol(format!(
                    "{} frame missing '{}' object",
                    P::FRAME_TYPE,
                    P::KEY
                ))
            })?
            .decode()
    }
}

/// Associates a payload struct with its frame type and object key.
pub trait FramePayload {
    /// Frame type string the payload travels in.
    const FRAME_TYPE: &'static str;
    /// Conventional object key inside that frame.
    const KEY: &'static str;
}

/// First message on any transport, sent by the capture side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Driver name speaking on this transport.
    pub driver: String,
    /// Protocol revision of the capture side.
    pub version: u32,
    /// Definition the remote wants opened, for remote captures.
    #[serde(default)]
    pub definition: Option<String>,
}

impl FramePayload for Hello {
    const FRAME_TYPE: &'static str = frame_types::HELLO;
    const KEY: &'static str = "HELLO";
}

/// Can this driver handle the definition?
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    /// Transaction correlating the reply.
    pub transaction: u32,
    /// Definition under probe.
    pub definition: String,
}

impl FramePayload for ProbeRequest {
    const FRAME_TYPE: &'static str = frame_types::PROBE;
    const KEY: &'static str = "REQUEST";
}

/// Probe verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    /// Transaction of the originating request.
    pub transaction: u32,
    /// True when the driver claims the definition.
    pub accepted: bool,
    /// Optional human-readable detail.
    #[serde(default)]
    pub message: Option<String>,
}

impl FramePayload for ProbeReply {
    const FRAME_TYPE: &'static str = frame_types::PROBE_RESP;
    const KEY: &'static str = "REPLY";
}

/// Open a source for capture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Transaction correlating the reply.
    pub transaction: u32,
    /// Definition to open.
    pub definition: String,
}

impl FramePayload for OpenRequest {
    const FRAME_TYPE: &'static str = frame_types::OPEN;
    const KEY: &'static str = "REQUEST";
}

/// Result of an open attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReply {
    /// Transaction of the originating request.
    pub transaction: u32,
    /// True when the source is capturing.
    pub success: bool,
    /// Stable source UUID when the driver can derive one.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Whether the source can tune channels.
    #[serde(default)]
    pub channel_capable: bool,
    /// Human description of the opened endpoint, or the refusal reason.
    #[serde(default)]
    pub message: Option<String>,
}

impl FramePayload for OpenReply {
    const FRAME_TYPE: &'static str = frame_types::OPEN_RESP;
    const KEY: &'static str = "REPLY";
}

/// Enumerate capturable interfaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    /// Transaction correlating the reply.
    pub transaction: u32,
}

impl FramePayload for ListRequest {
    const FRAME_TYPE: &'static str = frame_types::LIST;
    const KEY: &'static str = "REQUEST";
}

/// One enumerable capture interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceEntry {
    /// Interface name as the driver sees it.
    pub interface: String,
    /// Driver that claims it; filled in by the list coordinator for native
    /// entries.
    #[serde(default)]
    pub driver: String,
    /// Driver-specific attributes (hardware, channels, ...).
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
    /// UUID of the open source currently using this interface, if any.
    #[serde(default)]
    pub in_use_uuid: Option<Uuid>,
}

/// Interfaces a driver can capture from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListReply {
    /// Transaction of the originating request.
    pub transaction: u32,
    /// Enumerated interfaces; empty when the driver sees none.
    #[serde(default)]
    pub interfaces: Vec<InterfaceEntry>,
}

impl FramePayload for ListReply {
    const FRAME_TYPE: &'static str = frame_types::LIST_RESP;
    const KEY: &'static str = "REPLY";
}

/// Driver-side failure on an open source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// What failed.
    pub message: String,
}

impl FramePayload for ErrorReport {
    const FRAME_TYPE: &'static str = frame_types::ERROR;
    const KEY: &'static str = "ERROR";
}

/// Re-tune an open, channel-capable source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet {
    /// Channel or frequency, in the driver's own notation.
    pub channel: String,
}

impl FramePayload for ChannelSet {
    const FRAME_TYPE: &'static str = frame_types::CONFIGURE;
    const KEY: &'static str = "CHANNEL";
}

/// Human-readable driver message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    /// Severity label ("info", "error", ...).
    #[serde(default)]
    pub severity: Option<String>,
    /// Message text.
    pub message: String,
}

impl FramePayload for TextMessage {
    const FRAME_TYPE: &'static str = frame_types::MESSAGE;
    const KEY: &'static str = "MESSAGE";
}
