//! # Wire codec for capture frames.
//!
//! [`FrameCodec`] frames [`Frame`]s onto a byte stream:
//!
//! ```text
//! MAGIC       u32 BE  = 0xDEC0DE42
//! type_len    u16 BE
//! type        bytes[type_len]
//! nkv         u32 BE
//! payload_len u32 BE
//! payload     bytes[payload_len]
//!     repeated nkv times:
//!         key_len  u16 BE
//!         key      bytes[key_len]
//!         obj_size u32 BE
//!         obj      bytes[obj_size]
//! crc32       u32 BE  over type..payload (IEEE)
//! ```
//!
//! Decoding is lazy and restartable: partial frames stay buffered in the
//! `BytesMut` until the remaining bytes arrive. Any structural violation
//! (bad magic, crc mismatch, truncated key/value region, oversize frame)
//! is a [`CaptureError::ProtocolViolation`]; the owner of the transport is
//! expected to close it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CaptureError;

use super::frame::{Frame, KeyedObject};

/// Frame preamble.
pub const FRAME_MAGIC: u32 = 0xDEC0_DE42;

/// Upper bound on a single frame's payload; larger declarations are treated
/// as protocol violations rather than allocation requests.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

// magic + type_len
const HEAD: usize = 6;
// nkv + payload_len
const COUNTS: usize = 8;
const TRAILER: usize = 4;

/// Codec for framed capture messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a codec.
    pub fn new() -> Self {
        Self
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CaptureError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CaptureError> {
        if src.len() < HEAD {
            return Ok(None);
        }

        let magic = be_u32(&src[0..4]);
        if magic != FRAME_MAGIC {
            return Err(CaptureError::protocol(format!(
                "bad frame magic {magic:#010x}"
            )));
        }
        let type_len = be_u16(&src[4..6]) as usize;

        if src.len() < HEAD + type_len + COUNTS {
            src.reserve(HEAD + type_len + COUNTS - src.len());
            return Ok(None);
        }

        let nkv_at = HEAD + type_len;
        let nkv = be_u32(&src[nkv_at..nkv_at + 4]);
        let payload_len = be_u32(&src[nkv_at + 4..nkv_at + 8]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(CaptureError::protocol(format!(
                "declared payload of {payload_len} bytes exceeds limit"
            )));
        }

        let total = HEAD + type_len + COUNTS + payload_len + TRAILER;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let crc_at = total - TRAILER;
        let declared_crc = be_u32(&src[crc_at..total]);
        let computed_crc = crc32fast::hash(&src[HEAD..crc_at]);
        if declared_crc != computed_crc {
            return Err(CaptureError::protocol(format!(
                "frame crc mismatch: declared {declared_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }

        let frame_type = std::str::from_utf8(&src[HEAD..HEAD + type_len])
            .map_err(|_| CaptureError::protocol("frame type is not valid utf-8"))?
            .to_string();

        let payload = &src[nkv_at + COUNTS..crc_at];
        let objects = decode_objects(payload, nkv)?;

        src.advance(total);
        Ok(Some(Frame {
            frame_type,
            objects,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CaptureError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CaptureError> {
        if frame.frame_type.len() > u16::MAX as usize {
            return Err(CaptureError::Internal {
                reason: "frame type string too long".into(),
            });
        }

        let payload_len: usize = frame
            .objects
            .iter()
            .map(|o| 2 + o.key.len() + 4 + o.data.len())
            .sum();
        if payload_len > MAX_PAYLOAD {
            return Err(CaptureError::Internal {
                reason: format!("frame payload of {payload_len} bytes exceeds limit"),
            });
        }

        let type_len = frame.frame_type.len();
        dst.reserve(HEAD + type_len + COUNTS + payload_len + TRAILER);

        let start = dst.len();
        dst.put_u32(FRAME_MAGIC);
        dst.put_u16(type_len as u16);
        dst.put_slice(frame.frame_type.as_bytes());
        dst.put_u32(frame.objects.len() as u32);
        dst.put_u32(payload_len as u32);
        for object in &frame.objects {
            if object.key.len() > u16::MAX as usize {
                return Err(CaptureError::Internal {
                    reason: format!("object key '{}' too long", object.key),
                });
            }
            dst.put_u16(object.key.len() as u16);
            dst.put_slice(object.key.as_bytes());
            dst.put_u32(object.data.len() as u32);
            dst.put_slice(&object.data);
        }

        let crc = crc32fast::hash(&dst[start + HEAD..]);
        dst.put_u32(crc);
        Ok(())
    }
}

fn decode_objects(payload: &[u8], nkv: u32) -> Result<Vec<KeyedObject>, CaptureError> {
    let mut objects = Vec::with_capacity(nkv.min(64) as usize);
    let mut cursor = payload;

    for _ in 0..nkv {
        if cursor.len() < 2 {
            return Err(CaptureError::protocol("truncated object key length"));
        }
        let key_len = cursor.get_u16() as usize;
        if cursor.len() < key_len {
            return Err(CaptureError::protocol("truncated object key"));
        }
        let key = std::str::from_utf8(&cursor[..key_len])
            .map_err(|_| CaptureError::protocol("object key is not valid utf-8"))?
            .to_string();
        cursor.advance(key_len);

        if cursor.len() < 4 {
            return Err(CaptureError::protocol("truncated object size"));
        }
        let obj_size = cursor.get_u32() as usize;
        if cursor.len() < obj_size {
            return Err(CaptureError::protocol("truncated object payload"));
        }
        let data = cursor[..obj_size].to_vec();
        cursor.advance(obj_size);

        objects.push(KeyedObject { key, data });
    }

    if !cursor.is_empty() {
        return Err(CaptureError::protocol(
            "trailing bytes after last keyed object",
        ));
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::frame::{frame_types, ProbeRequest};

    fn sample_frame() -> Frame {
        Frame::compose(&ProbeRequest {
            transaction: 77,
            definition: "wlan0:channel=6,name=upstairs".into(),
        })
        .unwrap()
    }

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip() {
        let frame = sample_frame();
        let mut buf = encode(&frame);
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_frame_round_trip() {
        let frame = Frame::new(frame_types::DATA);
        let mut buf = encode(&frame);
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_restarts() {
        let frame = sample_frame();
        let wire = encode(&frame);
        let mut codec = FrameCodec::new();

        // Everything but the last byte: no frame yet, no error.
        let mut buf = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // The final byte completes exactly one frame.
        buf.extend_from_slice(&wire[wire.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let a = sample_frame();
        let b = Frame::new(frame_types::DATA);
        let mut buf = encode(&a);
        buf.extend_from_slice(&encode(&b));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_magic_is_a_violation() {
        let mut buf = encode(&sample_frame());
        buf[0] ^= 0xff;
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.as_label(), "protocol_violation");
    }

    #[test]
    fn corrupted_body_fails_crc() {
        let mut buf = encode(&sample_frame());
        let mid = buf.len() / 2;
        buf[mid] ^= 0xff;
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.as_label(), "protocol_violation");
    }

    #[test]
    fn oversize_payload_declaration_rejected() {
        let frame = sample_frame();
        let mut buf = encode(&frame);
        // Rewrite payload_len to an absurd value.
        let at = HEAD + frame.frame_type.len() + 4;
        buf[at..at + 4].copy_from_slice(&(u32::MAX).to_be_bytes());
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert_eq!(err.as_label(), "protocol_violation");
    }
}
