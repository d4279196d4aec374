//! Binary envelope framing (buffer variant).
//!
//! Compact, length-prefixed, big-endian layout:
//!
//! ```text
//! ┌─────┬───────┬──────────────────────────────────────────────┐
//! │ tag │ flags │ per-tag fields                               │
//! │ u8  │ u8    │                                              │
//! └─────┴───────┴──────────────────────────────────────────────┘
//! req:       u16 service_id, u32 sn, u32 body_len, body, [protoInfo]
//! res:       u32 sn, u32 body_len, body, [protoInfo]
//! err:       u32 sn, u32 err_len, err, [protoInfo]
//! msg:       u16 service_id, u32 body_len, body
//! heartbeat: u32 sn
//! custom:    u32 body_len, body
//! ```
//!
//! Bodies, errors, and the optional trailing `protoInfo` block are msgpack
//! (map format). Service names never appear on the wire: `req`/`msg`
//! carry numeric ids and a `res` is resolved through the receiver's
//! pending-call table.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Envelope, EnvelopeBody, EnvelopeTag};
use crate::error::{OpResult, RpcError, WirelinkError};
use crate::proto::ProtoInfo;

/// Flag bits in byte 1 of every buffer envelope.
pub mod flags {
    /// A msgpack `protoInfo` block trails the envelope.
    pub const HAS_PROTO_INFO: u8 = 0b0000_0001;
    /// Heartbeat only: this is a pong, not a ping.
    pub const IS_REPLY: u8 = 0b0000_0010;

    /// Bits that must be zero.
    pub const RESERVED_MASK: u8 = 0b1111_1100;
}

fn truncated(what: &str) -> WirelinkError {
    WirelinkError::Envelope(format!("buffer envelope truncated in {}", what))
}

fn body_bytes<'a>(envelope: &'a Envelope) -> OpResult<&'a Bytes> {
    match &envelope.body {
        Some(EnvelopeBody::Bin(bytes)) => Ok(bytes),
        Some(EnvelopeBody::Json(_)) => Err(WirelinkError::Envelope(
            "json body cannot ride a buffer envelope".into(),
        )),
        None => Err(WirelinkError::Envelope(format!(
            "{} envelope is missing body",
            envelope.tag.as_str()
        ))),
    }
}

/// Encode an envelope as one binary frame.
pub fn encode_box_buffer(envelope: &Envelope) -> OpResult<Bytes> {
    let mut flag_bits = 0u8;
    if envelope.proto_info.is_some() {
        flag_bits |= flags::HAS_PROTO_INFO;
    }
    if envelope.is_reply {
        flag_bits |= flags::IS_REPLY;
    }

    let mut buf = BytesMut::with_capacity(16);
    buf.put_u8(envelope.tag as u8);
    buf.put_u8(flag_bits);

    match envelope.tag {
        EnvelopeTag::Req | EnvelopeTag::Msg => {
            let id = envelope.service_id.ok_or_else(|| {
                WirelinkError::Envelope(format!(
                    "{} envelope is missing service id",
                    envelope.tag.as_str()
                ))
            })?;
            buf.put_u16(id);
            if envelope.tag == EnvelopeTag::Req {
                buf.put_u32(envelope.sn);
            }
            let body = body_bytes(envelope)?;
            buf.put_u32(body.len() as u32);
            buf.put_slice(body);
        }
        EnvelopeTag::Res => {
            buf.put_u32(envelope.sn);
            let body = body_bytes(envelope)?;
            buf.put_u32(body.len() as u32);
            buf.put_slice(body);
        }
        EnvelopeTag::Err => {
            buf.put_u32(envelope.sn);
            let err = envelope
                .err
                .as_ref()
                .ok_or_else(|| WirelinkError::Envelope("err envelope is missing err".into()))?;
            // rmp can't frame the flattened property bag; go through a json value.
            let err_bytes = rmp_serde::to_vec_named(&serde_json::to_value(err)?)?;
            buf.put_u32(err_bytes.len() as u32);
            buf.put_slice(&err_bytes);
        }
        EnvelopeTag::Heartbeat => {
            buf.put_u32(envelope.sn);
        }
        EnvelopeTag::Custom => {
            let body = body_bytes(envelope)?;
            buf.put_u32(body.len() as u32);
            buf.put_slice(body);
        }
    }

    if let Some(info) = &envelope.proto_info {
        buf.put_slice(&rmp_serde::to_vec_named(info)?);
    }

    Ok(buf.freeze())
}

fn take_u16(buf: &mut &[u8], what: &str) -> OpResult<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8], what: &str) -> OpResult<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(buf.get_u32())
}

fn take_block(buf: &mut &[u8], what: &str) -> OpResult<Bytes> {
    let len = take_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    let block = Bytes::copy_from_slice(&buf.chunk()[..len]);
    buf.advance(len);
    Ok(block)
}

/// Decode one binary frame into an envelope.
pub fn decode_box_buffer(raw: &Bytes) -> OpResult<Envelope> {
    let mut buf = &raw[..];
    if buf.remaining() < 2 {
        return Err(truncated("header"));
    }

    let tag_byte = buf.get_u8();
    let tag = EnvelopeTag::from_u8(tag_byte)
        .ok_or_else(|| WirelinkError::Envelope(format!("unknown envelope tag {}", tag_byte)))?;
    let flag_bits = buf.get_u8();
    if flag_bits & flags::RESERVED_MASK != 0 {
        return Err(WirelinkError::Envelope(format!(
            "reserved flag bits set: {:#04x}",
            flag_bits
        )));
    }

    let mut envelope = Envelope::bare(tag);
    envelope.is_reply = flag_bits & flags::IS_REPLY != 0;

    match tag {
        EnvelopeTag::Req => {
            envelope.service_id = Some(take_u16(&mut buf, "service id")?);
            envelope.sn = take_u32(&mut buf, "sn")?;
            envelope.body = Some(EnvelopeBody::Bin(take_block(&mut buf, "body")?));
        }
        EnvelopeTag::Res => {
            envelope.sn = take_u32(&mut buf, "sn")?;
            envelope.body = Some(EnvelopeBody::Bin(take_block(&mut buf, "body")?));
        }
        EnvelopeTag::Err => {
            envelope.sn = take_u32(&mut buf, "sn")?;
            let err_bytes = take_block(&mut buf, "err")?;
            let value: serde_json::Value = rmp_serde::from_slice(&err_bytes)?;
            envelope.err = Some(serde_json::from_value::<RpcError>(value)?);
        }
        EnvelopeTag::Msg => {
            envelope.service_id = Some(take_u16(&mut buf, "service id")?);
            envelope.body = Some(EnvelopeBody::Bin(take_block(&mut buf, "body")?));
        }
        EnvelopeTag::Heartbeat => {
            envelope.sn = take_u32(&mut buf, "sn")?;
        }
        EnvelopeTag::Custom => {
            envelope.body = Some(EnvelopeBody::Bin(take_block(&mut buf, "body")?));
        }
    }

    if flag_bits & flags::HAS_PROTO_INFO != 0 {
        let info: ProtoInfo = rmp_serde::from_slice(buf.chunk())?;
        envelope.proto_info = Some(info);
    } else if buf.has_remaining() {
        return Err(WirelinkError::Envelope(format!(
            "{} trailing bytes after {} envelope",
            buf.remaining(),
            tag.as_str()
        )));
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bin_body(value: serde_json::Value) -> EnvelopeBody {
        EnvelopeBody::Bin(Bytes::from(rmp_serde::to_vec_named(&value).unwrap()))
    }

    fn sample_proto() -> ProtoInfo {
        ProtoInfo {
            md5: "abc".into(),
            last_modified: 9,
            version: "0.2.0".into(),
            runtime: Some("test".into()),
        }
    }

    #[test]
    fn test_req_layout() {
        let envelope = Envelope {
            service_id: Some(0x0102),
            sn: 7,
            body: Some(EnvelopeBody::Bin(Bytes::from_static(b"\xc0"))),
            ..Envelope::bare(EnvelopeTag::Req)
        };
        let raw = encode_box_buffer(&envelope).unwrap();

        assert_eq!(raw[0], 1); // tag
        assert_eq!(raw[1], 0); // flags
        assert_eq!(&raw[2..4], &[0x01, 0x02]); // service id BE
        assert_eq!(&raw[4..8], &[0, 0, 0, 7]); // sn BE
        assert_eq!(&raw[8..12], &[0, 0, 0, 1]); // body_len BE
        assert_eq!(raw[12], 0xc0);
        assert_eq!(raw.len(), 13);

        assert_eq!(decode_box_buffer(&raw).unwrap(), envelope);
    }

    #[test]
    fn test_roundtrip_every_tag() {
        let cases = vec![
            Envelope {
                service_id: Some(1),
                sn: 3,
                body: Some(bin_body(json!({"a": 1}))),
                proto_info: Some(sample_proto()),
                ..Envelope::bare(EnvelopeTag::Req)
            },
            Envelope {
                sn: 3,
                body: Some(bin_body(json!({"b": [1, 2]}))),
                proto_info: Some(sample_proto()),
                ..Envelope::bare(EnvelopeTag::Res)
            },
            Envelope {
                sn: 0,
                err: Some(
                    RpcError::local("bad frame").with_prop("at", json!(12)),
                ),
                ..Envelope::bare(EnvelopeTag::Err)
            },
            Envelope {
                service_id: Some(2),
                body: Some(bin_body(json!("hello"))),
                ..Envelope::bare(EnvelopeTag::Msg)
            },
            Envelope {
                sn: 88,
                is_reply: true,
                ..Envelope::bare(EnvelopeTag::Heartbeat)
            },
            Envelope {
                body: Some(bin_body(json!(null))),
                ..Envelope::bare(EnvelopeTag::Custom)
            },
        ];

        for envelope in cases {
            let raw = encode_box_buffer(&envelope).unwrap();
            assert_eq!(decode_box_buffer(&raw).unwrap(), envelope);
        }
    }

    #[test]
    fn test_heartbeat_is_six_bytes() {
        let ping = Envelope {
            sn: 1,
            ..Envelope::bare(EnvelopeTag::Heartbeat)
        };
        assert_eq!(encode_box_buffer(&ping).unwrap().len(), 6);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        // empty / truncated header
        assert!(decode_box_buffer(&Bytes::new()).is_err());
        assert!(decode_box_buffer(&Bytes::from_static(&[1])).is_err());
        // unknown tag
        assert!(decode_box_buffer(&Bytes::from_static(&[9, 0, 0, 0])).is_err());
        // reserved flag bits
        assert!(decode_box_buffer(&Bytes::from_static(&[5, 0x80, 0, 0, 0, 1])).is_err());
        // body_len runs past the frame
        assert!(decode_box_buffer(&Bytes::from_static(&[
            2, 0, 0, 0, 0, 1, 0, 0, 0, 99
        ]))
        .is_err());
        // trailing garbage without the proto flag
        assert!(decode_box_buffer(&Bytes::from_static(&[5, 0, 0, 0, 0, 1, 0xff])).is_err());
    }

    #[test]
    fn test_encode_rejects_json_body() {
        let envelope = Envelope {
            service_id: Some(1),
            sn: 1,
            body: Some(EnvelopeBody::Json(json!({}))),
            ..Envelope::bare(EnvelopeTag::Req)
        };
        assert!(encode_box_buffer(&envelope).is_err());
    }
}
