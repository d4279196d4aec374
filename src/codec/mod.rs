//! Body and envelope codecs.
//!
//! Outbound, a [`TransportData`] goes through two stages: the body codec
//! turns the dynamic body value into its wire form (inline JSON for text,
//! msgpack for buffer), and the envelope codec frames it with the tag,
//! sequence number, and routing info. Inbound runs the same stages in
//! reverse; the caller gets to observe the boundary between them so it can
//! react differently to framing failures and body failures.
//!
//! The buffer variant carries numeric service ids, so resolving an
//! incoming `res` needs the pending-call table to recover the service
//! name for its sequence number.

mod text;

pub mod buffer;

pub use text::{decode_box_text, encode_box_text};

use bytes::Bytes;
use serde_json::Value;

use crate::error::{OpResult, RpcError, WirelinkError};
use crate::proto::{DataKind, ProtoInfo, ServiceKind, ServiceMap, TransportData, WireData};

/// Envelope discriminator, shared by both wire variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeTag {
    Req = 1,
    Res = 2,
    Err = 3,
    Msg = 4,
    Heartbeat = 5,
    Custom = 6,
}

impl EnvelopeTag {
    /// Wire name used by the text variant.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeTag::Req => "req",
            EnvelopeTag::Res => "res",
            EnvelopeTag::Err => "err",
            EnvelopeTag::Msg => "msg",
            EnvelopeTag::Heartbeat => "heartbeat",
            EnvelopeTag::Custom => "custom",
        }
    }

    /// Parse the text-variant name.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "req" => EnvelopeTag::Req,
            "res" => EnvelopeTag::Res,
            "err" => EnvelopeTag::Err,
            "msg" => EnvelopeTag::Msg,
            "heartbeat" => EnvelopeTag::Heartbeat,
            "custom" => EnvelopeTag::Custom,
            _ => return None,
        })
    }

    /// Parse the buffer-variant tag byte.
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => EnvelopeTag::Req,
            2 => EnvelopeTag::Res,
            3 => EnvelopeTag::Err,
            4 => EnvelopeTag::Msg,
            5 => EnvelopeTag::Heartbeat,
            6 => EnvelopeTag::Custom,
            _ => return None,
        })
    }
}

/// A body in its wire form, before framing / after unframing.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    /// Inline JSON value (text variant).
    Json(Value),
    /// MsgPack bytes (buffer variant).
    Bin(Bytes),
}

/// The framed view of a [`TransportData`], halfway between the body codec
/// and the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tag: EnvelopeTag,
    /// Service name (text variant; optional on `res`).
    pub service_name: Option<String>,
    /// Numeric service id (buffer variant).
    pub service_id: Option<u16>,
    /// Sequence number; 0 when the envelope kind carries none.
    pub sn: u32,
    pub body: Option<EnvelopeBody>,
    pub err: Option<RpcError>,
    pub is_reply: bool,
    pub proto_info: Option<ProtoInfo>,
}

impl Envelope {
    fn bare(tag: EnvelopeTag) -> Self {
        Self {
            tag,
            service_name: None,
            service_id: None,
            sn: 0,
            body: None,
            err: None,
            is_reply: false,
            proto_info: None,
        }
    }
}

/// Encode a body value for the given wire mode.
pub fn encode_body(value: &Value, kind: DataKind) -> OpResult<EnvelopeBody> {
    match kind {
        DataKind::Text => Ok(EnvelopeBody::Json(value.clone())),
        DataKind::Buffer => Ok(EnvelopeBody::Bin(Bytes::from(rmp_serde::to_vec_named(
            value,
        )?))),
    }
}

/// Decode a wire-form body back into a dynamic value.
pub fn decode_body(body: EnvelopeBody) -> OpResult<Value> {
    match body {
        EnvelopeBody::Json(value) => Ok(value),
        EnvelopeBody::Bin(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
    }
}

fn lookup_for_encode(
    map: &ServiceMap,
    name: &str,
    kind: ServiceKind,
    data_kind: DataKind,
    skip_validate: bool,
) -> OpResult<Option<u16>> {
    let svc = match kind {
        ServiceKind::Api => map.api_by_name(name),
        ServiceKind::Msg => map.msg_by_name(name),
    };
    match svc {
        Some(svc) => Ok(Some(svc.id)),
        // The buffer variant cannot be framed without a numeric id.
        None if data_kind == DataKind::Buffer || !skip_validate => {
            Err(WirelinkError::UnknownService(name.to_string()))
        }
        None => Ok(None),
    }
}

/// Run the outbound body stage and build the envelope view.
pub fn build_envelope(
    data: &TransportData,
    map: &ServiceMap,
    kind: DataKind,
    skip_validate: bool,
) -> OpResult<Envelope> {
    let envelope = match data {
        TransportData::Req {
            service_name,
            sn,
            body,
            proto_info,
        } => Envelope {
            service_id: lookup_for_encode(map, service_name, ServiceKind::Api, kind, skip_validate)?,
            service_name: Some(service_name.clone()),
            sn: *sn,
            body: Some(encode_body(body, kind)?),
            proto_info: proto_info.clone(),
            ..Envelope::bare(EnvelopeTag::Req)
        },
        TransportData::Res {
            service_name,
            sn,
            body,
            proto_info,
        } => {
            if !skip_validate && map.api_by_name(service_name).is_none() {
                return Err(WirelinkError::UnknownService(service_name.clone()));
            }
            Envelope {
                service_name: Some(service_name.clone()),
                sn: *sn,
                body: Some(encode_body(body, kind)?),
                proto_info: proto_info.clone(),
                ..Envelope::bare(EnvelopeTag::Res)
            }
        }
        TransportData::Err {
            sn,
            err,
            proto_info,
        } => Envelope {
            sn: *sn,
            err: Some(err.clone()),
            proto_info: proto_info.clone(),
            ..Envelope::bare(EnvelopeTag::Err)
        },
        TransportData::Msg { service_name, body } => Envelope {
            service_id: lookup_for_encode(map, service_name, ServiceKind::Msg, kind, skip_validate)?,
            service_name: Some(service_name.clone()),
            body: Some(encode_body(body, kind)?),
            ..Envelope::bare(EnvelopeTag::Msg)
        },
        TransportData::Heartbeat { sn, is_reply } => Envelope {
            sn: *sn,
            is_reply: *is_reply,
            ..Envelope::bare(EnvelopeTag::Heartbeat)
        },
        TransportData::Custom { body } => Envelope {
            body: Some(encode_body(body, kind)?),
            ..Envelope::bare(EnvelopeTag::Custom)
        },
    };
    Ok(envelope)
}

/// Encode a [`TransportData`] all the way to its wire form.
pub fn encode(
    data: &TransportData,
    map: &ServiceMap,
    kind: DataKind,
    skip_validate: bool,
) -> OpResult<WireData> {
    let envelope = build_envelope(data, map, kind, skip_validate)?;
    match kind {
        DataKind::Text => Ok(WireData::Text(encode_box_text(&envelope)?)),
        DataKind::Buffer => Ok(WireData::Binary(buffer::encode_box_buffer(&envelope)?)),
    }
}

/// Run the inbound envelope stage, selected by the raw frame's kind.
pub fn decode_envelope(raw: &WireData) -> OpResult<Envelope> {
    match raw {
        WireData::Text(s) => decode_box_text(s),
        WireData::Binary(b) => buffer::decode_box_buffer(b),
    }
}

fn missing(what: &str, tag: EnvelopeTag) -> WirelinkError {
    WirelinkError::Envelope(format!("{} envelope is missing {}", tag.as_str(), what))
}

/// Run the inbound body stage: resolve services and decode bodies.
///
/// `res_service` recovers the service name for an incoming `res` from its
/// sequence number (the pending-call table on the receiving connection).
pub fn resolve(
    envelope: Envelope,
    map: &ServiceMap,
    res_service: &dyn Fn(u32) -> Option<String>,
    skip_validate: bool,
) -> OpResult<TransportData> {
    let tag = envelope.tag;
    match tag {
        EnvelopeTag::Req => {
            let service_name = resolve_service(&envelope, map, ServiceKind::Api, skip_validate)?;
            Ok(TransportData::Req {
                service_name,
                sn: envelope.sn,
                body: decode_body(envelope.body.ok_or_else(|| missing("body", tag))?)?,
                proto_info: envelope.proto_info,
            })
        }
        EnvelopeTag::Res => {
            let service_name = envelope
                .service_name
                .clone()
                .or_else(|| res_service(envelope.sn))
                .ok_or_else(|| {
                    WirelinkError::Envelope(format!(
                        "cannot resolve service for res #{}",
                        envelope.sn
                    ))
                })?;
            Ok(TransportData::Res {
                service_name,
                sn: envelope.sn,
                body: decode_body(envelope.body.ok_or_else(|| missing("body", tag))?)?,
                proto_info: envelope.proto_info,
            })
        }
        EnvelopeTag::Err => Ok(TransportData::Err {
            sn: envelope.sn,
            err: envelope.err.ok_or_else(|| missing("err", tag))?,
            proto_info: envelope.proto_info,
        }),
        EnvelopeTag::Msg => {
            let service_name = resolve_service(&envelope, map, ServiceKind::Msg, skip_validate)?;
            Ok(TransportData::Msg {
                service_name,
                body: decode_body(envelope.body.ok_or_else(|| missing("body", tag))?)?,
            })
        }
        EnvelopeTag::Heartbeat => Ok(TransportData::Heartbeat {
            sn: envelope.sn,
            is_reply: envelope.is_reply,
        }),
        EnvelopeTag::Custom => Ok(TransportData::Custom {
            body: decode_body(envelope.body.ok_or_else(|| missing("body", tag))?)?,
        }),
    }
}

fn resolve_service(
    envelope: &Envelope,
    map: &ServiceMap,
    kind: ServiceKind,
    skip_validate: bool,
) -> OpResult<String> {
    if let Some(id) = envelope.service_id {
        let svc = map
            .by_id(id)
            .ok_or_else(|| WirelinkError::UnknownService(format!("#{}", id)))?;
        if svc.kind != kind {
            return Err(WirelinkError::Envelope(format!(
                "service '{}' is not a {} service",
                svc.name,
                match kind {
                    ServiceKind::Api => "api",
                    ServiceKind::Msg => "msg",
                }
            )));
        }
        return Ok(svc.name.clone());
    }

    let name = envelope
        .service_name
        .clone()
        .ok_or_else(|| missing("serviceName", envelope.tag))?;
    if !skip_validate {
        let known = match kind {
            ServiceKind::Api => map.api_by_name(&name).is_some(),
            ServiceKind::Msg => map.msg_by_name(&name).is_some(),
        };
        if !known {
            return Err(WirelinkError::UnknownService(name));
        }
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ServiceDef;
    use serde_json::json;

    fn sample_map() -> ServiceMap {
        ServiceMap::new(
            vec![ServiceDef::api(1, "Echo"), ServiceDef::msg(2, "Chat")],
            "md5",
            0,
        )
        .unwrap()
    }

    fn no_pending(_sn: u32) -> Option<String> {
        None
    }

    #[test]
    fn test_roundtrip_req_both_kinds() {
        let map = sample_map();
        let data = TransportData::Req {
            service_name: "Echo".into(),
            sn: 3,
            body: json!({"text": "hi"}),
            proto_info: Some(map.local_proto_info()),
        };

        for kind in [DataKind::Text, DataKind::Buffer] {
            let raw = encode(&data, &map, kind, false).unwrap();
            let envelope = decode_envelope(&raw).unwrap();
            let back = resolve(envelope, &map, &no_pending, false).unwrap();
            assert_eq!(back, data, "kind {:?}", kind);
        }
    }

    #[test]
    fn test_roundtrip_all_tags_buffer() {
        let map = sample_map();
        let pending = |sn: u32| (sn == 9).then(|| "Echo".to_string());

        let cases = vec![
            TransportData::Res {
                service_name: "Echo".into(),
                sn: 9,
                body: json!({"ok": true}),
                proto_info: None,
            },
            TransportData::Err {
                sn: 0,
                err: RpcError::local("cannot decode"),
                proto_info: None,
            },
            TransportData::Msg {
                service_name: "Chat".into(),
                body: json!({"text": "yo"}),
            },
            TransportData::Heartbeat {
                sn: 4,
                is_reply: true,
            },
            TransportData::Custom {
                body: json!([1, 2, 3]),
            },
        ];

        for data in cases {
            let raw = encode(&data, &map, DataKind::Buffer, false).unwrap();
            let envelope = decode_envelope(&raw).unwrap();
            let back = resolve(envelope, &map, &pending, false).unwrap();
            assert_eq!(back, data);
        }
    }

    #[test]
    fn test_unknown_service_on_encode() {
        let map = sample_map();
        let data = TransportData::Req {
            service_name: "Nope".into(),
            sn: 1,
            body: json!({}),
            proto_info: None,
        };
        assert!(matches!(
            encode(&data, &map, DataKind::Text, false),
            Err(WirelinkError::UnknownService(_))
        ));
        // Buffer framing needs the numeric id even when validation is off.
        assert!(encode(&data, &map, DataKind::Buffer, true).is_err());
        // Text framing can carry the raw name when validation is off.
        assert!(encode(&data, &map, DataKind::Text, true).is_ok());
    }

    #[test]
    fn test_resolve_res_through_pending_lookup() {
        let map = sample_map();
        let envelope = Envelope {
            sn: 5,
            body: Some(EnvelopeBody::Json(json!({}))),
            ..Envelope::bare(EnvelopeTag::Res)
        };
        let pending = |sn: u32| (sn == 5).then(|| "Echo".to_string());
        let data = resolve(envelope.clone(), &map, &pending, false).unwrap();
        assert!(matches!(data, TransportData::Res { service_name, .. } if service_name == "Echo"));

        assert!(resolve(envelope, &map, &no_pending, false).is_err());
    }

    #[test]
    fn test_resolve_rejects_kind_mismatch() {
        let map = sample_map();
        let envelope = Envelope {
            service_id: Some(2), // Chat is a msg service
            sn: 1,
            body: Some(EnvelopeBody::Json(json!({}))),
            ..Envelope::bare(EnvelopeTag::Req)
        };
        assert!(resolve(envelope, &map, &no_pending, false).is_err());
    }

    #[test]
    fn test_decode_body_rejects_garbage_msgpack() {
        let body = EnvelopeBody::Bin(Bytes::from_static(&[0xc1]));
        assert!(decode_body(body).is_err());
    }
}
