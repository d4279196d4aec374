//! JSON envelope framing (text variant).
//!
//! One JSON object per frame:
//!
//! ```json
//! {"type":"req","serviceName":"Echo","sn":1,"body":{...},"protoInfo":{...}}
//! {"type":"res","serviceName":"Echo","sn":1,"body":{...}}
//! {"type":"err","sn":0,"err":{"message":"...","type":"LocalError"}}
//! {"type":"msg","serviceName":"Chat","body":{...}}
//! {"type":"heartbeat","sn":3,"isReply":true}
//! ```
//!
//! Optional keys (`protoInfo`, `isReply`, a `res`'s `serviceName`) are
//! omitted rather than set to null.

use serde_json::{json, Map, Value};

use super::{Envelope, EnvelopeBody, EnvelopeTag};
use crate::error::{OpResult, WirelinkError};

/// Encode an envelope as one JSON text frame.
pub fn encode_box_text(envelope: &Envelope) -> OpResult<String> {
    let mut obj = Map::new();
    obj.insert("type".into(), json!(envelope.tag.as_str()));

    if let Some(name) = &envelope.service_name {
        obj.insert("serviceName".into(), json!(name));
    }
    match envelope.tag {
        EnvelopeTag::Req | EnvelopeTag::Res | EnvelopeTag::Err | EnvelopeTag::Heartbeat => {
            obj.insert("sn".into(), json!(envelope.sn));
        }
        EnvelopeTag::Msg | EnvelopeTag::Custom => {}
    }
    if let Some(body) = &envelope.body {
        let value = match body {
            EnvelopeBody::Json(value) => value.clone(),
            EnvelopeBody::Bin(_) => {
                return Err(WirelinkError::Envelope(
                    "binary body cannot ride a text envelope".into(),
                ))
            }
        };
        obj.insert("body".into(), value);
    }
    if let Some(err) = &envelope.err {
        obj.insert("err".into(), serde_json::to_value(err)?);
    }
    if envelope.is_reply {
        obj.insert("isReply".into(), json!(true));
    }
    if let Some(info) = &envelope.proto_info {
        obj.insert("protoInfo".into(), serde_json::to_value(info)?);
    }

    Ok(Value::Object(obj).to_string())
}

/// Decode one JSON text frame into an envelope.
pub fn decode_box_text(raw: &str) -> OpResult<Envelope> {
    let value: Value = serde_json::from_str(raw)?;
    let obj = value
        .as_object()
        .ok_or_else(|| WirelinkError::Envelope("text envelope is not an object".into()))?;

    let tag_str = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WirelinkError::Envelope("text envelope has no type".into()))?;
    let tag = EnvelopeTag::from_str(tag_str)
        .ok_or_else(|| WirelinkError::Envelope(format!("unknown envelope type '{}'", tag_str)))?;

    let mut envelope = Envelope::bare(tag);

    envelope.service_name = obj
        .get("serviceName")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(sn) = obj.get("sn") {
        envelope.sn = sn
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| WirelinkError::Envelope(format!("bad sn {}", sn)))?;
    } else if matches!(
        tag,
        EnvelopeTag::Req | EnvelopeTag::Res | EnvelopeTag::Err | EnvelopeTag::Heartbeat
    ) {
        return Err(WirelinkError::Envelope(format!(
            "{} envelope has no sn",
            tag.as_str()
        )));
    }
    envelope.body = obj.get("body").cloned().map(EnvelopeBody::Json);
    envelope.err = match obj.get("err") {
        Some(err) => Some(serde_json::from_value(err.clone())?),
        None => None,
    };
    envelope.is_reply = obj.get("isReply").and_then(Value::as_bool).unwrap_or(false);
    envelope.proto_info = match obj.get("protoInfo") {
        Some(info) => Some(serde_json::from_value(info.clone())?),
        None => None,
    };

    // Required-field checks per tag; body presence is the body stage's call.
    match tag {
        EnvelopeTag::Req | EnvelopeTag::Msg => {
            if envelope.service_name.is_none() {
                return Err(WirelinkError::Envelope(format!(
                    "{} envelope has no serviceName",
                    tag.as_str()
                )));
            }
        }
        EnvelopeTag::Err => {
            if envelope.err.is_none() {
                return Err(WirelinkError::Envelope("err envelope has no err".into()));
            }
        }
        _ => {}
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::proto::ProtoInfo;
    use serde_json::json;

    #[test]
    fn test_req_wire_shape() {
        let envelope = Envelope {
            service_name: Some("Echo".into()),
            sn: 1,
            body: Some(EnvelopeBody::Json(json!({"text": "hi"}))),
            proto_info: Some(ProtoInfo {
                md5: "abc".into(),
                last_modified: 42,
                version: "0.2.0".into(),
                runtime: None,
            }),
            ..Envelope::bare(EnvelopeTag::Req)
        };

        let raw = encode_box_text(&envelope).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["serviceName"], "Echo");
        assert_eq!(value["sn"], 1);
        assert_eq!(value["body"]["text"], "hi");
        assert_eq!(value["protoInfo"]["md5"], "abc");

        assert_eq!(decode_box_text(&raw).unwrap(), envelope);
    }

    #[test]
    fn test_heartbeat_omits_false_is_reply() {
        let ping = Envelope {
            sn: 2,
            ..Envelope::bare(EnvelopeTag::Heartbeat)
        };
        let raw = encode_box_text(&ping).unwrap();
        assert!(!raw.contains("isReply"));

        let pong = Envelope {
            sn: 2,
            is_reply: true,
            ..Envelope::bare(EnvelopeTag::Heartbeat)
        };
        let raw = encode_box_text(&pong).unwrap();
        assert!(raw.contains("\"isReply\":true"));
        assert!(decode_box_text(&raw).unwrap().is_reply);
    }

    #[test]
    fn test_err_roundtrip() {
        let envelope = Envelope {
            sn: 0,
            err: Some(RpcError::local("cannot decode")),
            ..Envelope::bare(EnvelopeTag::Err)
        };
        let raw = encode_box_text(&envelope).unwrap();
        let back = decode_box_text(&raw).unwrap();
        assert_eq!(back.sn, 0);
        assert_eq!(back.err.unwrap().message, "cannot decode");
    }

    #[test]
    fn test_res_without_service_name_is_accepted() {
        let raw = r#"{"type":"res","sn":7,"body":{"ok":true}}"#;
        let envelope = decode_box_text(raw).unwrap();
        assert_eq!(envelope.tag, EnvelopeTag::Res);
        assert!(envelope.service_name.is_none());
        assert_eq!(envelope.sn, 7);
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(decode_box_text("not json").is_err());
        assert!(decode_box_text("[1,2]").is_err());
        assert!(decode_box_text(r#"{"sn":1}"#).is_err());
        assert!(decode_box_text(r#"{"type":"warp","sn":1}"#).is_err());
        assert!(decode_box_text(r#"{"type":"req","body":{}}"#).is_err());
        assert!(decode_box_text(r#"{"type":"msg","body":{}}"#).is_err());
        assert!(decode_box_text(r#"{"type":"err","sn":0}"#).is_err());
        assert!(decode_box_text(r#"{"type":"req","serviceName":"A","sn":-1,"body":{}}"#).is_err());
    }
}
