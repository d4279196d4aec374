//! The tagged union carried by every envelope, and the raw wire forms.

use bytes::Bytes;
use serde_json::Value;

use super::ProtoInfo;
use crate::error::RpcError;

/// Wire mode of a connection or a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    /// JSON envelopes, human-readable.
    Text,
    /// Length-prefixed binary envelopes with numeric service ids.
    Buffer,
}

/// Raw data as it enters or leaves a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireData {
    /// Text frame (JSON envelope).
    Text(String),
    /// Binary frame (buffer envelope).
    Binary(Bytes),
}

impl WireData {
    /// The wire mode this frame belongs to.
    pub fn kind(&self) -> DataKind {
        match self {
            WireData::Text(_) => DataKind::Text,
            WireData::Binary(_) => DataKind::Buffer,
        }
    }

    /// Frame size in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireData::Text(s) => s.len(),
            WireData::Binary(b) => b.len(),
        }
    }

    /// True for an empty frame.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a connection can put on (or take off) the wire.
///
/// Bodies are dynamic values; the typed public API converts at the edges.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportData {
    /// An API request awaiting a reply correlated by `sn`.
    Req {
        service_name: String,
        sn: u32,
        body: Value,
        proto_info: Option<ProtoInfo>,
    },
    /// The successful reply to a request.
    Res {
        service_name: String,
        sn: u32,
        body: Value,
        proto_info: Option<ProtoInfo>,
    },
    /// The failed reply to a request. `sn == 0` means "could not decode"
    /// and is not tied to any call.
    Err {
        sn: u32,
        err: RpcError,
        proto_info: Option<ProtoInfo>,
    },
    /// A fire-and-forget message; no sequence number.
    Msg { service_name: String, body: Value },
    /// A liveness probe or its reply.
    Heartbeat { sn: u32, is_reply: bool },
    /// Opaque passthrough for user extensions.
    Custom { body: Value },
}

impl TransportData {
    /// Short tag name, used in logs.
    pub fn tag(&self) -> &'static str {
        match self {
            TransportData::Req { .. } => "req",
            TransportData::Res { .. } => "res",
            TransportData::Err { .. } => "err",
            TransportData::Msg { .. } => "msg",
            TransportData::Heartbeat { .. } => "heartbeat",
            TransportData::Custom { .. } => "custom",
        }
    }

    /// The sequence number, if this kind of data carries one.
    pub fn sn(&self) -> Option<u32> {
        match self {
            TransportData::Req { sn, .. }
            | TransportData::Res { sn, .. }
            | TransportData::Err { sn, .. }
            | TransportData::Heartbeat { sn, .. } => Some(*sn),
            TransportData::Msg { .. } | TransportData::Custom { .. } => None,
        }
    }
}
