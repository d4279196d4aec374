//! Wire-level data model: the transport-data union, the service registry,
//! and the protocol descriptor exchanged between peers.

mod data;
mod info;
mod service_map;

pub use data::{DataKind, TransportData, WireData};
pub use info::ProtoInfo;
pub use service_map::{ServiceDef, ServiceKind, ServiceMap};
