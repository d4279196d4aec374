//! # wirelink
//!
//! Core runtime for bidirectional typed RPC over a single reliable byte or
//! text transport.
//!
//! One abstraction, the [`Connection`], is used identically on both ends
//! of the link. It multiplexes three message genres:
//!
//! - **API calls**: request/response correlated by sequence number, with
//!   timeouts, abort keys, and external cancellation
//! - **Messages**: fire-and-forget, dispatched to subscribers by literal
//!   name or regex pattern
//! - **Heartbeats**: interval pings with latency sampling and an
//!   idle-timeout disconnect
//!
//! Concrete transports stay outside this crate: they implement the
//! [`Transport`] trait downstream and feed inbound frames to
//! [`Connection::recv_data`]. Likewise the schema compiler; this crate
//! consumes its output as a read-only [`ServiceMap`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wirelink::{ApiHandlers, CallOptions, Connection, ServiceDef, ServiceMap, Side};
//!
//! #[tokio::main]
//! async fn main() {
//!     let map = Arc::new(ServiceMap::new(
//!         vec![ServiceDef::api(1, "Echo")],
//!         "md5-of-definitions",
//!         1_700_000_000_000,
//!     ).unwrap());
//!
//!     let handlers = Arc::new(ApiHandlers::new());
//!     handlers.register("Echo", |req: serde_json::Value, call| async move {
//!         call.succ(req).await?;
//!         Ok(())
//!     });
//!
//!     let conn = Connection::builder(Side::Client, map)
//!         .api_handlers(handlers)
//!         .build(my_transport());
//!     conn.connect().await.unwrap();
//!
//!     let ret = conn
//!         .call_api::<_, serde_json::Value>("Echo", serde_json::json!({"text": "hi"}), CallOptions::default())
//!         .await;
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod counter;
pub mod emitter;
pub mod error;
pub mod flow;
pub mod options;
pub mod proto;
pub mod transport;

pub use connection::{
    ApiCall, ApiCallReturnFlowData, ApiHandlerFn, ApiHandlerResult, ApiHandlers,
    CallApiFlowData, CallApiReturnFlowData, Connection, ConnectionBuilder, ConnectionStatus,
    DisconnectFlowData, Flows, MsgFlowData, RecvDataFlowData, SendDataFlowData, Side,
};
pub use counter::Counter;
pub use emitter::{MsgEmitter, MsgHandler};
pub use error::{ApiReturn, OpResult, RpcError, RpcErrorKind, WirelinkError};
pub use flow::{BoxFuture, Flow, FlowResult};
pub use options::{CallOptions, ConnectionOptions};
pub use proto::{DataKind, ProtoInfo, ServiceDef, ServiceKind, ServiceMap, TransportData, WireData};
pub use transport::Transport;
