//! The Connection: one end of a bidirectional typed RPC link.
//!
//! A [`Connection`] multiplexes three message genres over one reliable
//! transport: request/response API calls correlated by sequence number,
//! fire-and-forget messages, and heartbeats. The same type serves both
//! sides of the link; a server merely owns many connections sharing one
//! options bundle, one service map, one flow set, and one handler
//! registry.
//!
//! # Pipelines
//!
//! Outbound: `call_api`/`send_msg` → pre flow → body encode → envelope
//! encode → `pre_send_data` flow → transport. Sends leave the transport in
//! initiation order; an mpsc-fed pump task serializes the tail of the
//! pipeline per connection.
//!
//! Inbound: transport → [`recv_data`](Connection::recv_data) →
//! `pre_recv_data` flow → envelope decode → body decode → dispatch by tag.
//!
//! # Lifecycle
//!
//! ```text
//!       connect()            link up
//! Disconnected ────→ Connecting ────→ Connected
//!       ↑                                 │
//!       │              disconnect() /     │
//!       │           heartbeat timeout     ↓
//!       └─────────── Disconnected ←── Disconnecting
//! ```
//!
//! Entering `Disconnecting` stops the heartbeat, settles every pending
//! call with a `LOST_CONN` network error, and bounds the transport's own
//! teardown at three seconds.

mod api_call;
mod heartbeat;
mod pending;

pub use api_call::{ApiCall, ApiHandlerFn, ApiHandlerResult, ApiHandlers};
pub use pending::{PendingCall, PendingCalls};

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::codec;
use crate::counter::Counter;
use crate::emitter::{MsgEmitter, MsgHandler};
use crate::error::{ApiReturn, OpResult, RpcError, RpcErrorKind, WirelinkError};
use crate::flow::Flow;
use crate::options::{CallOptions, ConnectionOptions};
use crate::proto::{DataKind, ProtoInfo, ServiceMap, TransportData, WireData};
use crate::transport::Transport;

/// Upper bound on the transport's own teardown during a disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Outbound queue depth before senders start waiting.
const OUT_QUEUE_CAPACITY: usize = 1024;

/// Where a connection advanced to in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The link is being established.
    Connecting,
    /// Fully operational; the only status that sends and receives.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Not linked; the initial and final status.
    Disconnected,
}

impl ConnectionStatus {
    /// Lower-case name for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

/// Which end of the link this connection is.
///
/// Sides differ only in who is blamed for a crashed handler; lookups and
/// the wire contract are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The dialing end.
    Client,
    /// The accepting end.
    Server,
}

impl Side {
    /// Error kind for a crashed or overdue local handler.
    pub fn internal_error_kind(self) -> RpcErrorKind {
        match self {
            Side::Client => RpcErrorKind::ClientError,
            Side::Server => RpcErrorKind::ServerError,
        }
    }
}

/// Data seen by the `pre_call_api` flow.
///
/// Setting `ret` short-circuits the call: nothing goes on the wire and the
/// supplied return is delivered as if it came from the peer.
pub struct CallApiFlowData {
    pub conn: Connection,
    pub api_name: String,
    pub req: Value,
    pub ret: Option<ApiReturn<Value>>,
}

/// Data seen by the `pre_call_api_return` flow.
pub struct CallApiReturnFlowData {
    pub conn: Connection,
    pub api_name: String,
    pub sn: u32,
    pub ret: ApiReturn<Value>,
}

/// Data seen by the `pre_api_call_return` flow.
pub struct ApiCallReturnFlowData {
    pub call: ApiCall,
    pub ret: ApiReturn<Value>,
}

/// Data seen by the message flows (`pre_send_msg`, `post_send_msg`,
/// `pre_recv_msg`).
pub struct MsgFlowData {
    pub conn: Connection,
    pub msg_name: String,
    pub msg: Value,
}

/// Data seen by the `pre_send_data` flow, after encoding.
pub struct SendDataFlowData {
    pub conn: Connection,
    pub raw: WireData,
    pub data: TransportData,
}

/// Data seen by the `pre_recv_data` flow, before decoding.
///
/// A middleware may fill `decoded` to bypass the codecs entirely.
pub struct RecvDataFlowData {
    pub conn: Connection,
    pub raw: WireData,
    pub decoded: Option<TransportData>,
}

/// Data seen by the `post_disconnect` flow.
pub struct DisconnectFlowData {
    pub conn: Connection,
    pub is_manual: bool,
    pub reason: Option<String>,
}

/// Every user-visible hook point, in pipeline order.
///
/// A client owns its flows; a server shares one set across all of its
/// connections, so middlewares must be safe to run concurrently for
/// different connections.
#[derive(Default)]
pub struct Flows {
    pub pre_call_api: Flow<CallApiFlowData>,
    pub pre_call_api_return: Flow<CallApiReturnFlowData>,
    pub pre_api_call: Flow<ApiCall>,
    pub pre_api_call_return: Flow<ApiCallReturnFlowData>,
    pub pre_send_msg: Flow<MsgFlowData>,
    pub post_send_msg: Flow<MsgFlowData>,
    pub pre_recv_msg: Flow<MsgFlowData>,
    pub pre_send_data: Flow<SendDataFlowData>,
    pub pre_recv_data: Flow<RecvDataFlowData>,
    pub post_connect: Flow<Connection>,
    pub post_disconnect: Flow<DisconnectFlowData>,
}

type CustomHook = Arc<dyn Fn(&Connection, &Value) + Send + Sync>;

struct Outbound {
    data: TransportData,
    raw: WireData,
    done: oneshot::Sender<OpResult<()>>,
}

pub(crate) struct ConnInner {
    pub(crate) options: ConnectionOptions,
    side: Side,
    pub(crate) service_map: Arc<ServiceMap>,
    pub(crate) flows: Arc<Flows>,
    pub(crate) api_handlers: Arc<ApiHandlers>,
    transport: Arc<dyn Transport>,
    status: Mutex<ConnectionStatus>,
    sn: Counter,
    pending: PendingCalls,
    emitter: MsgEmitter,
    remote_proto: Mutex<Option<ProtoInfo>>,
    pub(crate) heartbeat: heartbeat::Heartbeat,
    custom_hook: Mutex<Option<CustomHook>>,
    out_tx: Mutex<Option<mpsc::Sender<Outbound>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Configures and produces a [`Connection`].
pub struct ConnectionBuilder {
    side: Side,
    service_map: Arc<ServiceMap>,
    options: ConnectionOptions,
    flows: Arc<Flows>,
    api_handlers: Arc<ApiHandlers>,
}

impl ConnectionBuilder {
    /// Start building a connection for one side of a link.
    pub fn new(side: Side, service_map: Arc<ServiceMap>) -> Self {
        Self {
            side,
            service_map,
            options: ConnectionOptions::default(),
            flows: Arc::new(Flows::default()),
            api_handlers: Arc::new(ApiHandlers::new()),
        }
    }

    /// Replace the default options bundle.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a flow set. On a server, pass the same `Arc` to every
    /// connection.
    pub fn flows(mut self, flows: Arc<Flows>) -> Self {
        self.flows = flows;
        self
    }

    /// Attach a handler registry. On a server, pass the same `Arc` to
    /// every connection.
    pub fn api_handlers(mut self, handlers: Arc<ApiHandlers>) -> Self {
        self.api_handlers = handlers;
        self
    }

    /// Bind the transport and produce the connection, in `Disconnected`.
    pub fn build(self, transport: Arc<dyn Transport>) -> Connection {
        Connection {
            inner: Arc::new(ConnInner {
                options: self.options,
                side: self.side,
                service_map: self.service_map,
                flows: self.flows,
                api_handlers: self.api_handlers,
                transport,
                status: Mutex::new(ConnectionStatus::Disconnected),
                sn: Counter::new(),
                pending: PendingCalls::new(),
                emitter: MsgEmitter::new(),
                remote_proto: Mutex::new(None),
                heartbeat: heartbeat::Heartbeat::new(),
                custom_hook: Mutex::new(None),
                out_tx: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// One end of a bidirectional typed RPC link.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
    /// Start building a connection.
    pub fn builder(side: Side, service_map: Arc<ServiceMap>) -> ConnectionBuilder {
        ConnectionBuilder::new(side, service_map)
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ConnInner>) -> Option<Connection> {
        weak.upgrade().map(|inner| Connection { inner })
    }

    /// Which side of the link this is.
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock().unwrap()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.inner.status.lock().unwrap() = status;
    }

    /// The connection-wide options bundle.
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// The compiled service registry.
    pub fn service_map(&self) -> &ServiceMap {
        &self.inner.service_map
    }

    /// The shared handler registry.
    pub fn api_handlers(&self) -> &ApiHandlers {
        &self.inner.api_handlers
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_call_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Round-trip time of the most recent heartbeat, if one completed.
    pub fn last_heartbeat_latency(&self) -> Option<Duration> {
        self.inner.heartbeat.latency()
    }

    /// The peer's proto descriptor, once learned.
    pub fn remote_proto_info(&self) -> Option<ProtoInfo> {
        self.inner.remote_proto.lock().unwrap().clone()
    }

    // ---- lifecycle -------------------------------------------------------

    /// Establish the link: `Disconnected` → `Connecting` → `Connected`.
    ///
    /// Fails without side effects when called in any other status.
    pub async fn connect(&self) -> OpResult<()> {
        let guard = self.inner.lifecycle.lock().await;
        let status = self.status();
        if status != ConnectionStatus::Disconnected {
            return Err(WirelinkError::InvalidStatus(status.as_str()));
        }
        self.set_status(ConnectionStatus::Connecting);
        if self.inner.options.log_connect {
            tracing::info!("[Connecting]");
        }

        // The pump must be running before the link can carry anything.
        let (tx, rx) = mpsc::channel(OUT_QUEUE_CAPACITY);
        *self.inner.out_tx.lock().unwrap() = Some(tx);
        tokio::spawn(outbound_pump(rx, self.downgrade()));

        if let Err(err) = self.inner.transport.do_connect().await {
            *self.inner.out_tx.lock().unwrap() = None;
            self.set_status(ConnectionStatus::Disconnected);
            if self.inner.options.log_connect {
                tracing::error!("[ConnectFailed] {}", err);
            }
            return Err(err);
        }

        self.set_status(ConnectionStatus::Connected);
        if self.inner.options.log_connect {
            tracing::info!("[Connected]");
        }
        if self.inner.options.heartbeat {
            heartbeat::start(self);
        }
        drop(guard);

        self.inner.flows.post_connect.exec(self.clone()).await;
        Ok(())
    }

    /// Tear the link down deliberately.
    ///
    /// No-op when already disconnected; an error while connecting or
    /// while another teardown is mid-flight. Concurrent callers converge:
    /// whoever arrives during a teardown waits for it and observes
    /// `Disconnected`.
    pub async fn disconnect(&self) -> OpResult<()> {
        self.disconnect_inner(true, None).await
    }

    pub(crate) async fn disconnect_inner(
        &self,
        is_manual: bool,
        reason: Option<String>,
    ) -> OpResult<()> {
        let guard = self.inner.lifecycle.lock().await;
        match self.status() {
            ConnectionStatus::Disconnected => return Ok(()),
            ConnectionStatus::Connected => {}
            other => return Err(WirelinkError::InvalidStatus(other.as_str())),
        }
        self.set_status(ConnectionStatus::Disconnecting);

        heartbeat::stop(self);

        // Every pending caller settles with the same network error, before
        // any user-visible post hook runs.
        self.inner.pending.fail_all(RpcError::lost_conn());

        match tokio::time::timeout(
            DISCONNECT_TIMEOUT,
            self.inner.transport.do_disconnect(is_manual, reason.clone()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Transport disconnect failed: {}", err),
            Err(_) => tracing::warn!(
                "Transport disconnect exceeded {:?}; forcing teardown",
                DISCONNECT_TIMEOUT
            ),
        }

        *self.inner.out_tx.lock().unwrap() = None;
        self.set_status(ConnectionStatus::Disconnected);
        if self.inner.options.log_connect {
            tracing::info!(
                "[Disconnect] {}",
                reason.as_deref().unwrap_or(if is_manual {
                    "manual"
                } else {
                    "by remote or timer"
                })
            );
        }
        drop(guard);

        self.inner
            .flows
            .post_disconnect
            .exec(DisconnectFlowData {
                conn: self.clone(),
                is_manual,
                reason,
            })
            .await;
        Ok(())
    }

    // ---- outbound --------------------------------------------------------

    /// Call a remote API and wait for its return.
    ///
    /// Never fails as a `Result`: any failure is an [`ApiReturn::Err`]
    /// value. `None` means the call was aborted and no result will ever
    /// exist.
    pub async fn call_api<Req, Res>(
        &self,
        api_name: &str,
        req: Req,
        options: CallOptions,
    ) -> Option<ApiReturn<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let req = match serde_json::to_value(req) {
            Ok(value) => value,
            Err(err) => {
                return Some(ApiReturn::Err(RpcError::local(format!(
                    "Failed to encode request: {}",
                    err
                ))))
            }
        };
        let ret = self.call_api_dyn(api_name, req, options).await?;
        Some(match ret {
            ApiReturn::Succ(value) => match serde_json::from_value::<Res>(value) {
                Ok(res) => ApiReturn::Succ(res),
                Err(err) => ApiReturn::Err(RpcError::local(format!(
                    "Failed to decode response: {}",
                    err
                ))),
            },
            ApiReturn::Err(err) => ApiReturn::Err(err),
        })
    }

    /// Dynamic variant of [`call_api`](Self::call_api) over raw values.
    pub async fn call_api_dyn(
        &self,
        api_name: &str,
        req: Value,
        mut options: CallOptions,
    ) -> Option<ApiReturn<Value>> {
        let sn = self.inner.sn.next();
        let timeout = options.timeout.unwrap_or(self.inner.options.call_api_timeout);
        let kind = options
            .data_kind
            .unwrap_or(self.inner.options.default_data_kind);

        // Register before anything can suspend, so an inbound reply or an
        // abort always finds the call.
        let (call, mut ret_rx, aborted) =
            PendingCall::new(sn, api_name, req.clone(), options.abort_key.take());
        self.inner.pending.insert(call);

        if let Some(signal) = options.abort_signal.take() {
            let weak = self.downgrade();
            tokio::spawn(async move {
                if signal.await.is_ok() {
                    if let Some(conn) = Connection::upgrade(&weak) {
                        conn.abort(sn);
                    }
                }
            });
        }

        if self.inner.options.log_api {
            if self.inner.options.log_req_body {
                tracing::info!("[CallApi] #{} {} {}", sn, api_name, req);
            } else {
                tracing::info!("[CallApi] #{} {}", sn, api_name);
            }
        }

        let fd = CallApiFlowData {
            conn: self.clone(),
            api_name: api_name.to_string(),
            req,
            ret: None,
        };
        let fd = match self.inner.flows.pre_call_api.exec(fd).await {
            Some(fd) => fd,
            None => {
                self.inner.pending.abort(sn);
                return None;
            }
        };
        if aborted.load(Ordering::Acquire) {
            return None;
        }

        let ret = if let Some(ret) = fd.ret {
            // The flow supplied the return; skip the wire entirely.
            self.inner.pending.remove(sn);
            ret
        } else {
            let proto_info = match self.remote_proto_info() {
                Some(_) => None,
                None => Some(self.inner.service_map.local_proto_info()),
            };
            let data = TransportData::Req {
                service_name: fd.api_name.clone(),
                sn,
                body: fd.req,
                proto_info,
            };
            match self.send_transport_data(data, kind).await {
                Err(err) => {
                    self.inner.pending.remove(sn);
                    if aborted.load(Ordering::Acquire) {
                        return None;
                    }
                    ApiReturn::Err(RpcError::local(err.to_string()))
                }
                Ok(()) => match self.wait_api_return(sn, &mut ret_rx, timeout).await {
                    Some(ret) => ret,
                    None => return None,
                },
            }
        };
        if aborted.load(Ordering::Acquire) {
            return None;
        }

        let fd = CallApiReturnFlowData {
            conn: self.clone(),
            api_name: api_name.to_string(),
            sn,
            ret,
        };
        let fd = match self.inner.flows.pre_call_api_return.exec(fd).await {
            Some(fd) => fd,
            None => {
                self.inner.pending.abort(sn);
                return None;
            }
        };
        if aborted.load(Ordering::Acquire) {
            return None;
        }

        if self.inner.options.log_api {
            match &fd.ret {
                ApiReturn::Succ(res) => {
                    if self.inner.options.log_res_body {
                        tracing::info!("[ApiRes] #{} {} {}", sn, api_name, res);
                    } else {
                        tracing::info!("[ApiRes] #{} {}", sn, api_name);
                    }
                }
                ApiReturn::Err(err) => {
                    tracing::info!("[ApiErr] #{} {} {}", sn, api_name, err);
                }
            }
        }
        Some(fd.ret)
    }

    /// Await the return for `sn`. `None` means the call was aborted.
    async fn wait_api_return(
        &self,
        sn: u32,
        ret_rx: &mut oneshot::Receiver<ApiReturn<Value>>,
        timeout: Duration,
    ) -> Option<ApiReturn<Value>> {
        if timeout == Duration::ZERO {
            return ret_rx.await.ok();
        }
        match tokio::time::timeout(timeout, &mut *ret_rx).await {
            Ok(Ok(ret)) => Some(ret),
            // Sender dropped without a value: the call was aborted.
            Ok(Err(_)) => None,
            Err(_elapsed) => {
                // Whoever removes the pending call first wins. If the
                // reply beat us to it, its settle is imminent; await it
                // instead of reporting a timeout.
                if self.inner.pending.remove(sn).is_some() {
                    Some(ApiReturn::Err(RpcError::timeout()))
                } else {
                    ret_rx.await.ok()
                }
            }
        }
    }

    /// Send a fire-and-forget message.
    ///
    /// `Some(Ok(()))` means "handed to the transport", not "processed by
    /// the peer". `None` means a `pre_send_msg` middleware canceled the
    /// send; nothing went out.
    pub async fn send_msg<M: Serialize>(
        &self,
        msg_name: &str,
        msg: M,
        options: CallOptions,
    ) -> Option<OpResult<()>> {
        let msg = match serde_json::to_value(msg) {
            Ok(value) => value,
            Err(err) => return Some(Err(WirelinkError::Json(err))),
        };
        self.send_msg_dyn(msg_name, msg, options).await
    }

    /// Dynamic variant of [`send_msg`](Self::send_msg) over raw values.
    pub async fn send_msg_dyn(
        &self,
        msg_name: &str,
        msg: Value,
        options: CallOptions,
    ) -> Option<OpResult<()>> {
        let kind = options
            .data_kind
            .unwrap_or(self.inner.options.default_data_kind);

        let fd = MsgFlowData {
            conn: self.clone(),
            msg_name: msg_name.to_string(),
            msg,
        };
        let fd = match self.inner.flows.pre_send_msg.exec(fd).await {
            Some(fd) => fd,
            None => {
                tracing::debug!("send_msg '{}' canceled by pre_send_msg flow", msg_name);
                return None;
            }
        };

        let data = TransportData::Msg {
            service_name: fd.msg_name.clone(),
            body: fd.msg.clone(),
        };
        let result = self.send_transport_data(data, kind).await;

        if result.is_ok() {
            if self.inner.options.log_msg {
                tracing::info!("[SendMsg] {}", fd.msg_name);
            }
            self.inner.flows.post_send_msg.exec(fd).await;
        }
        Some(result)
    }

    /// Send opaque data to the peer's custom hook.
    pub async fn send_custom(&self, body: Value, options: CallOptions) -> OpResult<()> {
        let kind = options
            .data_kind
            .unwrap_or(self.inner.options.default_data_kind);
        self.send_transport_data(TransportData::Custom { body }, kind)
            .await
    }

    /// Encode and enqueue one outbound frame, then wait for the pump to
    /// hand it to the transport.
    pub(crate) async fn send_transport_data(
        &self,
        data: TransportData,
        kind: DataKind,
    ) -> OpResult<()> {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            return Err(WirelinkError::InvalidStatus(status.as_str()));
        }

        let raw = codec::encode(
            &data,
            &self.inner.service_map,
            kind,
            self.inner.options.skip_encode_validate,
        )?;

        let tx = self
            .inner
            .out_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(WirelinkError::ConnectionClosed)?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Outbound {
            data,
            raw,
            done: done_tx,
        })
        .await
        .map_err(|_| WirelinkError::ConnectionClosed)?;
        done_rx.await.map_err(|_| WirelinkError::ConnectionClosed)?
    }

    // ---- cancellation ----------------------------------------------------

    /// Abort the pending call with this sequence number.
    ///
    /// The aborted caller never settles; a late reply for its sn is
    /// dropped. Idempotent.
    pub fn abort(&self, sn: u32) {
        self.inner.pending.abort(sn);
    }

    /// Abort every pending call registered under `key`.
    pub fn abort_by_key(&self, key: &str) {
        self.inner.pending.abort_by_key(key);
    }

    /// Abort every pending call.
    pub fn abort_all(&self) {
        self.inner.pending.abort_all();
    }

    // ---- inbound ---------------------------------------------------------

    /// Sole entry point for the transport's inbound frames.
    ///
    /// Frames arriving while not connected are dropped.
    pub async fn recv_data(&self, raw: WireData) {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            tracing::debug!("Dropped inbound frame while {}", status.as_str());
            return;
        }
        if self.inner.options.debug_buf {
            tracing::debug!("[RecvBuf] {} bytes", raw.len());
        }

        let fd = RecvDataFlowData {
            conn: self.clone(),
            raw,
            decoded: None,
        };
        let Some(fd) = self.inner.flows.pre_recv_data.exec(fd).await else {
            return;
        };
        let inbound_kind = fd.raw.kind();

        let data = match fd.decoded {
            Some(data) => data,
            None => {
                let envelope = match codec::decode_envelope(&fd.raw) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::error!("Failed to decode inbound envelope: {}", err);
                        let peer_err = RpcError::new(
                            RpcErrorKind::RemoteError,
                            format!("Failed to decode envelope: {}", err),
                        );
                        let _ = self
                            .send_transport_data(
                                TransportData::Err {
                                    sn: 0,
                                    err: peer_err,
                                    proto_info: None,
                                },
                                inbound_kind,
                            )
                            .await;
                        return;
                    }
                };

                // Learn the peer's descriptor before touching the body, so
                // a desync can be diagnosed from this very frame.
                let peer_intro = envelope.proto_info.is_some();
                if let Some(info) = &envelope.proto_info {
                    *self.inner.remote_proto.lock().unwrap() = Some(info.clone());
                }

                let tag = envelope.tag;
                let sn = envelope.sn;
                let lookup = |sn: u32| self.inner.pending.service_name_of(sn);
                match codec::resolve(
                    envelope,
                    &self.inner.service_map,
                    &lookup,
                    self.inner.options.skip_decode_validate,
                ) {
                    Ok(data) => data,
                    Err(err) => {
                        self.on_body_decode_error(tag, sn, err, inbound_kind, peer_intro)
                            .await;
                        return;
                    }
                }
            }
        };

        self.dispatch(data, inbound_kind).await;
    }

    /// Body-stage decode failure: reply for a `req`, synthesize a local
    /// error for a `res`, log otherwise.
    async fn on_body_decode_error(
        &self,
        tag: codec::EnvelopeTag,
        sn: u32,
        err: WirelinkError,
        inbound_kind: DataKind,
        peer_intro: bool,
    ) {
        let desync = self.remote_proto_info().and_then(|remote| {
            self.inner
                .service_map
                .local_proto_info()
                .desync_explanation(&remote)
        });
        if let Some(desync) = &desync {
            tracing::warn!("{}", desync);
        }

        match tag {
            codec::EnvelopeTag::Req => {
                let proto_info = peer_intro.then(|| self.inner.service_map.local_proto_info());
                let peer_err = RpcError::new(
                    RpcErrorKind::RemoteError,
                    format!("Failed to decode request: {}", err),
                );
                let _ = self
                    .send_transport_data(
                        TransportData::Err {
                            sn,
                            err: peer_err,
                            proto_info,
                        },
                        inbound_kind,
                    )
                    .await;
            }
            codec::EnvelopeTag::Res => {
                let mut message = format!("Failed to decode response body: {}", err);
                if let Some(desync) = desync {
                    message = format!("{} ({})", message, desync);
                }
                if !self
                    .inner
                    .pending
                    .resolve(sn, ApiReturn::Err(RpcError::local(message)))
                {
                    tracing::debug!("Undecodable reply #{} had no pending call", sn);
                }
            }
            _ => {
                tracing::error!("Failed to decode inbound {} body: {}", tag.as_str(), err);
            }
        }
    }

    /// Route one decoded [`TransportData`] to its subsystem.
    async fn dispatch(&self, data: TransportData, inbound_kind: DataKind) {
        match data {
            TransportData::Req {
                service_name,
                sn,
                body,
                proto_info,
            } => {
                let call = ApiCall::new(
                    self.clone(),
                    service_name,
                    sn,
                    body,
                    proto_info.is_some(),
                    inbound_kind,
                );
                // Handlers may be slow; never block the dispatch loop.
                tokio::spawn(call.execute());
            }
            TransportData::Res { sn, body, .. } => {
                if !self.inner.pending.resolve(sn, ApiReturn::Succ(body)) {
                    tracing::debug!("Dropped reply #{} for unknown or aborted call", sn);
                }
            }
            TransportData::Err { sn: 0, err, .. } => {
                tracing::warn!("[PeerError] peer failed to decode our data: {}", err);
            }
            TransportData::Err { sn, err, .. } => {
                if !self.inner.pending.resolve(sn, ApiReturn::Err(err)) {
                    tracing::debug!("Dropped error reply #{} for unknown or aborted call", sn);
                }
            }
            TransportData::Msg { service_name, body } => {
                let fd = MsgFlowData {
                    conn: self.clone(),
                    msg_name: service_name,
                    msg: body,
                };
                let Some(fd) = self.inner.flows.pre_recv_msg.exec(fd).await else {
                    return;
                };
                if self.inner.options.log_msg {
                    tracing::info!("[RecvMsg] {}", fd.msg_name);
                }
                self.inner.emitter.emit(&fd.msg_name, &fd.msg);
            }
            TransportData::Heartbeat { sn, is_reply } => {
                heartbeat::on_recv(self, sn, is_reply, inbound_kind).await;
            }
            TransportData::Custom { body } => {
                let hook = self.inner.custom_hook.lock().unwrap().clone();
                match hook {
                    Some(hook) => hook(self, &body),
                    None => tracing::debug!("Dropped custom data without a hook"),
                }
            }
        }
    }

    // ---- message subscriptions ------------------------------------------

    /// Subscribe to a message by its literal name.
    pub fn on_msg(&self, msg_name: &str, handler: MsgHandler) {
        self.inner.emitter.on(msg_name, handler, None);
    }

    /// Subscribe for exactly one delivery.
    pub fn once_msg(&self, msg_name: &str, handler: MsgHandler) {
        self.inner.emitter.once(msg_name, handler, None);
    }

    /// Unsubscribe; with `handler = None` every subscriber of the name.
    pub fn off_msg(&self, msg_name: &str, handler: Option<&MsgHandler>) {
        self.inner.emitter.off(msg_name, handler, None);
    }

    /// Subscribe to every message service whose name matches `pattern`.
    ///
    /// The pattern is expanded against the service map at subscription
    /// time; the matched names are returned.
    pub fn on_msg_regex(&self, pattern: &Regex, handler: MsgHandler) -> Vec<String> {
        let names: Vec<String> = self
            .inner
            .service_map
            .msg_names()
            .filter(|name| pattern.is_match(name))
            .map(str::to_string)
            .collect();
        for name in &names {
            self.inner.emitter.on(name, handler.clone(), None);
        }
        names
    }

    /// Install the hook receiving `custom` envelopes.
    pub fn set_custom_hook(&self, hook: impl Fn(&Connection, &Value) + Send + Sync + 'static) {
        *self.inner.custom_hook.lock().unwrap() = Some(Arc::new(hook));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.inner.side)
            .field("status", &self.status())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

/// Per-connection outbound pump: preserves initiation order all the way
/// into the transport, even across `pre_send_data` suspension points.
async fn outbound_pump(mut rx: mpsc::Receiver<Outbound>, weak: Weak<ConnInner>) {
    while let Some(item) = rx.recv().await {
        let Some(conn) = Connection::upgrade(&weak) else {
            break;
        };

        let fd = SendDataFlowData {
            conn: conn.clone(),
            raw: item.raw,
            data: item.data,
        };
        let fd = match conn.inner.flows.pre_send_data.exec(fd).await {
            Some(fd) => fd,
            None => {
                let _ = item.done.send(Err(WirelinkError::Canceled("pre_send_data")));
                continue;
            }
        };

        if conn.inner.options.debug_buf {
            tracing::debug!("[SendBuf] {} {} bytes", fd.data.tag(), fd.raw.len());
        }

        let SendDataFlowData { raw, data, .. } = fd;
        let result = conn.inner.transport.send_raw(raw, &data).await;
        let _ = item.done.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::BoxFuture;
    use crate::proto::ServiceDef;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct NullTransport {
        sent: AtomicUsize,
    }

    impl NullTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: AtomicUsize::new(0),
            })
        }
    }

    impl Transport for NullTransport {
        fn send_raw<'a>(
            &'a self,
            _raw: WireData,
            _data: &'a TransportData,
        ) -> BoxFuture<'a, OpResult<()>> {
            Box::pin(async move {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn do_disconnect(
            &self,
            _is_manual: bool,
            _reason: Option<String>,
        ) -> BoxFuture<'_, OpResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn sample_map() -> Arc<ServiceMap> {
        Arc::new(
            ServiceMap::new(
                vec![ServiceDef::api(1, "Echo"), ServiceDef::msg(2, "Chat")],
                "md5",
                0,
            )
            .unwrap(),
        )
    }

    fn connection(transport: Arc<dyn Transport>) -> Connection {
        Connection::builder(Side::Client, sample_map()).build(transport)
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let conn = connection(NullTransport::new());
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        conn.connect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connected);

        // Connecting twice is an error.
        assert!(matches!(
            conn.connect().await,
            Err(WirelinkError::InvalidStatus("connected"))
        ));

        conn.disconnect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);

        // Disconnecting again is a no-op.
        conn.disconnect().await.unwrap();

        // And the link can come back up.
        conn.connect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_send_fails_when_not_connected() {
        let conn = connection(NullTransport::new());
        let result = conn
            .send_msg("Chat", json!({"text": "hi"}), CallOptions::default())
            .await;
        assert!(matches!(
            result,
            Some(Err(WirelinkError::InvalidStatus("disconnected")))
        ));
    }

    #[tokio::test]
    async fn test_send_msg_goes_to_transport() {
        let transport = NullTransport::new();
        let conn = connection(transport.clone());
        conn.connect().await.unwrap();

        let result = conn
            .send_msg("Chat", json!({"text": "hi"}), CallOptions::default())
            .await;
        assert!(matches!(result, Some(Ok(()))));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_unknown_msg_is_local_error() {
        let conn = connection(NullTransport::new());
        conn.connect().await.unwrap();

        let result = conn
            .send_msg("Nope", json!({}), CallOptions::default())
            .await;
        assert!(matches!(
            result,
            Some(Err(WirelinkError::UnknownService(_)))
        ));
    }

    #[tokio::test]
    async fn test_call_api_send_failure_is_local_error_value() {
        struct FailingTransport;
        impl Transport for FailingTransport {
            fn send_raw<'a>(
                &'a self,
                _raw: WireData,
                _data: &'a TransportData,
            ) -> BoxFuture<'a, OpResult<()>> {
                Box::pin(async { Err(WirelinkError::Transport("wire is down".into())) })
            }
            fn do_disconnect(
                &self,
                _is_manual: bool,
                _reason: Option<String>,
            ) -> BoxFuture<'_, OpResult<()>> {
                Box::pin(async { Ok(()) })
            }
        }

        let conn = connection(Arc::new(FailingTransport));
        conn.connect().await.unwrap();

        let ret: ApiReturn<Value> = conn
            .call_api("Echo", json!({"text": "hi"}), CallOptions::default())
            .await
            .expect("send failures settle, they do not abort");
        let err = ret.err().expect("must be an error");
        assert_eq!(err.kind, RpcErrorKind::LocalError);
        assert!(err.message.contains("wire is down"));
        assert_eq!(conn.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_pre_call_api_flow_short_circuit() {
        let transport = NullTransport::new();
        let mut flows = Flows::default();
        flows.pre_call_api.push(|mut fd: CallApiFlowData| async move {
            fd.ret = Some(ApiReturn::Succ(json!({"text": "from flow"})));
            Ok(Some(fd))
        });

        let conn = Connection::builder(Side::Client, sample_map())
            .flows(Arc::new(flows))
            .build(transport.clone());
        conn.connect().await.unwrap();

        let ret: ApiReturn<Value> = conn
            .call_api("Echo", json!({}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(ret, ApiReturn::Succ(json!({"text": "from flow"})));
        // Nothing went on the wire.
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
        assert_eq!(conn.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_pre_call_api_flow_cancel_aborts() {
        let mut flows = Flows::default();
        flows.pre_call_api.push(|_fd: CallApiFlowData| async move { Ok(None) });
        let conn = Connection::builder(Side::Client, sample_map())
            .flows(Arc::new(flows))
            .build(NullTransport::new());
        conn.connect().await.unwrap();

        let ret = conn
            .call_api::<_, Value>("Echo", json!({}), CallOptions::default())
            .await;
        assert!(ret.is_none());
        assert_eq!(conn.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_inbound_dropped_when_disconnected() {
        let conn = connection(NullTransport::new());
        // Not connected: the frame is silently dropped.
        conn.recv_data(WireData::Text("{\"type\":\"heartbeat\",\"sn\":1}".into()))
            .await;
        assert_eq!(conn.pending_call_count(), 0);
    }

    #[tokio::test]
    async fn test_on_msg_regex_expands_against_service_map() {
        let map = Arc::new(
            ServiceMap::new(
                vec![
                    ServiceDef::msg(1, "room/Joined"),
                    ServiceDef::msg(2, "room/Left"),
                    ServiceDef::msg(3, "Chat"),
                ],
                "md5",
                0,
            )
            .unwrap(),
        );
        let conn = Connection::builder(Side::Client, map).build(NullTransport::new());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let handler: MsgHandler = Arc::new(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let mut matched = conn.on_msg_regex(&Regex::new("^room/").unwrap(), handler);
        matched.sort();
        assert_eq!(matched, vec!["room/Joined", "room/Left"]);

        conn.inner.emitter.emit("room/Joined", &json!({}));
        conn.inner.emitter.emit("Chat", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_by_key_empties_table() {
        let conn = connection(NullTransport::new());
        conn.connect().await.unwrap();

        let conn2 = conn.clone();
        let task = tokio::spawn(async move {
            conn2
                .call_api::<_, Value>(
                    "Echo",
                    json!({}),
                    CallOptions {
                        timeout: Some(Duration::ZERO),
                        abort_key: Some("K".into()),
                        ..CallOptions::default()
                    },
                )
                .await
        });

        // Let the call register and send.
        tokio::task::yield_now().await;
        while conn.pending_call_count() == 0 {
            tokio::task::yield_now().await;
        }

        conn.abort_by_key("K");
        assert_eq!(conn.pending_call_count(), 0);
        assert!(task.await.unwrap().is_none());
    }
}
