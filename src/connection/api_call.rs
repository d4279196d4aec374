//! Server-side handling of one inbound API request.
//!
//! An [`ApiCall`] is constructed by the dispatch layer for every `req`
//! envelope and handed to the registered handler, which replies through
//! [`succ`](ApiCall::succ) or [`error`](ApiCall::error). Exactly one reply
//! goes out per call: duplicates are warn-logged no-ops, a handler crash
//! becomes an internal-error reply, and a handler that never replies is
//! answered by the deadline timer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{ApiCallReturnFlowData, Connection};
use crate::error::{
    ApiReturn, OpResult, RpcError, RpcErrorKind, WirelinkError, CODE_SERVER_TIMEOUT,
};
use crate::flow::BoxFuture;
use crate::proto::{DataKind, TransportData};

/// What a handler returns: `Err` is shorthand for "reply with this error".
pub type ApiHandlerResult = Result<(), RpcError>;

/// Type-erased API handler.
pub type ApiHandlerFn = Arc<dyn Fn(ApiCall) -> BoxFuture<'static, ApiHandlerResult> + Send + Sync>;

/// Registry of API handlers, shared read-mostly across connections.
pub struct ApiHandlers {
    map: RwLock<HashMap<String, ApiHandlerFn>>,
}

impl ApiHandlers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Register a typed handler for `name`.
    ///
    /// The request body is deserialized before the handler runs; a body
    /// that doesn't fit `Req` is answered with a decode error instead.
    pub fn register<Req, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req, ApiCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiHandlerResult> + Send + 'static,
    {
        let erased: ApiHandlerFn = Arc::new(move |call: ApiCall| {
            match serde_json::from_value::<Req>(call.req.clone()) {
                Ok(req) => Box::pin(handler(req, call)),
                Err(e) => Box::pin(async move {
                    let err = RpcError::new(
                        RpcErrorKind::RemoteError,
                        format!("Invalid request: {}", e),
                    );
                    call.error(err).await?;
                    Ok(())
                }),
            }
        });
        self.map.write().unwrap().insert(name.into(), erased);
    }

    /// Register an untyped handler that works on the raw body value.
    pub fn register_raw(&self, name: impl Into<String>, handler: ApiHandlerFn) {
        self.map.write().unwrap().insert(name.into(), handler);
    }

    /// Look up the handler for `name`.
    pub fn get(&self, name: &str) -> Option<ApiHandlerFn> {
        self.map.read().unwrap().get(name).cloned()
    }

    /// True if a handler is registered for `name`.
    pub fn has(&self, name: &str) -> bool {
        self.map.read().unwrap().contains_key(name)
    }
}

impl Default for ApiHandlers {
    fn default() -> Self {
        Self::new()
    }
}

/// One inbound API request being handled.
#[derive(Clone)]
pub struct ApiCall {
    conn: Connection,
    /// Name of the called API service.
    pub service_name: String,
    /// The request's sequence number.
    pub sn: u32,
    /// The decoded request body.
    pub req: Value,
    replied: Arc<AtomicBool>,
    /// The request introduced the peer's proto descriptor, so the reply
    /// introduces ours.
    peer_intro: bool,
    /// Wire mode the request arrived in; the reply goes back in kind.
    data_kind: DataKind,
}

impl ApiCall {
    pub(crate) fn new(
        conn: Connection,
        service_name: String,
        sn: u32,
        req: Value,
        peer_intro: bool,
        data_kind: DataKind,
    ) -> Self {
        Self {
            conn,
            service_name,
            sn,
            req,
            replied: Arc::new(AtomicBool::new(false)),
            peer_intro,
            data_kind,
        }
    }

    /// The connection this request arrived on.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// True once a reply has gone out (or is on its way).
    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Run the handler for this request and guarantee a reply.
    pub(crate) async fn execute(self) {
        let options = &self.conn.inner.options;
        if options.log_api {
            if options.log_req_body {
                tracing::info!("[ApiReq] #{} {} {}", self.sn, self.service_name, self.req);
            } else {
                tracing::info!("[ApiReq] #{} {}", self.sn, self.service_name);
            }
        }

        let flows = self.conn.inner.flows.clone();
        let call = match flows.pre_api_call.exec(self).await {
            Some(call) => call,
            None => return,
        };

        let Some(handler) = call.conn.inner.api_handlers.get(&call.service_name) else {
            let kind = call.conn.side().internal_error_kind();
            let err = RpcError::new(
                kind,
                format!("API not implemented: {}", call.service_name),
            );
            let _ = call.error(err).await;
            return;
        };

        let deadline = call.spawn_deadline();

        // The handler runs in its own task so a panic is contained here
        // instead of tearing down the dispatch loop.
        match tokio::spawn(handler(call.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if !call.is_replied() {
                    let _ = call.error(err).await;
                }
            }
            Err(join_err) => {
                let detail = if join_err.is_panic() {
                    match join_err.into_panic().downcast::<String>() {
                        Ok(msg) => *msg,
                        Err(payload) => match payload.downcast::<&'static str>() {
                            Ok(msg) => (*msg).to_string(),
                            Err(_) => "handler panicked".to_string(),
                        },
                    }
                } else {
                    join_err.to_string()
                };
                call.internal_error(detail).await;
            }
        }

        if call.is_replied() {
            if let Some(deadline) = deadline {
                deadline.abort();
            }
        }
    }

    fn spawn_deadline(&self) -> Option<tokio::task::JoinHandle<()>> {
        let timeout = self.conn.inner.options.api_call_timeout;
        if timeout == Duration::ZERO {
            return None;
        }
        let call = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !call.is_replied() {
                let kind = call.conn.side().internal_error_kind();
                let err =
                    RpcError::new(kind, "Api call timeout").with_code(CODE_SERVER_TIMEOUT);
                let _ = call.error(err).await;
            }
        }))
    }

    /// Reply successfully with a typed response.
    pub async fn succ<T: Serialize>(&self, res: T) -> OpResult<()> {
        let value = serde_json::to_value(res)?;
        self.reply(ApiReturn::Succ(value)).await
    }

    /// Reply with an error.
    pub async fn error(&self, err: RpcError) -> OpResult<()> {
        self.reply(ApiReturn::Err(err)).await
    }

    /// Reply to a handler crash, embedding the original failure when the
    /// connection is configured to return it.
    pub(crate) async fn internal_error(&self, detail: String) {
        if self.is_replied() {
            return;
        }
        let mut err = RpcError::new(self.conn.side().internal_error_kind(), "Internal error");
        if self.conn.inner.options.return_inner_error {
            err = err.with_prop("innerErr", Value::String(detail));
        }
        let _ = self.error(err).await;
    }

    async fn reply(&self, ret: ApiReturn<Value>) -> OpResult<()> {
        if self.replied.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                "[ApiCall] #{} {} already replied; dropping duplicate",
                self.sn,
                self.service_name
            );
            return Ok(());
        }

        let fd = ApiCallReturnFlowData {
            call: self.clone(),
            ret,
        };
        let fd = match self.conn.inner.flows.pre_api_call_return.exec(fd).await {
            Some(fd) => fd,
            None => {
                // No reply went out; let the deadline answer eventually.
                self.replied.store(false, Ordering::Release);
                return Err(WirelinkError::Canceled("pre_api_call_return"));
            }
        };

        let proto_info = self
            .peer_intro
            .then(|| self.conn.inner.service_map.local_proto_info());
        let options = &self.conn.inner.options;
        let data = match fd.ret {
            ApiReturn::Succ(body) => {
                if options.log_api {
                    if options.log_res_body {
                        tracing::info!("[ApiRes] #{} {} {}", self.sn, self.service_name, body);
                    } else {
                        tracing::info!("[ApiRes] #{} {}", self.sn, self.service_name);
                    }
                }
                TransportData::Res {
                    service_name: self.service_name.clone(),
                    sn: self.sn,
                    body,
                    proto_info,
                }
            }
            ApiReturn::Err(err) => {
                if options.log_api {
                    tracing::info!("[ApiErr] #{} {} {}", self.sn, self.service_name, err);
                }
                TransportData::Err {
                    sn: self.sn,
                    err,
                    proto_info,
                }
            }
        };

        self.conn.send_transport_data(data, self.data_kind).await
    }
}

impl std::fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCall")
            .field("service_name", &self.service_name)
            .field("sn", &self.sn)
            .field("replied", &self.is_replied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct EchoReq {
        text: String,
    }

    #[test]
    fn test_register_and_lookup() {
        let handlers = ApiHandlers::new();
        handlers.register("Echo", |req: EchoReq, call: ApiCall| async move {
            call.succ(serde_json::json!({"text": req.text})).await?;
            Ok(())
        });

        assert!(handlers.has("Echo"));
        assert!(handlers.get("Echo").is_some());
        assert!(!handlers.has("Nope"));
        assert!(handlers.get("Nope").is_none());
    }

    #[test]
    fn test_register_raw() {
        let handlers = ApiHandlers::new();
        let raw: ApiHandlerFn = Arc::new(|_call| Box::pin(async { Ok(()) }));
        handlers.register_raw("Raw", raw);
        assert!(handlers.has("Raw"));
    }

    #[test]
    fn test_reregistering_replaces() {
        let handlers = ApiHandlers::new();
        let first: ApiHandlerFn = Arc::new(|_call| Box::pin(async { Ok(()) }));
        let second: ApiHandlerFn = Arc::new(|_call| Box::pin(async { Err(RpcError::api("x")) }));
        handlers.register_raw("A", first);
        handlers.register_raw("A", second.clone());

        let got = handlers.get("A").unwrap();
        assert!(Arc::ptr_eq(&got, &second));
    }
}
