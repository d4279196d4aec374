//! In-flight call table: sn → pending call, plus an abort-key index.
//!
//! A pending call settles exactly once: through [`PendingCalls::resolve`],
//! through the caller's timeout (which removes it first), or through
//! [`PendingCalls::fail_all`] on disconnect. An aborted call never settles:
//! its return channel is dropped unused and any late reply for its sn is
//! discarded by the table.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ApiReturn, RpcError};

type OnAbort = Box<dyn FnOnce() + Send>;

/// One outstanding `call_api`, waiting for its `res` or `err`.
pub struct PendingCall {
    /// Sequence number, unique within the connection.
    pub sn: u32,
    /// Name of the API being called.
    pub api_name: String,
    /// The original request value.
    pub req: Value,
    /// Optional grouping key for bulk aborts.
    pub abort_key: Option<String>,
    aborted: Arc<AtomicBool>,
    ret_tx: Option<oneshot::Sender<ApiReturn<Value>>>,
    on_abort: Option<OnAbort>,
}

impl PendingCall {
    /// Create a pending call plus the receiver its caller awaits and the
    /// abort flag the caller re-checks after every suspension point.
    pub fn new(
        sn: u32,
        api_name: impl Into<String>,
        req: Value,
        abort_key: Option<String>,
    ) -> (Self, oneshot::Receiver<ApiReturn<Value>>, Arc<AtomicBool>) {
        let (ret_tx, ret_rx) = oneshot::channel();
        let aborted = Arc::new(AtomicBool::new(false));
        let call = Self {
            sn,
            api_name: api_name.into(),
            req,
            abort_key,
            aborted: aborted.clone(),
            ret_tx: Some(ret_tx),
            on_abort: None,
        };
        (call, ret_rx, aborted)
    }

    /// Install a hook fired when this call is aborted.
    pub fn set_on_abort(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_abort = Some(Box::new(hook));
    }

    fn settle(mut self, ret: ApiReturn<Value>) -> bool {
        match self.ret_tx.take() {
            Some(tx) => tx.send(ret).is_ok(),
            None => false,
        }
    }

    fn abort(mut self) {
        self.aborted.store(true, Ordering::Release);
        // Dropping the sender unsettles the waiter; it must never resolve.
        self.ret_tx = None;
        if let Some(hook) = self.on_abort.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("sn", &self.sn)
            .field("api_name", &self.api_name)
            .field("abort_key", &self.abort_key)
            .finish()
    }
}

#[derive(Default)]
struct State {
    by_sn: HashMap<u32, PendingCall>,
    by_key: HashMap<String, HashSet<u32>>,
}

/// The connection's table of in-flight calls.
pub struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Insert a call; both indexes are updated.
    pub fn insert(&self, call: PendingCall) {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = &call.abort_key {
            state.by_key.entry(key.clone()).or_default().insert(call.sn);
        }
        state.by_sn.insert(call.sn, call);
    }

    /// Remove a call without settling or aborting it.
    pub fn remove(&self, sn: u32) -> Option<PendingCall> {
        let mut state = self.state.lock().unwrap();
        Self::detach(&mut state, sn)
    }

    fn detach(state: &mut State, sn: u32) -> Option<PendingCall> {
        let call = state.by_sn.remove(&sn)?;
        if let Some(key) = &call.abort_key {
            if let Some(set) = state.by_key.get_mut(key) {
                set.remove(&sn);
                if set.is_empty() {
                    state.by_key.remove(key);
                }
            }
        }
        Some(call)
    }

    /// Settle the call for `sn` with `ret`.
    ///
    /// Returns false when the sn is unknown (already settled, timed out,
    /// or aborted); the reply should then be dropped.
    pub fn resolve(&self, sn: u32, ret: ApiReturn<Value>) -> bool {
        match self.remove(sn) {
            Some(call) => call.settle(ret),
            None => false,
        }
    }

    /// Abort the call for `sn`: remove it, mark it aborted, fire its
    /// abort hook. Its caller never settles. Idempotent.
    pub fn abort(&self, sn: u32) {
        if let Some(call) = self.remove(sn) {
            call.abort();
        }
    }

    /// Abort every call registered under `key`.
    pub fn abort_by_key(&self, key: &str) {
        let sns: Vec<u32> = {
            let state = self.state.lock().unwrap();
            match state.by_key.get(key) {
                Some(set) => set.iter().copied().collect(),
                None => return,
            }
        };
        for sn in sns {
            self.abort(sn);
        }
    }

    /// Abort every in-flight call.
    pub fn abort_all(&self) {
        let sns: Vec<u32> = self.state.lock().unwrap().by_sn.keys().copied().collect();
        for sn in sns {
            self.abort(sn);
        }
    }

    /// Settle every in-flight call with a clone of `err`.
    ///
    /// Used on disconnect so every caller observes the same network error.
    pub fn fail_all(&self, err: RpcError) {
        let calls: Vec<PendingCall> = {
            let mut state = self.state.lock().unwrap();
            let sns: Vec<u32> = state.by_sn.keys().copied().collect();
            sns.into_iter()
                .filter_map(|sn| Self::detach(&mut state, sn))
                .collect()
        };
        for call in calls {
            call.settle(ApiReturn::Err(err.clone()));
        }
    }

    /// The api name of the call waiting on `sn`, for the buffer decoder.
    pub fn service_name_of(&self, sn: u32) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .by_sn
            .get(&sn)
            .map(|c| c.api_name.clone())
    }

    /// Number of in-flight calls.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().by_sn.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
