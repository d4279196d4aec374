//! Ordered async middleware chains with early cancel.
//!
//! A [`Flow`] is a list of async middlewares `(data) -> FlowResult<data>`
//! executed strictly in registration order. A middleware may:
//! - return `Ok(Some(data))` to pass (possibly mutated) data onward,
//! - return `Ok(None)` to cancel the chain (the enclosing action must
//!   also cancel),
//! - return `Err(_)` to report a failure, which is routed to the flow's
//!   error hook and cancels the chain.
//!
//! Middlewares are never invoked concurrently within one `exec`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::WirelinkError;

/// Boxed future used at dyn seams (flow nodes, transports, API handlers).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of one middleware: pass data on, cancel, or fail.
pub type FlowResult<T> = Result<Option<T>, WirelinkError>;

type FlowNode<T> = Arc<dyn Fn(T) -> BoxFuture<'static, FlowResult<T>> + Send + Sync>;
type FlowErrorHook = Arc<dyn Fn(&WirelinkError) + Send + Sync>;

/// An ordered chain of async middlewares over a data type `T`.
pub struct Flow<T> {
    nodes: Vec<FlowNode<T>>,
    on_error: Option<FlowErrorHook>,
}

impl<T: Send + 'static> Flow<T> {
    /// Create an empty flow.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            on_error: None,
        }
    }

    /// Append a middleware. Execution order is FIFO by registration.
    pub fn push<F, Fut>(&mut self, node: F) -> &mut Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlowResult<T>> + Send + 'static,
    {
        self.nodes.push(Arc::new(move |data| Box::pin(node(data))));
        self
    }

    /// Install the error hook invoked when a middleware returns `Err`.
    ///
    /// Without a hook, middleware failures are logged and the chain is
    /// canceled all the same.
    pub fn set_on_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&WirelinkError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Run every middleware in order.
    ///
    /// Returns `None` if any middleware canceled or failed; the caller
    /// must treat that as "cancel the enclosing action".
    pub async fn exec(&self, initial: T) -> Option<T> {
        let mut data = initial;
        for node in &self.nodes {
            match node(data).await {
                Ok(Some(next)) => data = next,
                Ok(None) => return None,
                Err(err) => {
                    match &self.on_error {
                        Some(hook) => hook(&err),
                        None => tracing::error!("Flow middleware failed: {}", err),
                    }
                    return None;
                }
            }
        }
        Some(data)
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<T: Send + 'static> Default for Flow<T> {
    fn default() -> Self {
        Self::new()
    }
}
