//! Name-keyed subscriber table for server-push messages.
//!
//! Subscribers are `(handler, ctx)` pairs kept per message name. The same
//! pair registered twice is a no-op; delivery is synchronous and in
//! registration order; a panicking subscriber does not prevent delivery to
//! the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// A message subscriber. Receives the message name and its body.
pub type MsgHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Subscriber {
    handler: MsgHandler,
    ctx: Option<usize>,
    once: bool,
}

impl Subscriber {
    fn matches(&self, handler: &MsgHandler, ctx: Option<usize>) -> bool {
        Arc::ptr_eq(&self.handler, handler) && self.ctx == ctx
    }
}

/// Subscriber table keyed by message name.
pub struct MsgEmitter {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MsgEmitter {
    /// Create an empty emitter.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a subscriber for `name`.
    ///
    /// Registering the same `(handler, ctx)` pair twice is a no-op.
    pub fn on(&self, name: &str, handler: MsgHandler, ctx: Option<usize>) {
        self.attach(name, handler, ctx, false);
    }

    /// Like [`on`](Self::on), but the subscriber detaches after one delivery.
    pub fn once(&self, name: &str, handler: MsgHandler, ctx: Option<usize>) {
        self.attach(name, handler, ctx, true);
    }

    fn attach(&self, name: &str, handler: MsgHandler, ctx: Option<usize>, once: bool) {
        let mut subs = self.subscribers.lock().unwrap();
        let list = subs.entry(name.to_string()).or_default();
        if list.iter().any(|s| s.matches(&handler, ctx)) {
            return;
        }
        list.push(Subscriber { handler, ctx, once });
    }

    /// Remove matching subscribers.
    ///
    /// With `handler = None` every subscriber of `name` is removed;
    /// otherwise only those whose `(handler, ctx)` pair matches.
    pub fn off(&self, name: &str, handler: Option<&MsgHandler>, ctx: Option<usize>) {
        let mut subs = self.subscribers.lock().unwrap();
        match handler {
            None => {
                subs.remove(name);
            }
            Some(handler) => {
                if let Some(list) = subs.get_mut(name) {
                    list.retain(|s| !s.matches(handler, ctx));
                    if list.is_empty() {
                        subs.remove(name);
                    }
                }
            }
        }
    }

    /// Deliver `msg` to every subscriber of `name`, in registration order.
    ///
    /// Returns the number of subscribers reached.
    pub fn emit(&self, name: &str, msg: &Value) -> usize {
        // Snapshot the list so subscribers may (un)subscribe re-entrantly.
        let snapshot: Vec<(MsgHandler, Option<usize>, bool)> = {
            let subs = self.subscribers.lock().unwrap();
            match subs.get(name) {
                Some(list) => list
                    .iter()
                    .map(|s| (s.handler.clone(), s.ctx, s.once))
                    .collect(),
                None => return 0,
            }
        };

        for (handler, _, _) in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(name, msg))).is_err() {
                tracing::error!("Message handler for '{}' panicked", name);
            }
        }

        // Detach one-shot subscribers that just fired.
        let fired_once: Vec<_> = snapshot
            .iter()
            .filter(|(_, _, once)| *once)
            .map(|(h, ctx, _)| (h.clone(), *ctx))
            .collect();
        if !fired_once.is_empty() {
            let mut subs = self.subscribers.lock().unwrap();
            if let Some(list) = subs.get_mut(name) {
                list.retain(|s| {
                    !(s.once && fired_once.iter().any(|(h, ctx)| s.matches(h, *ctx)))
                });
                if list.is_empty() {
                    subs.remove(name);
                }
            }
        }

        snapshot.len()
    }

    /// Number of subscribers currently attached to `name`.
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(name)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Names that currently have at least one subscriber.
    pub fn subscribed_names(&self) -> Vec<String> {
        self.subscribers.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for MsgEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(hits: Arc<AtomicUsize>) -> MsgHandler {
        Arc::new(move |_name, _msg| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let emitter = MsgEmitter::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 1..=3 {
            let order = order.clone();
            emitter.on(
                "Chat",
                Arc::new(move |_, _| order.lock().unwrap().push(tag)),
                None,
            );
        }

        assert_eq!(emitter.emit("Chat", &json!({"text": "hi"})), 3);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_pair_is_noop() {
        let emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(hits.clone());

        emitter.on("Chat", handler.clone(), None);
        emitter.on("Chat", handler.clone(), None);
        assert_eq!(emitter.subscriber_count("Chat"), 1);

        // A different ctx makes it a different pair.
        emitter.on("Chat", handler, Some(7));
        assert_eq!(emitter.subscriber_count("Chat"), 2);
    }

    #[test]
    fn test_once_detaches_after_delivery() {
        let emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.once("Chat", counting_handler(hits.clone()), None);

        emitter.emit("Chat", &json!(null));
        emitter.emit("Chat", &json!(null));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.subscriber_count("Chat"), 0);
    }

    #[test]
    fn test_off_by_name_only() {
        let emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        emitter.on("A", counting_handler(hits.clone()), None);
        emitter.on("A", counting_handler(hits.clone()), None);
        emitter.on("B", counting_handler(hits.clone()), None);

        emitter.off("A", None, None);
        assert_eq!(emitter.subscriber_count("A"), 0);
        assert_eq!(emitter.subscriber_count("B"), 1);
    }

    #[test]
    fn test_off_by_pair() {
        let emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = counting_handler(hits.clone());
        let h2 = counting_handler(hits.clone());

        emitter.on("A", h1.clone(), None);
        emitter.on("A", h2, None);
        emitter.off("A", Some(&h1), None);

        assert_eq!(emitter.subscriber_count("A"), 1);
        emitter.emit("A", &json!(null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_rest() {
        let emitter = MsgEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        emitter.on("A", Arc::new(|_, _| panic!("bad subscriber")), None);
        emitter.on("A", counting_handler(hits.clone()), None);

        emitter.emit("A", &json!(null));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_unknown_name() {
        let emitter = MsgEmitter::new();
        assert_eq!(emitter.emit("Nope", &json!(null)), 0);
    }
}
