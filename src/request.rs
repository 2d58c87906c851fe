//! Correlation of inbound frames to waiting continuations.
//!
//! Two address spaces: message tags (one-shot, used by the handshake and by
//! request/response exchanges) and structural paths into decoded payloads of
//! the shape `[name, attrs_map, children]` (one-shot or persistent, used by
//! the server's pushed data). `dispatch` tries exact tag, then structure,
//! then gives up into a logged sink.

use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::client::Client;

/// Errors surfaced by response waits.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("wait cancelled, connection is going away")]
    Cancelled,
}

/// A callback invoked for every structurally matching payload.
pub type Handler = Box<dyn Fn(&Value) + Send + Sync>;

/// A structural address: function name, optional attribute, optional child
/// tag. `("action", add=last)` addresses payloads like
/// `["action", {"add": "last"}, [...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerPath {
    pub function: String,
    pub attr_key: Option<String>,
    pub attr_value: Option<String>,
    pub child: Option<String>,
}

impl HandlerPath {
    pub fn new(function: &str) -> Self {
        Self {
            function: function.to_string(),
            attr_key: None,
            attr_value: None,
            child: None,
        }
    }

    pub fn with_attr(function: &str, key: &str, value: &str) -> Self {
        Self {
            attr_key: Some(key.to_string()),
            attr_value: Some(value.to_string()),
            ..Self::new(function)
        }
    }

    pub fn child(mut self, child: &str) -> Self {
        self.child = Some(child.to_string());
        self
    }

    fn function_key(&self) -> String {
        format!("function:{}", self.function)
    }

    fn attr_subkey(&self) -> String {
        match (&self.attr_key, &self.attr_value) {
            (Some(k), Some(v)) => format!("{k}:{v}"),
            (Some(k), None) => k.clone(),
            _ => String::new(),
        }
    }

    fn child_subkey(&self) -> String {
        self.child.clone().unwrap_or_default()
    }
}

enum Continuation {
    Once(oneshot::Sender<Value>),
    Persistent(Handler),
}

// function:<name> -> attr subkey -> child subkey -> registration-ordered entries
type StructuralMap = HashMap<String, HashMap<String, HashMap<String, Vec<Continuation>>>>;

/// Pending awaiters and handlers, owned by the supervisor and guarded by a
/// single lock.
#[derive(Default)]
pub(crate) struct Registry {
    tag_waiters: HashMap<String, oneshot::Sender<Value>>,
    structural: StructuralMap,
}

impl Registry {
    fn slot_mut(&mut self, path: &HandlerPath) -> &mut Vec<Continuation> {
        self.structural
            .entry(path.function_key())
            .or_default()
            .entry(path.attr_subkey())
            .or_default()
            .entry(path.child_subkey())
            .or_default()
    }

    /// Delivers a payload to the first matching structural slot. Returns
    /// false when nothing matched (or the slot had already been consumed).
    fn dispatch_structural(&mut self, payload: &Value) -> bool {
        let Some(arr) = payload.as_array() else {
            return false;
        };
        let Some(name) = arr.first().and_then(Value::as_str) else {
            return false;
        };
        let function_key = format!("function:{name}");
        let Some(attr_map) = self.structural.get_mut(&function_key) else {
            return false;
        };

        // Attribute selection walks the payload's own key order: first key
        // with a `k:v` subkey registered, then first with a bare `k` subkey,
        // then the empty subkey.
        let attrs = arr.get(1).and_then(Value::as_object);
        let mut subkey: Option<String> = None;
        if let Some(attrs) = attrs {
            for (k, v) in attrs {
                if let Some(s) = v.as_str() {
                    let kv = format!("{k}:{s}");
                    if attr_map.contains_key(kv.as_str()) {
                        subkey = Some(kv);
                        break;
                    }
                }
            }
            if subkey.is_none() {
                for k in attrs.keys() {
                    if attr_map.contains_key(k.as_str()) {
                        subkey = Some(k.clone());
                        break;
                    }
                }
            }
        }
        let subkey = match subkey {
            Some(s) => s,
            None if attr_map.contains_key("") => String::new(),
            None => return false,
        };
        let Some(child_map) = attr_map.get_mut(&subkey) else {
            return false;
        };

        // Children match on the first grandchild's head, `payload[2][0][0]`.
        let child_head = arr
            .get(2)
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(Value::as_array)
            .and_then(|g| g.first())
            .and_then(Value::as_str);
        let child_key = match child_head {
            Some(h) if child_map.contains_key(h) => h.to_string(),
            _ if child_map.contains_key("") => String::new(),
            _ => return false,
        };
        let Some(entries) = child_map.get_mut(&child_key) else {
            return false;
        };

        let mut delivered = false;
        let mut kept = Vec::new();
        for entry in entries.drain(..) {
            match entry {
                Continuation::Once(tx) => {
                    // Consumed even if the receiver is gone; a dead awaiter
                    // must not shadow the slot forever.
                    let _ = tx.send(payload.clone());
                    delivered = true;
                }
                Continuation::Persistent(handler) => {
                    handler(payload);
                    delivered = true;
                    kept.push(Continuation::Persistent(handler));
                }
            }
        }
        *entries = kept;
        if entries.is_empty() {
            child_map.remove(&child_key);
        }
        if child_map.is_empty() {
            attr_map.remove(&subkey);
        }
        if attr_map.is_empty() {
            self.structural.remove(&function_key);
        }

        delivered
    }
}

impl Client {
    /// Generates a new correlation tag, `<unix-seconds>.--<counter>`.
    pub fn generate_message_tag(&self) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let count = self.tag_counter.fetch_add(1, Ordering::Relaxed);
        format!("{ts}.--{count}")
    }

    /// Registers interest in `tag` before the matching request goes out.
    pub(crate) async fn register_tag_waiter(&self, tag: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.registry
            .lock()
            .await
            .tag_waiters
            .insert(tag.to_string(), tx);
        rx
    }

    /// Awaits a tagged reply. `None` waits indefinitely; on expiry the
    /// waiter is removed and `Timeout` surfaces.
    pub(crate) async fn wait_response(
        &self,
        tag: &str,
        rx: oneshot::Receiver<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value, WaitError> {
        match deadline {
            None => rx.await.map_err(|_| WaitError::Cancelled),
            Some(deadline) => match timeout(deadline, rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(WaitError::Cancelled),
                Err(_) => {
                    self.registry.lock().await.tag_waiters.remove(tag);
                    Err(WaitError::Timeout)
                }
            },
        }
    }

    /// Registers a one-shot awaiter at a structural path.
    pub(crate) async fn register_structural_waiter(
        &self,
        path: &HandlerPath,
    ) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.registry
            .lock()
            .await
            .slot_mut(path)
            .push(Continuation::Once(tx));
        rx
    }

    /// Registers a persistent handler. Handlers run on the frame pump and
    /// must not block.
    pub async fn register_handler(&self, path: HandlerPath, handler: Handler) {
        self.registry
            .lock()
            .await
            .slot_mut(&path)
            .push(Continuation::Persistent(handler));
    }

    /// Drops everything registered at `path`.
    pub async fn deregister_handler(&self, path: &HandlerPath) {
        let mut registry = self.registry.lock().await;
        if let Some(attr_map) = registry.structural.get_mut(&path.function_key()) {
            if let Some(child_map) = attr_map.get_mut(&path.attr_subkey()) {
                child_map.remove(&path.child_subkey());
                if child_map.is_empty() {
                    attr_map.remove(&path.attr_subkey());
                }
            }
            if attr_map.is_empty() {
                registry.structural.remove(&path.function_key());
            }
        }
    }

    /// Routes a decoded frame: exact tag first, structure second, logged
    /// sink last. The read pump calls this for every decoded inbound frame;
    /// hosts with their own transport can feed decoded payloads through it.
    pub async fn dispatch(&self, tag: &str, payload: Value) {
        let mut registry = self.registry.lock().await;
        if let Some(waiter) = registry.tag_waiters.remove(tag) {
            if waiter.send(payload).is_err() {
                warn!(target: "Client/Recv", "Awaiter for tag {tag} went away before delivery");
            }
            return;
        }
        if registry.dispatch_structural(&payload) {
            return;
        }
        debug!(target: "Client/Recv", "Unhandled frame {tag}: {payload}");
    }

    /// Fails every pending awaiter with `Cancelled` and forgets all
    /// handlers. Called when the connection goes away.
    pub(crate) async fn drain_waiters(&self) {
        let mut registry = self.registry.lock().await;
        // Dropping the senders resolves the receivers with Cancelled.
        registry.tag_waiters.clear();
        registry.structural.clear();
    }

    #[cfg(test)]
    pub(crate) async fn registry_is_empty(&self) -> bool {
        let registry = self.registry.lock().await;
        registry.tag_waiters.is_empty() && registry.structural.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::test_client;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tag_await_resolves_exactly_once() {
        let client = test_client();
        let rx = client.register_tag_waiter("abc.--1").await;
        client.dispatch("abc.--1", json!({"status": 200})).await;
        let value = client.wait_response("abc.--1", rx, None).await.unwrap();
        assert_eq!(value["status"], 200);

        // Second dispatch with the same tag falls through to the sink.
        client.dispatch("abc.--1", json!({"status": 200})).await;
        assert!(client.registry.lock().await.tag_waiters.is_empty());
    }

    #[tokio::test]
    async fn tag_await_times_out_and_removes_the_waiter() {
        let client = test_client();
        let rx = client.register_tag_waiter("t").await;
        let err = client
            .wait_response("t", rx, Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout));
        assert!(client.registry.lock().await.tag_waiters.is_empty());
    }

    #[tokio::test]
    async fn drained_waiters_resolve_with_cancelled() {
        let client = test_client();
        let rx = client.register_tag_waiter("t").await;
        client.drain_waiters().await;
        let err = client.wait_response("t", rx, None).await.unwrap_err();
        assert!(matches!(err, WaitError::Cancelled));
    }

    #[tokio::test]
    async fn structural_match_prefers_key_value_over_bare_key() {
        let client = test_client();
        let hits = Arc::new(AtomicUsize::new(0));

        let kv_hits = hits.clone();
        client
            .register_handler(
                HandlerPath::with_attr("action", "add", "last"),
                Box::new(move |_| {
                    kv_hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        client
            .register_handler(
                HandlerPath {
                    attr_key: Some("add".into()),
                    attr_value: None,
                    ..HandlerPath::new("action")
                },
                Box::new(|_| panic!("bare-key handler must lose to key:value")),
            )
            .await;

        client
            .dispatch("x", json!(["action", {"add": "last"}, []]))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attribute_order_follows_the_payload() {
        let client = test_client();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (key, value) in [("first", "a"), ("second", "b")] {
            let seen = seen.clone();
            let label = key;
            client
                .register_handler(
                    HandlerPath::with_attr("action", key, value),
                    Box::new(move |_| seen.lock().unwrap().push(label)),
                )
                .await;
        }

        // Both subkeys are registered; the payload's own key order decides.
        client
            .dispatch("x", json!(["action", {"second": "b", "first": "a"}, []]))
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn empty_subkey_catches_unmatched_attributes() {
        let client = test_client();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        client
            .register_handler(
                HandlerPath::new("Cmd"),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        client
            .dispatch("x", json!(["Cmd", {"type": "challenge"}, []]))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn child_head_selects_the_slot() {
        let client = test_client();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        client
            .register_handler(
                HandlerPath::with_attr("action", "add", "relay").child("message"),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        client
            .dispatch(
                "x",
                json!(["action", {"add": "relay"}, [["message", {}, null]]]),
            )
            .await;
        client
            .dispatch(
                "x",
                json!(["action", {"add": "relay"}, [["received", {}, null]]]),
            )
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ties_deliver_in_registration_order() {
        let client = test_client();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for label in ["one", "two"] {
            let seen = seen.clone();
            client
                .register_handler(
                    HandlerPath::with_attr("action", "add", "unread"),
                    Box::new(move |_| seen.lock().unwrap().push(label)),
                )
                .await;
        }

        client
            .dispatch("x", json!(["action", {"add": "unread"}, []]))
            .await;
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn structural_one_shot_is_consumed() {
        let client = test_client();
        let path = HandlerPath::with_attr("response", "type", "chat");
        let rx = client.register_structural_waiter(&path).await;

        let payload = json!(["response", {"type": "chat"}, []]);
        client.dispatch("x", payload.clone()).await;
        assert_eq!(rx.await.unwrap(), payload);

        // The slot is gone; a second frame falls through to the sink.
        client.dispatch("x", payload).await;
        assert!(client.registry.lock().await.structural.is_empty());
    }

    #[tokio::test]
    async fn deregister_removes_the_slot() {
        let client = test_client();
        let path = HandlerPath::with_attr("action", "add", "last");
        client
            .register_handler(
                path.clone(),
                Box::new(|_| panic!("deregistered handler must not run")),
            )
            .await;
        client.deregister_handler(&path).await;
        client
            .dispatch("x", json!(["action", {"add": "last"}, []]))
            .await;
        assert!(client.registry.lock().await.structural.is_empty());
    }
}
