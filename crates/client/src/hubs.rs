//! Hub RPC layer.
//!
//! [`HubClient`] wraps a [`Connection`] with the hub protocol: per-hub
//! proxies, method invocation correlated by callback id, server-to-client
//! event dispatch, and the shared key/value hub state that rides along on
//! every message. It plugs into the connection through the
//! [`MessageRouter`] capability rather than by specializing the connection
//! itself.
//!
//! Callback ids come from a counter owned by the client; the pending-callback
//! and hub tables are owned too, keyed case-insensitively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use hubwire_shared::{
    ClientError, HubError, HubInvocation, HubRegistration, HubResult, HubServerInvocation,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionState, MessageRouter};
use crate::operation::{self, Operation};
use crate::transport::ClientTransport;

/// How a pending invocation ends: with a server result, or synthetically
/// when the connection goes away underneath it.
enum HubOutcome {
    Result(HubResult),
    Aborted(String),
}

type ResultCallback = Box<dyn FnOnce(HubOutcome) + Send>;
type EventHandler = Arc<dyn Fn(&[Value]) -> Result<(), ClientError> + Send + Sync>;

struct HubInner {
    connection: Arc<Connection>,
    callbacks: Mutex<HashMap<String, ResultCallback>>,
    hubs: Mutex<HashMap<String, Arc<HubProxy>>>,
    next_callback_id: AtomicU64,
}

impl HubInner {
    fn register_callback(&self, callback: ResultCallback) -> String {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst).to_string();
        trace!(%id, "registering invocation callback");
        self.callbacks.lock().unwrap().insert(id.clone(), callback);
        id
    }

    fn remove_callback(&self, callback_id: &str) {
        trace!(%callback_id, "removing invocation callback");
        self.callbacks
            .lock()
            .unwrap()
            .remove(&callback_id.to_lowercase());
    }

    /// Complete every still-pending invocation with an error so no caller
    /// hangs past a connection-level failure.
    fn clear_invocations(&self, reason: &str) {
        let callbacks: Vec<(String, ResultCallback)> = {
            let mut map = self.callbacks.lock().unwrap();
            map.drain().collect()
        };
        if callbacks.is_empty() {
            return;
        }
        debug!(count = callbacks.len(), %reason, "flushing pending invocations");
        for (_, callback) in callbacks {
            callback(HubOutcome::Aborted(reason.to_string()));
        }
    }
}

/// Connection plugin translating inbound messages into hub semantics.
struct HubRouter {
    inner: Weak<HubInner>,
}

impl MessageRouter for HubRouter {
    fn handle_message(&self, message: &Value) -> Result<(), ClientError> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let Some(object) = message.as_object() else {
            return Ok(());
        };

        if object.contains_key("I") {
            let result: HubResult = serde_json::from_value(message.clone())?;
            if let Some(id) = result.normalized_id() {
                let callback = inner.callbacks.lock().unwrap().remove(&id);
                match callback {
                    Some(callback) => {
                        trace!(%id, "dispatching invocation result");
                        callback(HubOutcome::Result(result));
                    }
                    None => trace!(%id, "no pending invocation for result"),
                }
            }
            return Ok(());
        }

        let invocation: HubServerInvocation = serde_json::from_value(message.clone())?;
        let hub = inner
            .hubs
            .lock()
            .unwrap()
            .get(&invocation.hub.to_lowercase())
            .cloned();
        let Some(hub) = hub else {
            trace!(hub = %invocation.hub, "event for unknown hub");
            return Ok(());
        };
        if let Some(state) = &invocation.state {
            for (key, value) in state {
                hub.set_state(key.clone(), value.clone());
            }
        }
        hub.dispatch_event(&invocation.method, &invocation.args)
    }

    fn connection_closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.clear_invocations("Connection closed");
        }
    }

    fn reconnecting(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.clear_invocations("Reconnecting");
        }
    }

    fn connection_data(&self) -> Option<String> {
        let inner = self.inner.upgrade()?;
        let hubs = inner.hubs.lock().unwrap();
        let registrations: Vec<HubRegistration> = hubs
            .keys()
            .map(|name| HubRegistration { name: name.clone() })
            .collect();
        serde_json::to_string(&registrations).ok()
    }
}

/// A connection speaking the hub protocol.
pub struct HubClient {
    inner: Arc<HubInner>,
}

impl HubClient {
    /// Connect to `url` with the conventional hub path appended.
    pub fn new(url: &str) -> Self {
        Self::with_options(url, None, true)
    }

    /// Full-control constructor: optional custom query string, and whether
    /// to append the conventional hub path to the base URL.
    pub fn with_options(url: &str, query_string: Option<String>, use_default_path: bool) -> Self {
        let mut url = url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        if use_default_path {
            url.push_str("signalr");
        }
        let connection = Connection::with_query_string(url, query_string);
        let inner = Arc::new(HubInner {
            connection,
            callbacks: Mutex::new(HashMap::new()),
            hubs: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(0),
        });
        let router = HubRouter {
            inner: Arc::downgrade(&inner),
        };
        inner.connection.set_message_router(Arc::new(router));
        Self { inner }
    }

    /// The underlying connection, for lifecycle calls and event handlers.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.connection
    }

    pub fn start(&self) -> Arc<Operation<()>> {
        self.inner.connection.start()
    }

    pub fn start_with(&self, transport: Arc<dyn ClientTransport>) -> Arc<Operation<()>> {
        self.inner.connection.start_with(transport)
    }

    pub fn stop(&self) {
        self.inner.connection.stop();
    }

    /// Create (or fetch) the proxy for a named hub.
    ///
    /// Hubs must be declared before the connection starts: the set of hub
    /// names is what negotiation announces to the server.
    pub fn create_proxy(&self, hub_name: &str) -> Result<Arc<HubProxy>, ClientError> {
        let state = self.inner.connection.state();
        if state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(state.to_string()));
        }
        let folded = hub_name.to_lowercase();
        let mut hubs = self.inner.hubs.lock().unwrap();
        if let Some(existing) = hubs.get(&folded) {
            return Ok(existing.clone());
        }
        debug!(hub = %folded, "creating hub proxy");
        let proxy = Arc::new(HubProxy {
            name: hub_name.to_string(),
            client: Arc::downgrade(&self.inner),
            subscriptions: Mutex::new(HashMap::new()),
            state: Mutex::new(Map::new()),
        });
        hubs.insert(folded, proxy.clone());
        Ok(proxy)
    }
}

/// Client-side handle to one named server hub.
pub struct HubProxy {
    name: String,
    client: Weak<HubInner>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
    state: Mutex<Map<String, Value>>,
}

impl HubProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set one entry of the shared hub state.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.state.lock().unwrap().insert(key.into(), value);
    }

    /// Raw value of one hub-state entry.
    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().get(key).cloned()
    }

    /// Decoded value of one hub-state entry.
    pub fn state_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ClientError> {
        match self.state_value(key) {
            None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    fn apply_state(&self, update: Map<String, Value>) {
        let mut state = self.state.lock().unwrap();
        for (key, value) in update {
            state.insert(key, value);
        }
    }

    /// The subscription for an event name (case-insensitive). Repeated
    /// calls return the same subscription, accumulating handlers.
    pub fn subscribe(&self, event: &str) -> Arc<Subscription> {
        let folded = event.to_lowercase();
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions
            .entry(folded)
            .or_insert_with(|| Arc::new(Subscription::new()))
            .clone()
    }

    /// Drop every handler attached to an event.
    pub fn remove_subscription(&self, event: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .remove(&event.to_lowercase());
    }

    fn dispatch_event(&self, event: &str, args: &[Value]) -> Result<(), ClientError> {
        let subscription = self
            .subscriptions
            .lock()
            .unwrap()
            .get(&event.to_lowercase())
            .cloned();
        match subscription {
            Some(subscription) => subscription.dispatch(args),
            None => Ok(()),
        }
    }

    /// Invoke a hub method. The returned operation completes when the
    /// correlated result arrives; cancelling it drops the registration so a
    /// late reply is ignored.
    pub fn invoke(self: &Arc<Self>, method: &str, args: Vec<Value>) -> Arc<Operation<Value, HubError>> {
        let Some(inner) = self.client.upgrade() else {
            return Operation::failed(HubError::ConnectionClosed("hub client dropped".into()));
        };
        debug!(hub = %self.name, %method, "invoking hub method");

        let op: Arc<Operation<Value, HubError>> = Operation::new();
        let callback_id = {
            let proxy = self.clone();
            let op = op.clone();
            inner.register_callback(Box::new(move |outcome| match outcome {
                HubOutcome::Aborted(reason) => op.set_error(HubError::ConnectionClosed(reason)),
                HubOutcome::Result(result) => match result.error {
                    Some(message) => {
                        if result.is_hub_exception {
                            op.set_error(HubError::HubException {
                                message,
                                data: result.error_data,
                            });
                        } else {
                            op.set_error(HubError::Remote(message));
                        }
                    }
                    None => {
                        if let Some(state) = result.state {
                            proxy.apply_state(state);
                        }
                        op.set_result(result.result.unwrap_or(Value::Null));
                    }
                },
            }))
        };

        let state_snapshot = {
            let state = self.state.lock().unwrap();
            if state.is_empty() {
                None
            } else {
                Some(state.clone())
            }
        };
        let envelope = HubInvocation {
            callback_id: callback_id.clone(),
            hub: self.name.clone(),
            method: method.to_string(),
            args,
            state: state_snapshot,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                inner.remove_callback(&callback_id);
                return Operation::failed(HubError::Client(err.into()));
            }
        };

        {
            let client = self.client.clone();
            let callback_id = callback_id.clone();
            op.on_cancelled(move || {
                if let Some(inner) = client.upgrade() {
                    inner.remove_callback(&callback_id);
                }
            });
        }

        let send_op = inner.connection.send(payload);
        {
            let target = Arc::downgrade(&op);
            send_op.on_error(move |err| {
                if let Some(op) = target.upgrade() {
                    op.set_error(HubError::Client(err.clone()));
                }
            });
        }

        op
    }

    /// Invoke a hub method and decode the result into `R`.
    pub fn invoke_typed<R>(
        self: &Arc<Self>,
        method: &str,
        args: Vec<Value>,
    ) -> Arc<Operation<R, HubError>>
    where
        R: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let raw = self.invoke(method, args);
        let typed: Arc<Operation<R, HubError>> = Operation::new();
        operation::link(&typed, &raw);
        {
            let typed = typed.clone();
            raw.on_done(move |value| {
                let decoded: R = serde_json::from_value(value.clone())
                    .map_err(|err| HubError::Client(ClientError::from(err)))?;
                typed.set_result(decoded);
                Ok(())
            });
        }
        typed
    }

    // ── Typed event registration ────────────────────────────────────────
    //
    // One method per handler arity. The wire argument count must match the
    // declared arity exactly; a mismatch fails that invocation.

    pub fn on(self: &Arc<Self>, event: &str, handler: impl Fn() + Send + Sync + 'static) {
        let event_name = event.to_string();
        self.subscribe(event).received(move |args| {
            check_arity(&event_name, args, 0)?;
            handler();
            Ok(())
        });
    }

    pub fn on1<A1>(self: &Arc<Self>, event: &str, handler: impl Fn(A1) + Send + Sync + 'static)
    where
        A1: DeserializeOwned,
    {
        let event_name = event.to_string();
        self.subscribe(event).received(move |args| {
            check_arity(&event_name, args, 1)?;
            handler(decode_arg(&args[0])?);
            Ok(())
        });
    }

    pub fn on2<A1, A2>(
        self: &Arc<Self>,
        event: &str,
        handler: impl Fn(A1, A2) + Send + Sync + 'static,
    ) where
        A1: DeserializeOwned,
        A2: DeserializeOwned,
    {
        let event_name = event.to_string();
        self.subscribe(event).received(move |args| {
            check_arity(&event_name, args, 2)?;
            handler(decode_arg(&args[0])?, decode_arg(&args[1])?);
            Ok(())
        });
    }

    pub fn on3<A1, A2, A3>(
        self: &Arc<Self>,
        event: &str,
        handler: impl Fn(A1, A2, A3) + Send + Sync + 'static,
    ) where
        A1: DeserializeOwned,
        A2: DeserializeOwned,
        A3: DeserializeOwned,
    {
        let event_name = event.to_string();
        self.subscribe(event).received(move |args| {
            check_arity(&event_name, args, 3)?;
            handler(
                decode_arg(&args[0])?,
                decode_arg(&args[1])?,
                decode_arg(&args[2])?,
            );
            Ok(())
        });
    }

    pub fn on4<A1, A2, A3, A4>(
        self: &Arc<Self>,
        event: &str,
        handler: impl Fn(A1, A2, A3, A4) + Send + Sync + 'static,
    ) where
        A1: DeserializeOwned,
        A2: DeserializeOwned,
        A3: DeserializeOwned,
        A4: DeserializeOwned,
    {
        let event_name = event.to_string();
        self.subscribe(event).received(move |args| {
            check_arity(&event_name, args, 4)?;
            handler(
                decode_arg(&args[0])?,
                decode_arg(&args[1])?,
                decode_arg(&args[2])?,
                decode_arg(&args[3])?,
            );
            Ok(())
        });
    }

    pub fn on5<A1, A2, A3, A4, A5>(
        self: &Arc<Self>,
        event: &str,
        handler: impl Fn(A1, A2, A3, A4, A5) + Send + Sync + 'static,
    ) where
        A1: DeserializeOwned,
        A2: DeserializeOwned,
        A3: DeserializeOwned,
        A4: DeserializeOwned,
        A5: DeserializeOwned,
    {
        let event_name = event.to_string();
        self.subscribe(event).received(move |args| {
            check_arity(&event_name, args, 5)?;
            handler(
                decode_arg(&args[0])?,
                decode_arg(&args[1])?,
                decode_arg(&args[2])?,
                decode_arg(&args[3])?,
                decode_arg(&args[4])?,
            );
            Ok(())
        });
    }
}

fn check_arity(event: &str, args: &[Value], expected: usize) -> Result<(), ClientError> {
    if args.len() != expected {
        return Err(ClientError::Handler(format!(
            "event '{event}' expects {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn decode_arg<T: DeserializeOwned>(value: &Value) -> Result<T, ClientError> {
    serde_json::from_value(value.clone()).map_err(ClientError::from)
}

/// Ordered list of handlers for one event name.
pub struct Subscription {
    handlers: Mutex<Vec<EventHandler>>,
}

impl Subscription {
    fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Append a handler. Handlers run in registration order; the first
    /// failure stops the remaining handlers for that invocation.
    pub fn received(
        &self,
        handler: impl Fn(&[Value]) -> Result<(), ClientError> + Send + Sync + 'static,
    ) {
        self.handlers.lock().unwrap().push(Arc::new(handler));
    }

    pub(crate) fn dispatch(&self, args: &[Value]) -> Result<(), ClientError> {
        let handlers: Vec<EventHandler> = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(args)?;
        }
        Ok(())
    }
}
