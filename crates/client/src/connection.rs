//! Connection state machine.
//!
//! A [`Connection`] owns exactly one [`ConnectionState`] at a time, mutated
//! only by compare-and-swap under the state lock. The start, negotiate and
//! transport-startup sequence is serialized by the lifecycle lock so a stop
//! cannot race a start that has not finished yet.
//!
//! All failure paths converge on [`Connection::on_transport_error`]: that is
//! the single place where the reconnect-or-disconnect decision is made.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hubwire_shared::{ClientError, NegotiationResponse, ReceivedEnvelope, PROTOCOL_VERSION};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::http::HttpRequest;
use crate::keepalive::{HeartbeatMonitor, KeepAliveData};
use crate::operation::{self, Operation};
use crate::transport::{automatic::AutomaticTransport, ClientTransport, DataCallback, StartMode};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Credential injection capability. Implementations decorate outgoing
/// requests (headers, cookies); the engine never looks inside.
pub trait Credentials: Send + Sync {
    fn prepare_request(&self, request: &mut HttpRequest);
}

/// Capability the hub layer registers on a connection instead of
/// subclassing it: message routing, lifecycle hooks, and the
/// connection-data value sent at negotiate time.
pub trait MessageRouter: Send + Sync {
    /// Route one inbound message. Errors are advisory.
    fn handle_message(&self, message: &Value) -> Result<(), ClientError>;

    /// The connection was torn down.
    fn connection_closed(&self);

    /// The connection is about to re-open its transport.
    fn reconnecting(&self);

    /// Value for the `connectionData` query parameter, computed fresh at
    /// negotiate time.
    fn connection_data(&self) -> Option<String> {
        None
    }
}

type Handler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;
type ReceivedHandler = Arc<dyn Fn(&Value) -> Result<(), ClientError> + Send + Sync>;
type StateChangedHandler = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    connected: Option<Handler>,
    reconnecting: Option<Handler>,
    reconnected: Option<Handler>,
    closed: Option<Handler>,
    connection_slow: Option<Handler>,
    error: Option<ErrorHandler>,
    received: Option<ReceivedHandler>,
    state_changed: Option<StateChangedHandler>,
}

/// Per-session identifiers, cleared wholesale on disconnect.
#[derive(Default)]
struct Session {
    connection_id: Option<String>,
    connection_token: Option<String>,
    message_id: Option<String>,
    groups_token: Option<String>,
    headers: HashMap<String, String>,
    credentials: Option<Arc<dyn Credentials>>,
}

/// State guarded by the lifecycle lock: everything involved in the
/// start/negotiate/start-transport and stop sequences.
#[derive(Default)]
struct Lifecycle {
    transport: Option<Arc<dyn ClientTransport>>,
    heartbeat: Option<Arc<HeartbeatMonitor>>,
    keep_alive: Option<KeepAliveData>,
    start_op: Option<Arc<Operation<()>>>,
    abort_op: Option<Arc<Operation<()>>>,
    aborting: bool,
}

/// One logical connection to a server.
pub struct Connection {
    url: String,
    query_string: Option<String>,
    state: Mutex<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
    session: Mutex<Session>,
    handlers: Mutex<Handlers>,
    router: Mutex<Option<Arc<dyn MessageRouter>>>,
    reconnect_on_error: AtomicBool,
}

impl Connection {
    /// Create a connection to `url`. A trailing slash is added if missing.
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Self::with_query_string(url, None)
    }

    /// Create a connection with a custom query string appended to every
    /// request.
    pub fn with_query_string(url: impl Into<String>, query_string: Option<String>) -> Arc<Self> {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        info!(%url, "initializing connection");
        Arc::new(Self {
            url,
            query_string,
            state: Mutex::new(ConnectionState::Disconnected),
            lifecycle: Mutex::new(Lifecycle::default()),
            session: Mutex::new(Session::default()),
            handlers: Mutex::new(Handlers::default()),
            router: Mutex::new(None),
            reconnect_on_error: AtomicBool::new(true),
        })
    }

    // ── Configuration ───────────────────────────────────────────────────

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn query_string(&self) -> Option<String> {
        self.query_string.clone()
    }

    /// Whether a cleanup-worthy error triggers a reconnect (default) or a
    /// disconnect.
    pub fn set_reconnect_on_error(&self, reconnect: bool) {
        self.reconnect_on_error.store(reconnect, Ordering::SeqCst);
    }

    pub fn set_credentials(&self, credentials: Arc<dyn Credentials>) {
        self.session.lock().unwrap().credentials = Some(credentials);
    }

    /// Add a header sent on every request of this connection.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.session
            .lock()
            .unwrap()
            .headers
            .insert(name.into(), value.into());
    }

    pub fn headers_snapshot(&self) -> Vec<(String, String)> {
        self.session
            .lock()
            .unwrap()
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Register the message-router capability (the hub layer uses this).
    pub fn set_message_router(&self, router: Arc<dyn MessageRouter>) {
        *self.router.lock().unwrap() = Some(router);
    }

    // ── Event handlers ──────────────────────────────────────────────────

    pub fn on_connected(&self, f: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().connected = Some(Arc::new(f));
    }

    pub fn on_reconnecting(&self, f: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().reconnecting = Some(Arc::new(f));
    }

    pub fn on_reconnected(&self, f: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().reconnected = Some(Arc::new(f));
    }

    pub fn on_closed(&self, f: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().closed = Some(Arc::new(f));
    }

    pub fn on_connection_slow(&self, f: impl Fn() + Send + Sync + 'static) {
        self.handlers.lock().unwrap().connection_slow = Some(Arc::new(f));
    }

    /// At most one connection-level error callback; receives the raw error.
    pub fn on_error(&self, f: impl Fn(&ClientError) + Send + Sync + 'static) {
        self.handlers.lock().unwrap().error = Some(Arc::new(f));
    }

    /// Handler for every application message. A returned error is surfaced
    /// as a non-fatal error notification; it does not tear down the
    /// connection.
    pub fn on_received(&self, f: impl Fn(&Value) -> Result<(), ClientError> + Send + Sync + 'static) {
        self.handlers.lock().unwrap().received = Some(Arc::new(f));
    }

    /// Observer for every state transition, with before and after values.
    /// Runs on engine threads; keep it passive.
    pub fn on_state_changed(
        &self,
        f: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) {
        self.handlers.lock().unwrap().state_changed = Some(Arc::new(f));
    }

    // ── Session identifiers ─────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.session.lock().unwrap().connection_id.clone()
    }

    pub fn connection_token(&self) -> Option<String> {
        self.session.lock().unwrap().connection_token.clone()
    }

    pub fn message_id(&self) -> Option<String> {
        self.session.lock().unwrap().message_id.clone()
    }

    pub(crate) fn set_message_id(&self, message_id: impl Into<String>) {
        self.session.lock().unwrap().message_id = Some(message_id.into());
    }

    pub fn groups_token(&self) -> Option<String> {
        self.session.lock().unwrap().groups_token.clone()
    }

    pub(crate) fn set_groups_token(&self, token: impl Into<String>) {
        self.session.lock().unwrap().groups_token = Some(token.into());
    }

    /// The `connectionData` value sent at negotiate time, provided by the
    /// registered router.
    pub fn connection_data(&self) -> Option<String> {
        let router = self.router.lock().unwrap().clone();
        router.and_then(|r| r.connection_data())
    }

    /// Decorate a request with this connection's headers and credentials.
    pub fn prepare_request(&self, mut request: HttpRequest) -> HttpRequest {
        for (name, value) in self.headers_snapshot() {
            request = request.header(name, value);
        }
        let credentials = self.session.lock().unwrap().credentials.clone();
        if let Some(credentials) = credentials {
            credentials.prepare_request(&mut request);
        }
        request
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the connection with automatic transport selection.
    pub fn start(self: &Arc<Self>) -> Arc<Operation<()>> {
        self.start_with(Arc::new(AutomaticTransport::new()))
    }

    /// Start the connection over a specific transport.
    ///
    /// Only the first call negotiates: while a start is already in flight
    /// (or complete), the same operation is returned unchanged.
    pub fn start_with(self: &Arc<Self>, transport: Arc<dyn ClientTransport>) -> Arc<Operation<()>> {
        let start_op = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if !self.change_state(ConnectionState::Disconnected, ConnectionState::Connecting) {
                trace!("start ignored: not disconnected");
                return lifecycle
                    .start_op
                    .clone()
                    .unwrap_or_else(|| Operation::failed(ClientError::InvalidState(self.state().to_string())));
            }
            info!(transport = transport.name(), "starting connection");
            lifecycle.transport = Some(transport.clone());
            let start_op: Arc<Operation<()>> = Operation::new();
            lifecycle.start_op = Some(start_op.clone());
            start_op
        };

        // Single error funnel for the whole start chain.
        {
            let conn = Arc::downgrade(self);
            start_op.on_error(move |err| {
                if let Some(conn) = conn.upgrade() {
                    conn.on_transport_error(err.clone(), true);
                }
            });
        }

        debug!("starting negotiation");
        let negotiation = transport.negotiate(self);
        operation::link(&start_op, &negotiation);

        let conn = self.clone();
        let op = start_op.clone();
        negotiation.on_done(move |response: &NegotiationResponse| {
            debug!(connection_id = %response.connection_id, "negotiation completed");
            if response.protocol_version != PROTOCOL_VERSION {
                op.set_error(ClientError::UnsupportedProtocol(
                    response.protocol_version.clone(),
                ));
                return Ok(());
            }
            {
                let mut session = conn.session.lock().unwrap();
                session.connection_id = Some(response.connection_id.clone());
                session.connection_token = Some(response.connection_token.clone());
            }
            let keep_alive = response.keep_alive().map(KeepAliveData::new);
            conn.start_transport(keep_alive, false);
            Ok(())
        });

        start_op
    }

    /// Open (or re-open) the transport stream, arming a fresh heartbeat
    /// monitor. When reconnecting, the previous monitor is stopped and the
    /// previous stream aborted before the state transition, so a late
    /// callback from the old stream cannot be mistaken for the new one.
    fn start_transport(self: &Arc<Self>, keep_alive: Option<KeepAliveData>, is_reconnecting: bool) {
        let (transport, start_op, monitor) = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            let Some(transport) = lifecycle.transport.clone() else {
                debug!("transport gone before startup; connection was closed");
                return;
            };
            let Some(start_op) = lifecycle.start_op.clone() else {
                return;
            };

            if is_reconnecting {
                if let Some(monitor) = lifecycle.heartbeat.take() {
                    monitor.stop();
                }
                // Fire-and-forget: the old stream is going away either way.
                let _ = transport.abort(self);
            }

            let monitor = Arc::new(HeartbeatMonitor::new());
            {
                let conn = Arc::downgrade(self);
                monitor.set_on_warning(move || {
                    if let Some(conn) = conn.upgrade() {
                        debug!("slow connection detected");
                        conn.fire_handler(|h| h.connection_slow.clone());
                    }
                });
            }
            {
                let conn = Arc::downgrade(self);
                monitor.set_on_timeout(move || {
                    if let Some(conn) = conn.upgrade() {
                        conn.on_transport_error(
                            ClientError::ConnectionLost("keep-alive timeout".into()),
                            true,
                        );
                    }
                });
            }
            lifecycle.heartbeat = Some(monitor.clone());
            lifecycle.keep_alive = keep_alive;
            (transport, start_op, monitor)
        };

        if is_reconnecting {
            let router = self.router.lock().unwrap().clone();
            if let Some(router) = router {
                router.reconnecting();
            }
            self.change_state(ConnectionState::Connected, ConnectionState::Reconnecting);
            self.fire_handler(|h| h.reconnecting.clone());
        }

        let mode = if is_reconnecting {
            StartMode::Reconnect
        } else {
            StartMode::Initial
        };
        debug!(?mode, transport = transport.name(), "starting transport");

        let on_data: DataCallback = {
            let conn = Arc::downgrade(self);
            Arc::new(move |data: &str| {
                if let Some(conn) = conn.upgrade() {
                    conn.process_received_data(data);
                }
            })
        };

        let transport_start = transport.start(self, mode, on_data);
        operation::link(&start_op, &transport_start);

        let conn = self.clone();
        let op = start_op.clone();
        transport_start.on_done(move |_| {
            if conn.change_state(ConnectionState::Reconnecting, ConnectionState::Connected) {
                conn.arm_heartbeat(&monitor);
                info!("reconnected");
                conn.fire_handler(|h| h.reconnected.clone());
            } else if conn.change_state(ConnectionState::Connecting, ConnectionState::Connected) {
                conn.arm_heartbeat(&monitor);
                info!("connected");
                conn.fire_handler(|h| h.connected.clone());
                op.set_result(());
            }
            Ok(())
        });
    }

    /// Start the heartbeat monitor, if the server advertised a keep-alive
    /// timeout at negotiation.
    fn arm_heartbeat(self: &Arc<Self>, monitor: &Arc<HeartbeatMonitor>) {
        let keep_alive = self.lifecycle.lock().unwrap().keep_alive.clone();
        if let Some(keep_alive) = keep_alive {
            let conn = Arc::downgrade(self);
            monitor.start(keep_alive, move || {
                conn.upgrade()
                    .map(|c| c.state())
                    .unwrap_or(ConnectionState::Disconnected)
            });
        }
    }

    /// Send a raw payload over the live transport.
    ///
    /// Rejected fast while Disconnected or Connecting.
    pub fn send(self: &Arc<Self>, data: impl Into<String>) -> Arc<Operation<()>> {
        let state = self.state();
        if state == ConnectionState::Disconnected || state == ConnectionState::Connecting {
            let err = ClientError::InvalidState(state.to_string());
            self.on_transport_error(err.clone(), false);
            return Operation::failed(err);
        }

        let transport = self.lifecycle.lock().unwrap().transport.clone();
        let Some(transport) = transport else {
            let err = ClientError::InvalidState(state.to_string());
            return Operation::failed(err);
        };

        let data = data.into();
        trace!(%data, "sending");
        let on_data: DataCallback = {
            let conn = Arc::downgrade(self);
            Arc::new(move |data: &str| {
                if let Some(conn) = conn.upgrade() {
                    conn.process_received_data(data);
                }
            })
        };
        let send_op = transport.send(self, data, on_data);
        {
            let conn = Arc::downgrade(self);
            send_op.on_error(move |err| {
                if let Some(conn) = conn.upgrade() {
                    conn.on_transport_error(err.clone(), false);
                }
            });
        }
        send_op
    }

    /// Serialize `payload` as JSON and send it.
    pub fn send_json<T: Serialize>(self: &Arc<Self>, payload: &T) -> Arc<Operation<()>> {
        match serde_json::to_string(payload) {
            Ok(data) => self.send(data),
            Err(err) => Operation::failed(ClientError::from(err)),
        }
    }

    /// Gracefully stop: tell the server, then disconnect. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        let (transport, abort_op) = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if lifecycle.aborting {
                trace!("stop ignored: abort already in flight");
                return;
            }
            if self.state() == ConnectionState::Disconnected {
                trace!("stop ignored: already disconnected");
                return;
            }
            info!("stopping connection");
            lifecycle.aborting = true;
            let Some(transport) = lifecycle.transport.clone() else {
                lifecycle.aborting = false;
                drop(lifecycle);
                self.disconnect();
                return;
            };
            (transport, lifecycle.abort_op.clone())
        };
        // A previous abort operation lingering from an earlier stop is
        // superseded.
        let _ = abort_op;

        let abort = transport.abort(self);
        self.lifecycle.lock().unwrap().abort_op = Some(abort.clone());

        {
            let conn = self.clone();
            abort.on_done(move |_| {
                debug!("abort completed");
                conn.disconnect();
                conn.lifecycle.lock().unwrap().aborting = false;
                Ok(())
            });
        }
        {
            let conn = self.clone();
            abort.on_error(move |err| {
                conn.on_transport_error(err.clone(), false);
                conn.disconnect();
                conn.lifecycle.lock().unwrap().aborting = false;
            });
        }
        {
            let conn = self.clone();
            abort.on_cancelled(move || {
                trace!("abort cancelled");
                conn.lifecycle.lock().unwrap().aborting = false;
            });
        }
    }

    /// Hard reset to Disconnected. Idempotent; does not consult the server.
    ///
    /// Clears every per-session identifier, stops the heartbeat and cancels
    /// outstanding operations. The closed hooks fire after the reset.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Disconnected {
                return;
            }
            let old = *state;
            *state = ConnectionState::Disconnected;
            drop(state);
            info!(from = %old, "disconnecting");
            self.notify_state_changed(old, ConnectionState::Disconnected);
        }

        let (monitor, start_op, abort_op) = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            lifecycle.transport = None;
            (
                lifecycle.heartbeat.take(),
                lifecycle.start_op.take(),
                lifecycle.abort_op.take(),
            )
        };
        {
            let mut session = self.session.lock().unwrap();
            *session = Session::default();
        }

        if let Some(monitor) = monitor {
            monitor.stop();
        }
        if let Some(op) = start_op {
            op.cancel();
        }
        if let Some(op) = abort_op {
            op.cancel();
        }

        let router = self.router.lock().unwrap().clone();
        if let Some(router) = router {
            router.connection_closed();
        }
        self.fire_handler(|h| h.closed.clone());
    }

    /// Stop the heartbeat and restart the transport stream, keeping the
    /// session. Only effective while Connected or Reconnecting.
    pub fn reconnect(self: &Arc<Self>) {
        let state = self.state();
        if state != ConnectionState::Connected && state != ConnectionState::Reconnecting {
            return;
        }
        info!("restarting transport");
        let keep_alive = {
            let lifecycle = self.lifecycle.lock().unwrap();
            // The monitor's copy can be absent when the previous attempt
            // never reached Connected; fall back to the connection's own.
            lifecycle
                .heartbeat
                .as_ref()
                .and_then(|m| m.keep_alive_data())
                .or_else(|| lifecycle.keep_alive.clone())
        };
        self.start_transport(keep_alive, true);
    }

    // ── Inbound routing ─────────────────────────────────────────────────

    /// Route one inbound payload: refresh the heartbeat, then parse.
    fn process_received_data(self: &Arc<Self>, data: &str) {
        {
            let lifecycle = self.lifecycle.lock().unwrap();
            if let Some(monitor) = &lifecycle.heartbeat {
                monitor.beat();
            }
        }

        let data = data.trim();
        if data.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(err) => {
                self.on_transport_error(
                    ClientError::Serialization(format!("unparseable payload: {err}")),
                    false,
                );
                return;
            }
        };
        // Non-object and empty payloads carry nothing to act on.
        let carries_fields = value.as_object().map(|o| !o.is_empty()).unwrap_or(false);
        if !carries_fields {
            return;
        }

        let envelope = match ReceivedEnvelope::from_value(&value) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.on_transport_error(err, false);
                return;
            }
        };

        if envelope.is_hub_result() {
            // RPC-reply fast path: the whole payload is one message.
            self.deliver(&value);
            return;
        }

        if envelope.should_disconnect() {
            debug!("server requested disconnect");
            self.disconnect();
            return;
        }

        if let Some(groups_token) = &envelope.groups_token {
            trace!(%groups_token, "groups token updated");
            self.set_groups_token(groups_token.clone());
        }

        if let Some(messages) = &envelope.messages {
            if let Some(message_id) = &envelope.message_id {
                self.set_message_id(message_id.clone());
            }
            for message in messages {
                self.deliver(message);
            }
        }

        if envelope.is_initialization() {
            debug!("initialization message received");
        }

        if envelope.should_reconnect() {
            debug!("server requested reconnect");
            self.reconnect();
        }
    }

    /// Hand one message to the application handler and the router. Only
    /// while Connected; handler failures are advisory.
    fn deliver(self: &Arc<Self>, message: &Value) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        trace!(%message, "message received");
        let received = self.handlers.lock().unwrap().received.clone();
        if let Some(handler) = received {
            if let Err(err) = handler(message) {
                self.on_transport_error(err, false);
            }
        }
        let router = self.router.lock().unwrap().clone();
        if let Some(router) = router {
            if let Err(err) = router.handle_message(message) {
                self.on_transport_error(err, false);
            }
        }
    }

    // ── Error funnel ────────────────────────────────────────────────────

    /// The single error funnel. Always notifies the external error handler
    /// with the raw error; when `must_clean_up` is set, decides between
    /// reconnect (while Connected or Reconnecting, with reconnect-on-error
    /// enabled) and disconnect.
    pub fn on_transport_error(self: &Arc<Self>, error: ClientError, must_clean_up: bool) {
        warn!(%error, must_clean_up, "connection error");
        let handler = self.handlers.lock().unwrap().error.clone();
        if let Some(handler) = handler {
            handler(&error);
        }
        if must_clean_up {
            let state = self.state();
            if (state == ConnectionState::Connected || state == ConnectionState::Reconnecting)
                && self.reconnect_on_error.load(Ordering::SeqCst)
            {
                debug!("triggering reconnect");
                self.reconnect();
            } else {
                debug!("triggering disconnect");
                self.disconnect();
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Compare-and-swap the state under the state lock, reporting the
    /// transition to the observer.
    fn change_state(self: &Arc<Self>, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != from {
                return false;
            }
            *state = to;
        }
        trace!(%from, %to, "state changed");
        self.notify_state_changed(from, to);
        true
    }

    fn notify_state_changed(&self, from: ConnectionState, to: ConnectionState) {
        let observer = self.handlers.lock().unwrap().state_changed.clone();
        if let Some(observer) = observer {
            observer(from, to);
        }
    }

    fn fire_handler(&self, select: impl Fn(&Handlers) -> Option<Handler>) {
        let handler = select(&self.handlers.lock().unwrap());
        if let Some(handler) = handler {
            handler();
        }
    }
}
