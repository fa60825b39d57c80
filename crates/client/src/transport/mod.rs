//! Transport contract and shared HTTP plumbing.
//!
//! A transport moves protocol frames for one logical connection: it
//! negotiates, opens the stream, sends, and aborts. Three concrete
//! implementations live in this module tree (long polling, server-sent
//! events, websocket) plus [`automatic::AutomaticTransport`], which tries
//! them in preference order and commits to the first that starts.

pub mod automatic;
pub mod longpolling;
pub mod server_sent_events;
pub mod websocket;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use hubwire_shared::{ClientError, NegotiationResponse, PROTOCOL_VERSION};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::http::{HttpRequest, HttpResponse, HttpRunner};
use crate::operation::Operation;

/// Deadline for plain request/response calls (negotiate, send, abort).
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback a transport invokes for every inbound payload.
pub type DataCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Whether a stream is being opened for the first time or re-opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Initial,
    Reconnect,
}

impl StartMode {
    /// Endpoint the streaming transports hit for this mode.
    pub fn endpoint(self) -> &'static str {
        match self {
            StartMode::Initial => "connect",
            StartMode::Reconnect => "reconnect",
        }
    }
}

/// The contract for moving bytes for one logical connection.
pub trait ClientTransport: Send + Sync {
    /// Wire name of the transport, used as the `transport=` query value.
    fn name(&self) -> &'static str;

    /// Whether the transport carries its own implicit liveness signal.
    /// Metadata only; the heartbeat monitor runs uniformly regardless.
    fn supports_keep_alive(&self) -> bool;

    /// Run the negotiate handshake.
    fn negotiate(&self, connection: &Arc<Connection>) -> Arc<Operation<NegotiationResponse>>;

    /// Open the stream. The returned operation completes when the stream is
    /// confirmed open, stays pending while data keeps arriving through
    /// `on_data`, and errors if the stream breaks.
    fn start(
        &self,
        connection: &Arc<Connection>,
        mode: StartMode,
        on_data: DataCallback,
    ) -> Arc<Operation<()>>;

    /// Send one payload.
    fn send(
        &self,
        connection: &Arc<Connection>,
        data: String,
        on_data: DataCallback,
    ) -> Arc<Operation<()>>;

    /// Tell the server this connection is going away. Idempotent: a second
    /// concurrent call returns the same in-flight operation.
    fn abort(&self, connection: &Arc<Connection>) -> Arc<Operation<()>>;
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Query string for the negotiate request.
pub(crate) fn negotiate_query_string(connection: &Connection) -> String {
    let mut qs = format!("?clientProtocol={}", encode(PROTOCOL_VERSION));
    if let Some(data) = connection.connection_data() {
        qs.push_str("&connectionData=");
        qs.push_str(&encode(&data));
    }
    if let Some(custom) = connection.query_string() {
        qs.push('&');
        qs.push_str(&custom);
    }
    qs
}

/// Query string for connect/reconnect/poll requests.
pub(crate) fn receive_query_string(transport_name: &str, connection: &Connection) -> String {
    let mut qs = format!(
        "?transport={}&connectionToken={}&connectionId={}",
        transport_name,
        encode(&connection.connection_token().unwrap_or_default()),
        encode(&connection.connection_id().unwrap_or_default()),
    );
    if let Some(message_id) = connection.message_id() {
        qs.push_str("&messageId=");
        qs.push_str(&encode(&message_id));
    }
    if let Some(groups_token) = connection.groups_token() {
        qs.push_str("&groupsToken=");
        qs.push_str(&encode(&groups_token));
    }
    if let Some(data) = connection.connection_data() {
        qs.push_str("&connectionData=");
        qs.push_str(&encode(&data));
    }
    if let Some(custom) = connection.query_string() {
        qs.push('&');
        qs.push_str(&custom);
    }
    qs
}

/// Query string for send/abort requests.
pub(crate) fn send_query_string(transport_name: &str, connection: &Connection) -> String {
    let mut qs = format!(
        "?transport={}&connectionToken={}&connectionId={}",
        encode(transport_name),
        encode(&connection.connection_token().unwrap_or_default()),
        encode(&connection.connection_id().unwrap_or_default()),
    );
    if let Some(data) = connection.connection_data() {
        qs.push_str("&connectionData=");
        qs.push_str(&encode(&data));
    }
    if let Some(custom) = connection.query_string() {
        qs.push('&');
        qs.push_str(&custom);
    }
    qs
}

/// Fail on non-2xx, carrying status, body, and headers for diagnostics.
pub(crate) async fn ensure_success(response: HttpResponse) -> Result<HttpResponse, ClientError> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status;
    let headers = response.headers_concat();
    let body = response.read_to_end().await.unwrap_or_default();
    Err(ClientError::Http {
        status,
        body,
        headers,
    })
}

pub(crate) async fn execute_success(
    http: &dyn HttpRunner,
    request: HttpRequest,
) -> Result<HttpResponse, ClientError> {
    let response = http.execute(request).await?;
    ensure_success(response).await
}

/// Fold `Set-Cookie` response headers (minus any `HttpOnly` attribute) into
/// one `Cookie` header value for subsequent requests on this connection.
fn fold_cookies(response: &HttpResponse) -> Option<String> {
    let cookies: Vec<String> = response
        .header_values("Set-Cookie")
        .into_iter()
        .map(|value| {
            value
                .split("; ")
                .filter(|segment| !segment.eq_ignore_ascii_case("httponly"))
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|value| !value.is_empty())
        .collect();
    if cookies.is_empty() {
        None
    } else {
        Some(cookies.join("; "))
    }
}

#[derive(Default)]
struct AbortState {
    started: bool,
    op: Option<Arc<Operation<()>>>,
}

/// Request/response plumbing shared by every HTTP-based transport:
/// negotiation, form-encoded send, and the idempotent abort call.
pub(crate) struct HttpTransportCore {
    pub http: Arc<dyn HttpRunner>,
    abort_state: Arc<Mutex<AbortState>>,
}

impl HttpTransportCore {
    pub fn new(http: Arc<dyn HttpRunner>) -> Self {
        Self {
            http,
            abort_state: Arc::new(Mutex::new(AbortState::default())),
        }
    }

    pub fn negotiate(&self, connection: &Arc<Connection>) -> Arc<Operation<NegotiationResponse>> {
        let op = Operation::new();
        let http = self.http.clone();
        let conn = connection.clone();
        let task_op = op.clone();
        tokio::spawn(async move {
            let url = format!("{}negotiate{}", conn.url(), negotiate_query_string(&conn));
            debug!(%url, "negotiating");
            let request = conn.prepare_request(HttpRequest::get(url).timeout(REQUEST_TIMEOUT));
            match execute_success(&*http, request).await {
                Ok(response) => {
                    let cookie = fold_cookies(&response);
                    match response.read_to_end().await {
                        Ok(body) => match NegotiationResponse::parse(&body) {
                            Ok(parsed) => {
                                if let Some(cookie) = cookie {
                                    conn.set_header("Cookie", cookie);
                                }
                                task_op.set_result(parsed);
                            }
                            Err(err) => task_op.set_error(err),
                        },
                        Err(err) => {
                            task_op.set_error(ClientError::Negotiation(err.to_string()));
                        }
                    }
                }
                Err(err) => task_op.set_error(err),
            }
        });
        op
    }

    pub fn send(
        &self,
        connection: &Arc<Connection>,
        transport_name: &'static str,
        data: String,
        on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        let op = Operation::new();
        let http = self.http.clone();
        let conn = connection.clone();
        let task_op = op.clone();
        tokio::spawn(async move {
            let url = format!(
                "{}send{}",
                conn.url(),
                send_query_string(transport_name, &conn)
            );
            trace!(%url, "sending");
            let body = format!("data={}", encode(&data));
            let request = conn.prepare_request(
                HttpRequest::post(url)
                    .form_body(body)
                    .timeout(REQUEST_TIMEOUT),
            );
            let result = async {
                let response = execute_success(&*http, request).await?;
                response.read_to_end().await
            }
            .await;
            match result {
                Ok(text) => {
                    if !text.trim().is_empty() {
                        on_data(&text);
                    }
                    task_op.set_result(());
                }
                Err(err) => task_op.set_error(err),
            }
        });
        op
    }

    pub fn abort(
        &self,
        connection: &Arc<Connection>,
        transport_name: &'static str,
    ) -> Arc<Operation<()>> {
        let op = {
            let mut state = self.abort_state.lock().unwrap();
            if state.started {
                if let Some(op) = &state.op {
                    return op.clone();
                }
            }
            state.started = true;
            let op = Operation::new();
            state.op = Some(op.clone());
            op
        };

        let http = self.http.clone();
        let conn = connection.clone();
        let task_op = op.clone();
        let abort_state = self.abort_state.clone();
        tokio::spawn(async move {
            let url = format!(
                "{}abort{}",
                conn.url(),
                send_query_string(transport_name, &conn)
            );
            debug!(%url, "aborting");
            let request = conn.prepare_request(HttpRequest::post(url).timeout(REQUEST_TIMEOUT));
            let result = http.execute(request).await;
            abort_state.lock().unwrap().started = false;
            match result {
                Ok(_) => task_op.set_result(()),
                Err(err) => task_op.set_error(err),
            }
        });
        op
    }
}
