//! Persistent-socket transport over websockets.
//!
//! The connect URI is the connection's base URL with the scheme remapped
//! (http to ws, https to wss) and the usual receive query parameters
//! appended. The start operation completes on socket open; inbound text
//! frames go to the data callback; a close or error on the socket is never
//! silent: it funnels into the connection's error handler with cleanup
//! required, unless the socket has already been superseded or the connection
//! deliberately went away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::mpsc::UnboundedSender;
use futures_util::{SinkExt, StreamExt};
use hubwire_shared::{ClientError, NegotiationResponse};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionState};
use crate::http::{default_runner, HttpRunner};
use crate::operation::Operation;
use crate::transport::{
    receive_query_string, ClientTransport, DataCallback, HttpTransportCore, StartMode,
};

const TRANSPORT_NAME: &str = "webSockets";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct WsInner {
    writer: Mutex<Option<UnboundedSender<Message>>>,
    /// Bumped on every successful open; callbacks from superseded sockets
    /// compare against it before acting.
    generation: AtomicU64,
}

pub struct WebSocketTransport {
    core: HttpTransportCore,
    inner: Arc<WsInner>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::with_runner(default_runner())
    }

    pub fn with_runner(http: Arc<dyn HttpRunner>) -> Self {
        Self {
            core: HttpTransportCore::new(http),
            inner: Arc::new(WsInner {
                writer: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Remap an http(s) base URL onto the websocket scheme.
fn websocket_base_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn map_ws_error(err: WsError) -> ClientError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| format!("[{}: {}]; ", k, v.to_str().unwrap_or_default()))
                .collect::<String>();
            let body = response
                .into_body()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            ClientError::Http {
                status,
                body,
                headers,
            }
        }
        other => ClientError::Transport(other.to_string()),
    }
}

impl ClientTransport for WebSocketTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    fn negotiate(&self, connection: &Arc<Connection>) -> Arc<Operation<NegotiationResponse>> {
        self.core.negotiate(connection)
    }

    fn start(
        &self,
        connection: &Arc<Connection>,
        mode: StartMode,
        on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        let op = Operation::new();
        let inner = self.inner.clone();
        let conn = connection.clone();
        let task_op = op.clone();
        tokio::spawn(async move {
            let url = format!(
                "{}{}{}",
                websocket_base_url(&conn.url()),
                mode.endpoint(),
                receive_query_string(TRANSPORT_NAME, &conn)
            );
            debug!(%url, "opening websocket");

            let mut request = match url.as_str().into_client_request() {
                Ok(request) => request,
                Err(err) => {
                    task_op.set_error(ClientError::Transport(format!(
                        "invalid websocket request: {err}"
                    )));
                    return;
                }
            };
            for (name, value) in conn.headers_snapshot() {
                let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                    continue;
                };
                let Ok(value) = HeaderValue::from_str(&value) else {
                    continue;
                };
                request.headers_mut().insert(name, value);
            }

            let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await
            {
                Err(_) => {
                    task_op.set_error(ClientError::Timeout("websocket connect timed out".into()));
                    return;
                }
                Ok(Err(err)) => {
                    task_op.set_error(map_ws_error(err));
                    return;
                }
                Ok(Ok((stream, _response))) => stream,
            };

            if task_op.is_cancelled() {
                // Abandoned while the handshake was in flight; let the
                // socket drop.
                return;
            }

            let (mut sink, mut read) = stream.split();
            let (tx, mut rx) = futures_channel::mpsc::unbounded::<Message>();
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *inner.writer.lock().unwrap() = Some(tx);

            // Writer: drains the queue, closes the socket when the queue is
            // dropped.
            tokio::spawn(async move {
                while let Some(message) = rx.next().await {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            // Cancellation of the start operation tears down this socket if
            // it is still the live one.
            {
                let inner = inner.clone();
                task_op.on_cancelled(move || {
                    if inner.generation.load(Ordering::SeqCst) == generation {
                        inner.writer.lock().unwrap().take();
                    }
                });
            }

            task_op.set_result(());

            let mut close_reason: Option<String> = None;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => on_data(text.as_str()),
                    Ok(Message::Close(frame)) => {
                        close_reason = Some(match frame {
                            Some(frame) => format!("socket closed: {} {}", frame.code, frame.reason),
                            None => "socket closed".into(),
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        close_reason = Some(err.to_string());
                        break;
                    }
                }
            }

            // Only the live socket gets to report; a superseded one was
            // already replaced by a reconnect.
            if inner.generation.load(Ordering::SeqCst) == generation {
                inner.writer.lock().unwrap().take();
                if conn.state() != ConnectionState::Disconnected {
                    let reason = close_reason.unwrap_or_else(|| "socket stream ended".into());
                    warn!(%reason, "websocket closed");
                    conn.on_transport_error(ClientError::ConnectionLost(reason), true);
                }
            } else {
                trace!("discarded socket closed");
            }
        });
        op
    }

    fn send(
        &self,
        _connection: &Arc<Connection>,
        data: String,
        _on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        let writer = self.inner.writer.lock().unwrap().clone();
        match writer {
            Some(tx) => match tx.unbounded_send(Message::Text(data.into())) {
                Ok(()) => Operation::completed(()),
                Err(err) => {
                    Operation::failed(ClientError::Transport(format!("socket send failed: {err}")))
                }
            },
            None => Operation::failed(ClientError::Transport("socket is not open".into())),
        }
    }

    fn abort(&self, connection: &Arc<Connection>) -> Arc<Operation<()>> {
        self.core.abort(connection, TRANSPORT_NAME)
    }
}
