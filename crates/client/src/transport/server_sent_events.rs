//! Server-sent-events transport.
//!
//! Issues one streaming GET and reads the body incrementally. Logical events
//! are terminated by a blank line; the `data: initialized` sentinel is a
//! marker and never forwarded. If the body ends without the operation having
//! been cancelled, that is a broken stream and is reported as an error even
//! though the start operation already completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hubwire_shared::{ClientError, NegotiationResponse};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::http::{default_runner, HttpRequest, HttpRunner};
use crate::operation::Operation;
use crate::transport::{
    ensure_success, receive_query_string, ClientTransport, DataCallback, HttpTransportCore,
    StartMode,
};

const TRANSPORT_NAME: &str = "serverSentEvents";
const INITIALIZED_FRAME: &str = "data: initialized";
const DATA_PREFIX: &str = "data:";

pub struct ServerSentEventsTransport {
    core: HttpTransportCore,
}

impl ServerSentEventsTransport {
    pub fn new() -> Self {
        Self::with_runner(default_runner())
    }

    pub fn with_runner(http: Arc<dyn HttpRunner>) -> Self {
        Self {
            core: HttpTransportCore::new(http),
        }
    }
}

impl Default for ServerSentEventsTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Position just past the next blank-line frame terminator, if present.
fn frame_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

impl ClientTransport for ServerSentEventsTransport {
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
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let cancelled = cancelled.clone();
            op.on_cancelled(move || cancelled.store(true, Ordering::SeqCst));
        }

        let http = self.core.http.clone();
        let conn = connection.clone();
        let task_op = op.clone();
        tokio::spawn(async move {
            let url = format!(
                "{}{}{}",
                conn.url(),
                mode.endpoint(),
                receive_query_string(TRANSPORT_NAME, &conn)
            );
            debug!(%url, "opening event stream");
            // No request deadline: the stream stays open for the lifetime of
            // the connection.
            let request =
                conn.prepare_request(HttpRequest::get(url).header("Accept", "text/event-stream"));

            let response = match http.execute(request).await {
                Ok(response) => response,
                Err(err) => {
                    task_op.set_error(err);
                    return;
                }
            };
            let response = match ensure_success(response).await {
                Ok(response) => response,
                Err(err) => {
                    task_op.set_error(err);
                    return;
                }
            };

            task_op.set_result(());

            let mut body = response.into_body();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        if !cancelled.load(Ordering::SeqCst) {
                            task_op.set_error(err);
                        }
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);
                while let Some(end) = frame_boundary(&buffer) {
                    let frame: Vec<u8> = buffer.drain(..end).collect();
                    let text = String::from_utf8_lossy(&frame);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if text == INITIALIZED_FRAME {
                        trace!("initialization frame");
                        continue;
                    }
                    let content = text.strip_prefix(DATA_PREFIX).unwrap_or(text).trim();
                    on_data(content);
                }
            }

            // The body ran out without a cancellation: the server finalized
            // the connection.
            if !cancelled.load(Ordering::SeqCst) {
                task_op.set_error(ClientError::ConnectionLost("event stream ended".into()));
            }
        });
        op
    }

    fn send(
        &self,
        connection: &Arc<Connection>,
        data: String,
        on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        self.core.send(connection, TRANSPORT_NAME, data, on_data)
    }

    fn abort(&self, connection: &Arc<Connection>) -> Arc<Operation<()>> {
        self.core.abort(connection, TRANSPORT_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_frame_boundaries() {
        assert_eq!(frame_boundary(b"data: x\n\nrest"), Some(9));
        assert_eq!(frame_boundary(b"data: x\n"), None);
        assert_eq!(frame_boundary(b""), None);
    }
}
