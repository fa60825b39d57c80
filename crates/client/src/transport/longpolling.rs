//! Long-polling transport.
//!
//! One long-lived GET per cycle: `connect` (or `reconnect`) for the first
//! cycle, `poll` from then on. Each response body is handed to the data
//! callback, then the next cycle is issued immediately, so the operation
//! returned by `start` represents the whole chain rather than a single
//! request. A timeout during a `poll` cycle is normal server behavior and
//! triggers an immediate re-poll; a timeout during the initial cycle is a
//! hard failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hubwire_shared::{ClientError, NegotiationResponse};
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionState};
use crate::http::{default_runner, HttpRequest, HttpRunner};
use crate::operation::Operation;
use crate::transport::{
    execute_success, receive_query_string, ClientTransport, DataCallback, HttpTransportCore,
    StartMode,
};

const TRANSPORT_NAME: &str = "longPolling";

/// Deadline for one poll cycle. Servers hold the request open well below
/// this; hitting it on a `poll` cycle just starts the next one.
const POLL_TIMEOUT: Duration = Duration::from_secs(110);

pub struct LongPollingTransport {
    core: HttpTransportCore,
}

impl LongPollingTransport {
    pub fn new() -> Self {
        Self::with_runner(default_runner())
    }

    pub fn with_runner(http: Arc<dyn HttpRunner>) -> Self {
        Self {
            core: HttpTransportCore::new(http),
        }
    }
}

impl Default for LongPollingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTransport for LongPollingTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn supports_keep_alive(&self) -> bool {
        false
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
            let mut endpoint = mode.endpoint();
            loop {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let url = format!(
                    "{}{}{}",
                    conn.url(),
                    endpoint,
                    receive_query_string(TRANSPORT_NAME, &conn)
                );
                trace!(%url, "issuing poll cycle");
                let request = conn.prepare_request(HttpRequest::get(url).timeout(POLL_TIMEOUT));
                let result = async {
                    let response = execute_success(&*http, request).await?;
                    response.read_to_end().await
                }
                .await;

                match result {
                    Ok(body) => {
                        if endpoint != "poll" {
                            // The stream is confirmed open once the first
                            // cycle answers.
                            task_op.set_result(());
                        }
                        on_data(body.trim());
                        if cancelled.load(Ordering::SeqCst)
                            || conn.state() != ConnectionState::Connected
                        {
                            debug!("poll chain stopping");
                            break;
                        }
                        endpoint = "poll";
                    }
                    Err(ClientError::Timeout(_)) if endpoint == "poll" => {
                        trace!("poll cycle timed out, re-polling");
                        continue;
                    }
                    Err(err) => {
                        if !cancelled.load(Ordering::SeqCst) {
                            task_op.set_error(err);
                        }
                        break;
                    }
                }
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
