//! Automatic transport selection with ordered fallback.
//!
//! Tries websocket, then server-sent events, then long polling. The first
//! transport whose start operation completes becomes the "real" transport
//! and every later call delegates to it. A failure before lock-in advances
//! to the next candidate; a failure after lock-in is forwarded untouched.
//! Cancelling the outer start before lock-in counts as a failure of the
//! in-flight attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hubwire_shared::{ClientError, NegotiationResponse};
use tracing::debug;

use crate::connection::Connection;
use crate::http::{default_runner, HttpRunner};
use crate::operation::Operation;
use crate::transport::longpolling::LongPollingTransport;
use crate::transport::server_sent_events::ServerSentEventsTransport;
use crate::transport::websocket::WebSocketTransport;
use crate::transport::{ClientTransport, DataCallback, HttpTransportCore, StartMode};

type FallbackFn = Arc<dyn Fn(ClientError) + Send + Sync>;

struct AutoInner {
    transports: Vec<Arc<dyn ClientTransport>>,
    real: Mutex<Option<Arc<dyn ClientTransport>>>,
    /// Start operation of the attempt currently in flight.
    current: Mutex<Option<Arc<Operation<()>>>>,
    /// Failure hook of the attempt currently in flight, used to turn an
    /// outer cancellation into a synthetic attempt failure.
    fallback: Mutex<Option<FallbackFn>>,
}

pub struct AutomaticTransport {
    core: HttpTransportCore,
    inner: Arc<AutoInner>,
}

impl AutomaticTransport {
    pub fn new() -> Self {
        Self::with_runner(default_runner())
    }

    pub fn with_runner(http: Arc<dyn HttpRunner>) -> Self {
        let transports: Vec<Arc<dyn ClientTransport>> = vec![
            Arc::new(WebSocketTransport::with_runner(http.clone())),
            Arc::new(ServerSentEventsTransport::with_runner(http.clone())),
            Arc::new(LongPollingTransport::with_runner(http.clone())),
        ];
        Self::with_transports(http, transports)
    }

    /// Build with an explicit candidate list, in preference order.
    pub fn with_transports(
        http: Arc<dyn HttpRunner>,
        transports: Vec<Arc<dyn ClientTransport>>,
    ) -> Self {
        Self {
            core: HttpTransportCore::new(http),
            inner: Arc::new(AutoInner {
                transports,
                real: Mutex::new(None),
                current: Mutex::new(None),
                fallback: Mutex::new(None),
            }),
        }
    }

    fn real(&self) -> Option<Arc<dyn ClientTransport>> {
        self.inner.real.lock().unwrap().clone()
    }
}

impl Default for AutomaticTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn attempt(
    inner: &Arc<AutoInner>,
    connection: &Arc<Connection>,
    mode: StartMode,
    on_data: DataCallback,
    index: usize,
    outer: &Arc<Operation<()>>,
) {
    let transport = inner.transports[index].clone();
    debug!(transport = transport.name(), "trying transport");
    let transport_start = transport.start(connection, mode, on_data.clone());

    // Lock in on success and complete the outer operation.
    {
        let inner = inner.clone();
        let transport = transport.clone();
        let outer = outer.clone();
        transport_start.on_done(move |_| {
            debug!(transport = transport.name(), "transport locked in");
            *inner.real.lock().unwrap() = Some(transport);
            outer.set_result(());
            Ok(())
        });
    }

    // Pre-lock-in failures advance to the next candidate exactly once;
    // post-lock-in errors are forwarded as-is.
    let advanced = Arc::new(AtomicBool::new(false));
    let handle_failure: FallbackFn = {
        let inner = inner.clone();
        let connection = connection.clone();
        let outer = outer.clone();
        let transport_name = transport.name();
        Arc::new(move |err: ClientError| {
            if inner.real.lock().unwrap().is_some() {
                outer.set_error(err);
                return;
            }
            if advanced.swap(true, Ordering::SeqCst) {
                return;
            }
            debug!(transport = transport_name, error = %err, "transport failed before lock-in");
            let next = index + 1;
            if next < inner.transports.len() {
                attempt(&inner, &connection, mode, on_data.clone(), next, &outer);
            } else {
                outer.set_error(err);
            }
        })
    };
    *inner.fallback.lock().unwrap() = Some(handle_failure.clone());
    {
        let handle_failure = handle_failure.clone();
        transport_start.on_error(move |err| handle_failure(err.clone()));
    }
    *inner.current.lock().unwrap() = Some(transport_start);
}

impl ClientTransport for AutomaticTransport {
    fn name(&self) -> &'static str {
        match self.real() {
            Some(real) => real.name(),
            None => "automatic",
        }
    }

    fn supports_keep_alive(&self) -> bool {
        self.real()
            .map(|real| real.supports_keep_alive())
            .unwrap_or(false)
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
        let outer = Operation::new();
        {
            let inner = self.inner.clone();
            outer.on_cancelled(move || {
                let current = inner.current.lock().unwrap().clone();
                if let Some(current) = current {
                    current.cancel();
                }
                if inner.real.lock().unwrap().is_none() {
                    // No transport committed yet: the in-flight attempt
                    // failed synthetically.
                    let fallback = inner.fallback.lock().unwrap().clone();
                    if let Some(fallback) = fallback {
                        fallback(ClientError::Cancelled);
                    }
                }
            });
        }
        attempt(&self.inner, connection, mode, on_data, 0, &outer);
        outer
    }

    fn send(
        &self,
        connection: &Arc<Connection>,
        data: String,
        on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        match self.real() {
            Some(real) => real.send(connection, data, on_data),
            None => Operation::completed(()),
        }
    }

    fn abort(&self, connection: &Arc<Connection>) -> Arc<Operation<()>> {
        match self.real() {
            Some(real) => real.abort(connection),
            None => Operation::completed(()),
        }
    }
}
