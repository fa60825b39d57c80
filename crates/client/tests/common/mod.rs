//! Shared test doubles: a scriptable transport and canned negotiation data.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use hubwire_client::{
    ClientTransport, Connection, DataCallback, NegotiationResponse, Operation, StartMode,
};

/// Opt-in engine logging for a failing test run:
/// `RUST_LOG=hubwire_client=trace cargo test -- --nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn negotiation(keep_alive_secs: Option<f64>) -> NegotiationResponse {
    NegotiationResponse {
        connection_id: "conn-1".into(),
        connection_token: "tok-1".into(),
        url: None,
        protocol_version: "1.5".into(),
        disconnect_timeout: Some(30.0),
        try_web_sockets: false,
        keep_alive_timeout: keep_alive_secs,
    }
}

#[derive(Default)]
struct MockState {
    negotiations: Vec<Arc<Operation<NegotiationResponse>>>,
    starts: Vec<Arc<Operation<()>>>,
    start_modes: Vec<StartMode>,
    on_data: Option<DataCallback>,
    sent: Vec<String>,
    aborts: usize,
}

/// A transport the test script resolves by hand.
pub struct MockTransport {
    name: &'static str,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn negotiation_count(&self) -> usize {
        self.state.lock().unwrap().negotiations.len()
    }

    pub fn last_negotiation(&self) -> Arc<Operation<NegotiationResponse>> {
        self.state
            .lock()
            .unwrap()
            .negotiations
            .last()
            .expect("no negotiation issued")
            .clone()
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts.len()
    }

    pub fn last_start(&self) -> Arc<Operation<()>> {
        self.state
            .lock()
            .unwrap()
            .starts
            .last()
            .expect("no start issued")
            .clone()
    }

    pub fn start_modes(&self) -> Vec<StartMode> {
        self.state.lock().unwrap().start_modes.clone()
    }

    /// Inject an inbound payload through the captured data callback.
    pub fn feed(&self, payload: &str) {
        let on_data = self
            .state
            .lock()
            .unwrap()
            .on_data
            .clone()
            .expect("transport was never started");
        on_data(payload);
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn abort_count(&self) -> usize {
        self.state.lock().unwrap().aborts
    }
}

impl ClientTransport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports_keep_alive(&self) -> bool {
        true
    }

    fn negotiate(&self, _connection: &Arc<Connection>) -> Arc<Operation<NegotiationResponse>> {
        let op = Operation::new();
        self.state.lock().unwrap().negotiations.push(op.clone());
        op
    }

    fn start(
        &self,
        _connection: &Arc<Connection>,
        mode: StartMode,
        on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        let op = Operation::new();
        let mut state = self.state.lock().unwrap();
        state.starts.push(op.clone());
        state.start_modes.push(mode);
        state.on_data = Some(on_data);
        op
    }

    fn send(
        &self,
        _connection: &Arc<Connection>,
        data: String,
        _on_data: DataCallback,
    ) -> Arc<Operation<()>> {
        self.state.lock().unwrap().sent.push(data);
        Operation::completed(())
    }

    fn abort(&self, _connection: &Arc<Connection>) -> Arc<Operation<()>> {
        self.state.lock().unwrap().aborts += 1;
        Operation::completed(())
    }
}

/// Bring a connection to Connected over a mock transport.
pub fn connect(connection: &Arc<Connection>, transport: &Arc<MockTransport>) -> Arc<Operation<()>> {
    init_tracing();
    let start_op = connection.start_with(transport.clone());
    transport.last_negotiation().set_result(negotiation(None));
    transport.last_start().set_result(());
    start_op
}
