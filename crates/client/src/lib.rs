//! hubwire client engine.
//!
//! Client-side implementation of a negotiate/connect/stream push protocol:
//! a [`Connection`] state machine with automatic transport fallback,
//! heartbeat-based failure detection and reconnection, plus a hub RPC layer
//! ([`HubClient`]) on top.
//!
//! The engine spawns its background work on tokio tasks; lifecycle methods
//! (`start`, `send`, `stop`, `reconnect`) must be called from within a tokio
//! runtime.
//!
//! ```no_run
//! use hubwire_client::HubClient;
//! use serde_json::json;
//!
//! # async fn demo() {
//! let client = HubClient::new("http://example.test");
//! let chat = client.create_proxy("chat").unwrap();
//! chat.on1::<String>("broadcast", |message| println!("{message}"));
//!
//! client.start();
//! chat.invoke("Send", vec![json!("hello")]);
//! # }
//! ```

pub mod connection;
pub mod http;
pub mod hubs;
pub mod keepalive;
pub mod operation;
pub mod transport;

pub use connection::{Connection, ConnectionState, Credentials, MessageRouter};
pub use http::{BodyChunks, HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpRunner};
pub use hubs::{HubClient, HubProxy, Subscription};
pub use keepalive::{HeartbeatMonitor, KeepAliveData};
pub use operation::{Operation, WaitError};
pub use transport::automatic::AutomaticTransport;
pub use transport::longpolling::LongPollingTransport;
pub use transport::server_sent_events::ServerSentEventsTransport;
pub use transport::websocket::WebSocketTransport;
pub use transport::{ClientTransport, DataCallback, StartMode};

pub use hubwire_shared::{
    ClientError, HubError, HubInvocation, HubResult, HubServerInvocation, NegotiationResponse,
    PROTOCOL_VERSION,
};
