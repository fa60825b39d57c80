//! Wire protocol definitions.
//!
//! Two families of types live here: the negotiate handshake response (sent
//! by the server in PascalCase JSON) and the streaming envelopes, whose
//! fields are single, case-sensitive letters on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

/// Protocol version this client implements. The server's advertised version
/// must match exactly.
pub const PROTOCOL_VERSION: &str = "1.5";

/// Negotiation handshake response.
///
/// Immutable once parsed. `keep_alive_timeout` is optional; servers that do
/// not emit keep-alive pings omit it or send null.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct NegotiationResponse {
    pub connection_id: String,
    pub connection_token: String,
    #[serde(default)]
    pub url: Option<String>,
    pub protocol_version: String,
    #[serde(default)]
    pub disconnect_timeout: Option<f64>,
    #[serde(default)]
    pub try_web_sockets: bool,
    #[serde(default)]
    pub keep_alive_timeout: Option<f64>,
}

impl NegotiationResponse {
    /// Parse a negotiate response body.
    pub fn parse(body: &str) -> Result<Self, ClientError> {
        serde_json::from_str(body)
            .map_err(|e| ClientError::Negotiation(format!("malformed negotiate response: {e}")))
    }

    /// Server keep-alive timeout, when advertised. The wire value is in
    /// seconds.
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_timeout
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Top-level view of an inbound streaming payload.
///
/// A payload carrying `I` is an RPC reply and is handled as a whole; the
/// remaining fields only apply to the enveloped form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceivedEnvelope {
    /// Callback id: present means the payload is a hub result, not a batch.
    #[serde(rename = "I", default)]
    pub callback_id: Option<Value>,
    /// Disconnect command from the server.
    #[serde(rename = "D", default)]
    pub disconnect: Option<i64>,
    /// Server asked the client to reconnect.
    #[serde(rename = "T", default)]
    pub reconnect: Option<i64>,
    /// Opaque groups cursor, echoed back on reconnect.
    #[serde(rename = "G", default)]
    pub groups_token: Option<String>,
    /// Last-message cursor accompanying a batch.
    #[serde(rename = "C", default)]
    pub message_id: Option<String>,
    /// Batched application messages, delivered in array order.
    #[serde(rename = "M", default)]
    pub messages: Option<Vec<Value>>,
    /// Stream-initialized marker; informational only.
    #[serde(rename = "S", default)]
    pub initialized: Option<i64>,
}

impl ReceivedEnvelope {
    pub fn from_value(value: &Value) -> Result<Self, ClientError> {
        serde_json::from_value(value.clone()).map_err(ClientError::from)
    }

    pub fn is_hub_result(&self) -> bool {
        self.callback_id.is_some()
    }

    pub fn should_disconnect(&self) -> bool {
        self.disconnect == Some(1)
    }

    pub fn should_reconnect(&self) -> bool {
        self.reconnect == Some(1)
    }

    pub fn is_initialization(&self) -> bool {
        self.initialized == Some(1)
    }
}

/// Outbound hub method invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubInvocation {
    #[serde(rename = "I")]
    pub callback_id: String,
    #[serde(rename = "H")]
    pub hub: String,
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "A")]
    pub args: Vec<Value>,
    /// Shared hub state, echoed when non-empty.
    #[serde(rename = "S", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
}

/// Result of a hub invocation, correlated by callback id.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HubResult {
    #[serde(rename = "I", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "H", default, skip_serializing_if = "is_false")]
    pub is_hub_exception: bool,
    #[serde(rename = "E", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "D", default, skip_serializing_if = "Option::is_none")]
    pub error_data: Option<Value>,
    #[serde(rename = "S", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl HubResult {
    /// Callback id folded for case-insensitive lookup. Servers have been
    /// observed echoing the id both as a string and as a bare number.
    pub fn normalized_id(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) => Some(s.to_lowercase()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Server-to-client hub call, routed to a named event subscription.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubServerInvocation {
    #[serde(rename = "H")]
    pub hub: String,
    #[serde(rename = "M")]
    pub method: String,
    #[serde(rename = "A", default)]
    pub args: Vec<Value>,
    #[serde(rename = "S", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
}

/// One entry of the connection-data list sent at negotiate time: the name of
/// a hub the client wants to talk to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubRegistration {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_negotiation_response() {
        let body = r#"{
            "ConnectionId": "d-1",
            "ConnectionToken": "tok",
            "Url": "/signalr",
            "ProtocolVersion": "1.5",
            "DisconnectTimeout": 30.0,
            "TryWebSockets": true,
            "KeepAliveTimeout": 20.0
        }"#;
        let resp = NegotiationResponse::parse(body).unwrap();
        assert_eq!(resp.connection_id, "d-1");
        assert_eq!(resp.connection_token, "tok");
        assert_eq!(resp.protocol_version, "1.5");
        assert!(resp.try_web_sockets);
        assert_eq!(resp.keep_alive(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn negotiation_keep_alive_is_optional() {
        let body = r#"{
            "ConnectionId": "d-1",
            "ConnectionToken": "tok",
            "ProtocolVersion": "1.5",
            "KeepAliveTimeout": null
        }"#;
        let resp = NegotiationResponse::parse(body).unwrap();
        assert_eq!(resp.keep_alive(), None);
        assert!(!resp.try_web_sockets);
    }

    #[test]
    fn malformed_negotiation_is_an_error() {
        assert!(matches!(
            NegotiationResponse::parse("{not json"),
            Err(ClientError::Negotiation(_))
        ));
    }

    #[test]
    fn envelope_flags() {
        let value = json!({"D": 1});
        let env = ReceivedEnvelope::from_value(&value).unwrap();
        assert!(env.should_disconnect());
        assert!(!env.should_reconnect());

        let value = json!({"T": 1, "G": "grp", "C": "m-7", "M": [{"x": 1}, {"x": 2}]});
        let env = ReceivedEnvelope::from_value(&value).unwrap();
        assert!(env.should_reconnect());
        assert_eq!(env.groups_token.as_deref(), Some("grp"));
        assert_eq!(env.message_id.as_deref(), Some("m-7"));
        assert_eq!(env.messages.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn callback_id_marks_hub_results() {
        let env = ReceivedEnvelope::from_value(&json!({"I": "3", "R": 42})).unwrap();
        assert!(env.is_hub_result());
        let env = ReceivedEnvelope::from_value(&json!({"M": []})).unwrap();
        assert!(!env.is_hub_result());
    }

    #[test]
    fn hub_invocation_wire_shape() {
        let invocation = HubInvocation {
            callback_id: "0".into(),
            hub: "chat".into(),
            method: "Send".into(),
            args: vec![json!("hello")],
            state: None,
        };
        let wire = serde_json::to_value(&invocation).unwrap();
        assert_eq!(wire, json!({"I": "0", "H": "chat", "M": "Send", "A": ["hello"]}));
    }

    #[test]
    fn hub_result_id_normalization() {
        let result: HubResult = serde_json::from_value(json!({"I": "A1", "R": 1})).unwrap();
        assert_eq!(result.normalized_id().as_deref(), Some("a1"));
        let result: HubResult = serde_json::from_value(json!({"I": 7})).unwrap();
        assert_eq!(result.normalized_id().as_deref(), Some("7"));
    }

    #[test]
    fn hub_result_exception_fields() {
        let result: HubResult = serde_json::from_value(
            json!({"I": "2", "E": "boom", "H": true, "D": {"code": 3}}),
        )
        .unwrap();
        assert!(result.is_hub_exception);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.error_data, Some(json!({"code": 3})));
    }
}
