//! Error taxonomy for the client engine.
//!
//! Every variant is `Clone` so an error can be replayed to subscribers that
//! attach after it was raised. Whether an error is fatal to the current start
//! attempt is a property of the type, not of the site that observes it.

use serde_json::Value;
use thiserror::Error;

/// Connection- and transport-level errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// The negotiate response was missing or malformed.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The server speaks a protocol version this client does not support.
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(String),

    /// A request finished with a non-2xx status. Carries the response body
    /// and the concatenated response headers for diagnostics.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        headers: String,
    },

    /// Network-level failure (connect error, broken stream, bad frame).
    #[error("transport error: {0}")]
    Transport(String),

    /// The stream ended or the remote went away while the connection was
    /// supposed to be live.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A request did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation was attempted in a connection state that does not allow
    /// it. Fails fast and synchronously.
    #[error("invalid operation while {0}")]
    InvalidState(String),

    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An application-supplied handler reported a failure. Advisory only.
    #[error("handler error: {0}")]
    Handler(String),
}

impl ClientError {
    /// Whether this error is fatal to the current start attempt.
    ///
    /// Fatal errors (a broken negotiation, a protocol-version mismatch) force
    /// a disconnect and are never retried. Everything else goes through the
    /// reconnect-or-disconnect decision.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Negotiation(_) | ClientError::UnsupportedProtocol(_)
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

/// Errors surfaced by a hub invocation.
///
/// A structured remote hub exception is distinguished from a generic remote
/// error so callers can inspect the attached error data.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HubError {
    /// The hub method raised a structured exception on the server.
    #[error("hub exception: {message}")]
    HubException {
        message: String,
        data: Option<Value>,
    },

    /// The server reported a plain error message for this invocation.
    #[error("remote error: {0}")]
    Remote(String),

    /// The connection closed or started reconnecting while the invocation
    /// was still pending.
    #[error("invocation aborted: {0}")]
    ConnectionClosed(String),

    /// A connection-level failure while sending or decoding.
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ClientError::Negotiation("bad json".into()).is_fatal());
        assert!(ClientError::UnsupportedProtocol("1.2".into()).is_fatal());
        assert!(!ClientError::Transport("reset".into()).is_fatal());
        assert!(!ClientError::Timeout("poll".into()).is_fatal());
    }

    #[test]
    fn hub_error_wraps_client_error() {
        let err: HubError = ClientError::Cancelled.into();
        assert_eq!(err, HubError::Client(ClientError::Cancelled));
    }
}
