//! HTTP request execution capability.
//!
//! The engine never talks to reqwest directly: transports go through the
//! [`HttpRunner`] trait so tests can substitute scripted responses. The
//! default [`HttpClient`] wraps a shared `reqwest::Client` and surfaces the
//! response body as a stream of byte chunks, which the server-push transport
//! needs for incremental framing and everything else folds into a string.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::StreamExt;
use hubwire_shared::ClientError;
use tracing::trace;

/// How long the default client waits for a TCP/TLS connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A request the engine wants executed.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Pre-encoded `application/x-www-form-urlencoded` body, POST only.
    pub form_body: Option<String>,
    /// Whole-request deadline. `None` streams without a deadline.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            form_body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            form_body: None,
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn form_body(mut self, body: impl Into<String>) -> Self {
        self.form_body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response body as a sequence of byte chunks.
pub struct BodyChunks {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, ClientError>>,
}

impl BodyChunks {
    /// Build a body from a pre-collected set of chunks. Useful for mocks.
    pub fn from_chunks(chunks: Vec<Result<Vec<u8>, ClientError>>) -> Self {
        let (tx, rx) = mpsc::unbounded();
        for chunk in chunks {
            let _ = tx.unbounded_send(chunk);
        }
        Self { rx }
    }

    pub fn from_receiver(rx: mpsc::UnboundedReceiver<Result<Vec<u8>, ClientError>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<Vec<u8>, ClientError>> {
        self.rx.next().await
    }
}

/// An executed response: status, headers, and the body still in flight.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: BodyChunks,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: BodyChunks) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// All values for a header, compared case-insensitively.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Headers flattened into one diagnostics string.
    pub fn headers_concat(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(&format!("[{name}: {value}]; "));
        }
        out
    }

    pub fn into_body(self) -> BodyChunks {
        self.body
    }

    /// Drain the body into a UTF-8 string.
    pub async fn read_to_end(self) -> Result<String, ClientError> {
        let mut chunks = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = chunks.next().await {
            buf.extend_from_slice(&chunk?);
        }
        String::from_utf8(buf)
            .map_err(|e| ClientError::Transport(format!("response body was not UTF-8: {e}")))
    }
}

/// Capability interface for executing one HTTP request.
#[async_trait]
pub trait HttpRunner: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError>;
}

/// Default runner over a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared default runner for transports constructed without one.
pub fn default_runner() -> Arc<dyn HttpRunner> {
    Arc::new(HttpClient::new())
}

fn map_reqwest_error(err: &reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(err.to_string())
    } else {
        ClientError::Transport(err.to_string())
    }
}

#[async_trait]
impl HttpRunner for HttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        trace!(url = %request.url, method = ?request.method, "executing request");

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = request.form_body {
            builder = builder
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body);
        }

        let mut response = builder.send().await.map_err(|e| map_reqwest_error(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        if tx.unbounded_send(Ok(bytes.to_vec())).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.unbounded_send(Err(map_reqwest_error(&e)));
                        break;
                    }
                }
            }
        });

        Ok(HttpResponse::new(status, headers, BodyChunks::from_receiver(rx)))
    }
}
