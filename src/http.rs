//! HTTP envelope and the transport contract
//!
//! The orchestrator owns no transport. Callers hand in anything implementing
//! [`Transport`]; the engine only cares that a request envelope comes back as
//! a status + headers + body, or fails with a classified error.

use crate::error::{ConfigError, ExecError, NetworkErrorCode};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default per-request timeout when the caller does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Caller-visible request envelope.
///
/// Headers and query parameters use ordered maps so derived cache keys are
/// stable regardless of insertion order.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub hostname: String,
    pub protocol: Protocol,
    pub method: Method,
    pub path: String,
    pub port: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl HttpCall {
    /// A GET envelope for `hostname` + `path`. Fails when `path` does not
    /// start with `/`.
    pub fn get(hostname: impl Into<String>, path: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(hostname, Method::Get, path)
    }

    pub fn new(
        hostname: impl Into<String>,
        method: Method,
        path: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ConfigError::InvalidPath(path));
        }
        Ok(Self {
            hostname: hostname.into(),
            protocol: Protocol::Https,
            method,
            path,
            port: None,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Full URL, query parameters in key order.
    pub fn url(&self) -> String {
        let mut url = format!(
            "{}://{}:{}{}",
            self.protocol.as_str(),
            self.hostname,
            self.port(),
            self.path
        );
        if !self.query.is_empty() {
            let qs: Vec<String> =
                self.query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }
        url
    }
}

/// What a transport hands back on success.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Classified transport failure: an HTTP status, a network code, or both
/// absent for anything else.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub status: Option<u16>,
    pub code: Option<NetworkErrorCode>,
    pub message: String,
}

impl TransportFailure {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), code: None, message: message.into() }
    }

    pub fn network(code: NetworkErrorCode, message: impl Into<String>) -> Self {
        Self { status: None, code: Some(code), message: message.into() }
    }
}

impl From<TransportFailure> for ExecError {
    fn from(f: TransportFailure) -> Self {
        ExecError::Transport { status: f.status, code: f.code, message: f.message }
    }
}

/// The external collaborator that actually moves bytes.
///
/// Implementations must respect the envelope timeout or the cancellation
/// token; the engine also enforces its own deadline around the call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        call: &HttpCall,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_must_be_rooted() {
        assert!(HttpCall::get("api.example.com", "data").is_err());
        assert!(HttpCall::get("api.example.com", "/data").is_ok());
    }

    #[test]
    fn default_ports_follow_protocol() {
        let call = HttpCall::get("api.example.com", "/x").unwrap();
        assert_eq!(call.port(), 443);
        let call = call.with_protocol(Protocol::Http);
        assert_eq!(call.port(), 80);
        let call = call.with_port(8080);
        assert_eq!(call.port(), 8080);
    }

    #[test]
    fn url_orders_query_parameters() {
        let call = HttpCall::get("api.example.com", "/data")
            .unwrap()
            .with_query("b", "2")
            .with_query("a", "1");
        assert_eq!(call.url(), "https://api.example.com:443/data?a=1&b=2");
    }

    #[test]
    fn response_header_lookup_ignores_case() {
        let mut headers = BTreeMap::new();
        headers.insert("Cache-Control".to_string(), "no-store".to_string());
        let resp = HttpResponse {
            status: 200,
            status_text: "OK".into(),
            headers,
            body: json!({}),
        };
        assert_eq!(resp.header("cache-control"), Some("no-store"));
        assert!(resp.is_success());
    }

    #[test]
    fn transport_failure_converts_to_exec_error() {
        let err: ExecError = TransportFailure::status(503, "unavailable").into();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());

        let err: ExecError =
            TransportFailure::network(NetworkErrorCode::ConnRefused, "refused").into();
        assert!(err.is_retryable());
    }
}
