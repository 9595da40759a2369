//! Wire transport: one HTTP request in, one HTTP response out.
//!
//! [`Transport`] is the seam between the authentication ladder and the
//! network. Production code uses [`ReqwestTransport`]; tests plug in
//! simulated devices.

use crate::error::{TransportError, TransportErrorKind};
use crate::tls::{CertificateStore, PIN_REJECTED_MARKER, PinPolicy, pinned_client_config};
use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

/// A fully-built request, ready for the wire.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Option<Duration>,
}

impl WireRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// All values of a (case-insensitive) header.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_values("content-type").next()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError>;
}

/// reqwest-backed transport with certificate pinning.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport whose requests time out after `timeout` unless the
    /// request carries its own.
    pub fn new(
        store: Arc<CertificateStore>,
        policy: PinPolicy,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(pinned_client_config(store, policy))
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
            TransportError::new(
                TransportErrorKind::Other,
                format!("invalid method {}", request.method),
            )
        })?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();

        Ok(WireResponse {
            status,
            headers,
            body,
        })
    }
}

/// Map a reqwest failure onto the transport taxonomy.
fn classify(err: reqwest::Error) -> TransportError {
    let message = describe(&err);

    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if message.contains(PIN_REJECTED_MARKER) {
        TransportErrorKind::PinRejected
    } else if let Some(io) = io_kind(&err) {
        match io {
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Unreachable,
        }
    } else if err.is_connect() {
        TransportErrorKind::Unreachable
    } else {
        TransportErrorKind::Other
    };

    TransportError::new(kind, message)
}

/// The error and its whole source chain on one line.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn io_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = WireResponse::new(401, "")
            .with_header("WWW-Authenticate", "Basic realm=\"a\"")
            .with_header("www-authenticate", "Digest realm=\"a\", nonce=\"n\"");
        assert_eq!(response.header_values("www-authenticate").count(), 2);
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        let transport = ReqwestTransport::new(
            Arc::new(CertificateStore::in_memory()),
            PinPolicy::Warn,
            Duration::from_secs(2),
        )
        .unwrap();

        // Nothing listens on port 9 of the loopback interface.
        let err = transport
            .send(WireRequest {
                method: "GET".into(),
                url: "http://127.0.0.1:9/".into(),
                headers: vec![],
                body: vec![],
                timeout: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_network());
    }
}
