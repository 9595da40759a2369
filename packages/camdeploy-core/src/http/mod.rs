//! Authenticated HTTP client for device APIs.
//!
//! One logical request walks the ladder no-auth → Basic → Digest, sending the
//! same body each time. Every wire send goes through the injected
//! [`RetryPolicy`].

pub mod attributes;
pub mod multipart;
mod response;
mod retry;
mod transport;

pub use response::{DeviceResponse, ResponseBody};
pub use retry::RetryPolicy;
pub use transport::{ReqwestTransport, Transport, WireRequest, WireResponse};

use crate::auth::{DeviceCredentials, DigestChallenge, generate_cnonce};
use crate::error::DeviceError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Request payload. JSON is serialized anew for each auth attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Raw { content_type: String, data: Vec<u8> },
}

impl RequestBody {
    fn encode(&self) -> Result<(&str, Vec<u8>), DeviceError> {
        match self {
            RequestBody::Json(value) => serde_json::to_vec(value)
                .map(|bytes| ("application/json", bytes))
                .map_err(|e| DeviceError::InvalidRequest(format!("unserializable body: {}", e))),
            RequestBody::Raw { content_type, data } => Ok((content_type.as_str(), data.clone())),
        }
    }
}

/// One logical call against a device.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub url: String,
    pub method: String,
    pub credentials: DeviceCredentials,
    pub body: Option<RequestBody>,
    /// Overrides the transport's default timeout.
    pub timeout: Option<Duration>,
}

impl ProxyRequest {
    pub fn new(method: &str, url: impl Into<String>, credentials: DeviceCredentials) -> Self {
        Self {
            url: url.into(),
            method: method.to_ascii_uppercase(),
            credentials,
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>, credentials: DeviceCredentials) -> Self {
        Self::new("GET", url, credentials)
    }

    pub fn post_json(url: impl Into<String>, credentials: DeviceCredentials, body: Value) -> Self {
        Self::new("POST", url, credentials).with_body(RequestBody::Json(body))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMethod {
    None,
    Basic,
    Digest,
}

/// Stateless authenticated client; cheap to clone and share across tasks.
#[derive(Clone)]
pub struct DeviceClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl DeviceClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Perform `request`, upgrading authentication on 401.
    pub async fn execute(&self, request: &ProxyRequest) -> Result<DeviceResponse, DeviceError> {
        let url = Url::parse(&request.url)
            .map_err(|e| DeviceError::InvalidRequest(format!("bad URL '{}': {}", request.url, e)))?;
        let user = request.credentials.display_user();

        let response = self.send(request, AuthMethod::None, None).await?;
        if response.status != 401 {
            return Ok(DeviceResponse::new(response.status, &response.body));
        }
        let mut challenge_header = digest_header(&response);

        tracing::debug!("{} {} returned 401, trying Basic as {}", request.method, url, user);
        let response = self.send(request, AuthMethod::Basic, None).await?;
        if response.status != 401 {
            return Ok(DeviceResponse::new(response.status, &response.body));
        }
        if let Some(latest) = digest_header(&response) {
            challenge_header = Some(latest);
        }

        let Some(header) = challenge_header else {
            return Err(DeviceError::Auth(format!(
                "{} rejected Basic credentials for {} and offered no Digest challenge",
                url.host_str().unwrap_or("device"),
                user
            )));
        };
        let challenge = DigestChallenge::parse(&header)?;

        tracing::debug!(
            "{} {} rejected Basic, trying Digest ({}) as {}",
            request.method,
            url,
            challenge.algorithm.as_str(),
            user
        );
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let response = self
            .send(request, AuthMethod::Digest, Some((&challenge, &uri)))
            .await?;
        if response.status == 401 {
            return Err(DeviceError::Auth(format!(
                "{} rejected Basic and Digest credentials for {}",
                url.host_str().unwrap_or("device"),
                user
            )));
        }

        Ok(DeviceResponse::new(response.status, &response.body))
    }

    /// One rung of the ladder, retried per policy. The Digest header is
    /// recomputed with a fresh cnonce for every wire attempt.
    async fn send(
        &self,
        request: &ProxyRequest,
        method: AuthMethod,
        digest: Option<(&DigestChallenge, &str)>,
    ) -> Result<WireResponse, DeviceError> {
        let (content_type, body) = match &request.body {
            Some(body) => {
                let (content_type, bytes) = body.encode()?;
                (Some(content_type.to_string()), bytes)
            }
            None => (None, Vec::new()),
        };

        let build = || {
            let mut headers = Vec::new();
            if let Some(content_type) = &content_type {
                headers.push(("Content-Type".to_string(), content_type.clone()));
            }
            let credentials = &request.credentials;
            match (method, digest) {
                (AuthMethod::Basic, _) => {
                    let token = BASE64.encode(format!(
                        "{}:{}",
                        credentials.username, credentials.password
                    ));
                    headers.push(("Authorization".to_string(), format!("Basic {}", token)));
                }
                (AuthMethod::Digest, Some((challenge, uri))) => {
                    let value = challenge.authorization(
                        credentials,
                        &request.method,
                        uri,
                        &body,
                        &generate_cnonce(),
                    );
                    headers.push(("Authorization".to_string(), value));
                }
                _ => {}
            }
            WireRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers,
                body: body.clone(),
                timeout: request.timeout,
            }
        };

        let transport = &self.transport;
        self.retry
            .run(|| {
                let wire = build();
                async move { transport.send(wire).await }
            })
            .await
            .map_err(DeviceError::from)
    }
}

/// The first `WWW-Authenticate` value that offers Digest.
fn digest_header(response: &WireResponse) -> Option<String> {
    response
        .header_values("www-authenticate")
        .find(|v| DigestChallenge::is_offered(v))
        .map(str::to_string)
}
