//! In-process simulated cameras for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use camdeploy_core::auth::digest::header_params;
use camdeploy_core::auth::{DeviceCredentials, DigestAlgorithm, DigestChallenge, Qop};
use camdeploy_core::error::{TransportError, TransportErrorKind};
use camdeploy_core::http::{Transport, WireRequest, WireResponse};
use reqwest::Url;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const REALM: &str = "AXIS_B8A44F000001";
pub const NONCE: &str = "b9f1f1c2a3d4";

#[derive(Debug, Clone)]
pub struct CameraState {
    pub installed: bool,
    pub running: bool,
    pub licensed: bool,
    /// Whether a start command actually starts the application.
    pub starts: bool,
    /// Whether a license upload activates the license.
    pub activates_license: bool,
    pub license_reply: String,
    /// Replies to configuration pushes, consumed in order; afterwards `{"status":"ok"}`.
    pub config_replies: VecDeque<(u16, Value)>,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            installed: false,
            running: false,
            licensed: false,
            starts: true,
            activates_license: true,
            license_reply: "OK".to_string(),
            config_replies: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub path_and_query: String,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

/// A camera that requires Digest authentication for every endpoint.
pub struct SimulatedCamera {
    pub ip: String,
    pub credentials: DeviceCredentials,
    pub state: Mutex<CameraState>,
    pub seen: Mutex<Vec<Seen>>,
}

impl SimulatedCamera {
    pub fn new(ip: &str, state: CameraState) -> Arc<Self> {
        Arc::new(Self {
            ip: ip.to_string(),
            credentials: DeviceCredentials::new("root", "pass"),
            state: Mutex::new(state),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Digest-authenticated requests whose path contains `fragment`; one per
    /// logical call.
    pub fn calls_to(&self, fragment: &str) -> usize {
        self.seen()
            .iter()
            .filter(|s| {
                s.authorization
                    .as_deref()
                    .is_some_and(|a| a.starts_with("Digest "))
                    && s.path_and_query.contains(fragment)
            })
            .count()
    }

    fn challenge(&self) -> DigestChallenge {
        DigestChallenge {
            realm: REALM.to_string(),
            nonce: NONCE.to_string(),
            opaque: None,
            algorithm: DigestAlgorithm::Md5,
            qop: Some(Qop::Auth),
        }
    }

    fn unauthorized(&self) -> WireResponse {
        WireResponse::new(401, "Unauthorized").with_header(
            "WWW-Authenticate",
            &format!(r#"Digest realm="{}", nonce="{}", algorithm=MD5, qop="auth""#, REALM, NONCE),
        )
    }

    fn digest_valid(&self, request: &WireRequest, uri: &str) -> bool {
        let Some(header) = request.header("authorization") else {
            return false;
        };
        let Some(params) = header.strip_prefix("Digest ").map(header_params) else {
            return false;
        };
        let field = |k: &str| params.get(k).cloned().unwrap_or_default();
        if field("username") != self.credentials.username
            || field("uri") != uri
            || field("nc") != "00000001"
            || field("cnonce").len() != 32
        {
            return false;
        }
        let expected = self.challenge().response(
            &self.credentials,
            &request.method,
            uri,
            &request.body,
            &field("cnonce"),
        );
        field("response") == expected
    }

    fn handle(&self, request: &WireRequest, url: &Url) -> WireResponse {
        let path = url.path();
        let query = url.query().unwrap_or("");
        let mut state = self.state.lock().unwrap();

        match path {
            "/axis-cgi/basicdeviceinfo.cgi" => {
                let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
                let properties = json!({
                    "Brand": "AXIS",
                    "ProdType": "Network Camera",
                    "ProdNbr": "P3265-LVE",
                    "ProdFullName": "AXIS P3265-LVE Dome Camera",
                    "SerialNumber": "B8A44F000001",
                    "Architecture": "aarch64",
                    "Version": "12.2.62"
                });
                WireResponse::new(
                    200,
                    json!({
                        "apiVersion": "1.0",
                        "method": body["method"],
                        "data": { "propertyList": properties }
                    })
                    .to_string(),
                )
            }
            "/axis-cgi/applications/list.cgi" => {
                let app = if state.installed {
                    format!(
                        r#"<application Name="BatonAnalytic" NiceName="Baton Analytic" Version="1.3.21" Status="{}" License="{}" />"#,
                        if state.running { "Running" } else { "Stopped" },
                        if state.licensed { "Valid" } else { "None" }
                    )
                } else {
                    String::new()
                };
                WireResponse::new(200, format!("<reply result=\"ok\">{}</reply>", app))
            }
            "/axis-cgi/applications/upload.cgi" => {
                let body = String::from_utf8_lossy(&request.body);
                if !body.contains(r#"name="packfil""#) {
                    return WireResponse::new(400, "Error: 1");
                }
                state.installed = true;
                WireResponse::new(200, "OK")
            }
            "/axis-cgi/applications/license.cgi" => {
                let body = String::from_utf8_lossy(&request.body);
                if !query.contains("action=uploadlicensekey") || !body.contains(r#"name="fileData""#) {
                    return WireResponse::new(400, "Error: 1");
                }
                if state.activates_license || state.license_reply.contains("Error: 30") {
                    state.licensed = true;
                }
                WireResponse::new(200, state.license_reply.clone())
            }
            "/axis-cgi/applications/control.cgi" => {
                if query.contains("action=start") && state.starts {
                    state.running = true;
                    WireResponse::new(200, "OK")
                } else {
                    WireResponse::new(200, "Error: 4")
                }
            }
            "/local/BatonAnalytic/baton_analytic.cgi" => match state.config_replies.pop_front() {
                Some((status, body)) => WireResponse::new(status, body.to_string()),
                None => WireResponse::new(200, json!({"status": "ok"}).to_string()),
            },
            _ => WireResponse::new(404, "Not Found"),
        }
    }
}

#[async_trait]
impl Transport for SimulatedCamera {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;
        if url.host_str() != Some(self.ip.as_str()) {
            return Err(TransportError::new(TransportErrorKind::Timeout, "no route"));
        }

        let uri = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        self.seen.lock().unwrap().push(Seen {
            method: request.method.clone(),
            path_and_query: uri.clone(),
            authorization: request.header("authorization").map(str::to_string),
            body: request.body.clone(),
        });

        if !self.digest_valid(&request, &uri) {
            return Ok(self.unauthorized());
        }
        Ok(self.handle(&request, &url))
    }
}

/// Routes requests to whichever simulated camera owns the target address.
pub struct SimulatedNetwork {
    pub cameras: Vec<Arc<SimulatedCamera>>,
}

#[async_trait]
impl Transport for SimulatedNetwork {
    async fn send(&self, request: WireRequest) -> Result<WireResponse, TransportError> {
        let host = Url::parse(&request.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        match self.cameras.iter().find(|c| c.ip == host) {
            Some(camera) => camera.send(request).await,
            None => Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("{} did not answer", host),
            )),
        }
    }
}
