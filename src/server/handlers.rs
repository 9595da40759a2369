//! Route handlers.

use super::AppState;
use super::jobs::{self, DeploySnapshot, ScanSnapshot};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use camdeploy_core::deploy::vapix::{UploadKind, UploadVerdict, interpret_upload};
use camdeploy_core::http::multipart::FormFile;
use camdeploy_core::{
    DeploymentJob, DeviceCredentials, DeviceResponse, ProxyRequest, RequestBody,
    sanitize_credential,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use uuid::Uuid;

/// Error reply carrying `{"error": message}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found", what))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct ProxyPayload {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub body: Option<Value>,
}

pub async fn proxy(
    State(state): State<AppState>,
    Json(payload): Json<ProxyPayload>,
) -> Result<Json<Value>, ApiError> {
    let method = payload
        .method
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or("GET");
    tracing::info!(
        "Proxying request: {} {} (user: {})",
        method,
        payload.url,
        sanitize_credential(&payload.username)
    );

    let mut request = ProxyRequest::new(
        method,
        payload.url,
        DeviceCredentials::new(payload.username, payload.password),
    );
    if let Some(body) = payload.body.filter(|b| !b.is_null()) {
        request = request.with_body(RequestBody::Json(body));
    }

    let response = state.stack.client.execute(&request).await.map_err(|e| {
        tracing::warn!("Device request failed: {}", e);
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Request failed: {}", e),
        )
    })?;

    Ok(Json(proxy_reply(&response)))
}

fn proxy_reply(response: &DeviceResponse) -> Value {
    let mut reply = json!({
        "status": response.status,
        "data": response.to_json(),
    });
    if !response.is_success() {
        reply["error"] = Value::String(response.error_message());
    }
    reply
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageUploadPayload {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(alias = "acapUrl")]
    pub package_url: String,
}

pub async fn upload_package(
    State(state): State<AppState>,
    Json(payload): Json<PackageUploadPayload>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!("Package upload started: {} -> {}", payload.package_url, payload.url);

    let download_failed = |e: String| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to download package: {}", e),
        )
    };
    let response = state
        .downloads
        .get(&payload.package_url)
        .send()
        .await
        .map_err(|e| download_failed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Package source returned error: {}", response.status().as_u16()),
        ));
    }
    let data = response
        .bytes()
        .await
        .map_err(|e| download_failed(e.to_string()))?;
    tracing::info!(
        "Package downloaded ({:.2} MB), uploading to device",
        data.len() as f64 / 1024.0 / 1024.0
    );

    let filename = package_file_name(&payload.package_url);
    let form = FormFile::new("packfil", &filename, "application/octet-stream", data.to_vec());
    let credentials = DeviceCredentials::new(payload.username, payload.password);
    upload(&state, &payload.url, credentials, form, UploadKind::Package).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseUploadPayload {
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(alias = "licenseXML")]
    pub license_xml: String,
}

pub async fn upload_license(
    State(state): State<AppState>,
    Json(payload): Json<LicenseUploadPayload>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!("License upload started ({} bytes)", payload.license_xml.len());
    let form = FormFile::new(
        "fileData",
        "license.xml",
        "text/xml",
        payload.license_xml.into_bytes(),
    );
    let credentials = DeviceCredentials::new(payload.username, payload.password);
    upload(&state, &payload.url, credentials, form, UploadKind::License).await
}

async fn upload(
    state: &AppState,
    url: &str,
    credentials: DeviceCredentials,
    form: FormFile,
    kind: UploadKind,
) -> Result<Json<Value>, ApiError> {
    let (content_type, data) = form.encode();
    let request = ProxyRequest::new("POST", url, credentials)
        .with_body(RequestBody::Raw { content_type, data })
        .with_timeout(Duration::from_secs(state.config.deploy.upload_timeout_secs));

    let response = state.stack.upload_client.execute(&request).await.map_err(|e| {
        tracing::warn!("Upload to {} failed: {}", url, e);
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("Upload failed: {}", e))
    })?;

    match interpret_upload(kind, &response) {
        UploadVerdict::Rejected(reason) => {
            tracing::warn!(
                "Device rejected upload (HTTP {}): {}",
                response.status,
                reason
            );
            let status = if response.status >= 400 {
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY)
            } else {
                StatusCode::BAD_REQUEST
            };
            Err(ApiError::new(status, reason))
        }
        verdict => {
            let message = match (kind, verdict) {
                (UploadKind::Package, UploadVerdict::AlreadySatisfied) => "Package already installed",
                (UploadKind::Package, _) => "Package uploaded successfully",
                (UploadKind::License, UploadVerdict::AlreadySatisfied) => "License already installed",
                (UploadKind::License, _) => "License uploaded successfully",
            };
            tracing::info!("{} ({})", message, url);
            Ok(Json(json!({
                "success": true,
                "status": response.status,
                "message": message,
            })))
        }
    }
}

/// File name for a downloaded package: the URL's last path segment.
fn package_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("package.eap")
        .to_string()
}

#[derive(Debug, Deserialize)]
pub struct ScanPayload {
    pub cidr: String,
    pub username: String,
    pub password: String,
}

pub async fn start_scan(
    State(state): State<AppState>,
    Json(payload): Json<ScanPayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = state
        .scans
        .insert(|id| ScanSnapshot::new(id, &payload.cidr, 0));
    let credentials = DeviceCredentials::new(payload.username, payload.password);

    let stream = match state.scanner.scan(
        &payload.cidr,
        credentials,
        Some(jobs::scan_progress(&job.updates)),
    ) {
        Ok(stream) => stream,
        Err(e) => {
            state.scans.remove(&job.id);
            return Err(ApiError::new(StatusCode::BAD_REQUEST, e.to_string()));
        }
    };

    let total = stream.total();
    job.updates.send_modify(|s| s.total_ips = total);
    let scan_id = job.id;
    tokio::spawn(jobs::run_scan(stream, job));

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "scanId": scan_id,
            "totalIps": total,
            "status": "running",
        })),
    ))
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanSnapshot>, ApiError> {
    state
        .scans
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Scan"))
}

pub async fn cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !state.scans.cancel(&id) {
        return Err(ApiError::not_found("Scan"));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "scanId": id, "status": "cancelling" })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    pub ip: String,
    pub username: String,
    pub password: String,
    pub license_key: String,
    #[serde(default, alias = "licenseXML")]
    pub license_xml: Option<String>,
    #[serde(default)]
    pub config: Value,
}

pub async fn start_deploy(
    State(state): State<AppState>,
    Json(payload): Json<DeployPayload>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if payload.ip.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "ip is required"));
    }

    let mut deployment = DeploymentJob::new(
        payload.ip.trim(),
        DeviceCredentials::new(payload.username, payload.password),
        payload.license_key,
        payload.config,
    );
    if let Some(xml) = payload.license_xml.filter(|x| !x.trim().is_empty()) {
        deployment = deployment.with_license_xml(xml);
    }

    let job = state
        .deploys
        .insert(|id| DeploySnapshot::new(id, &deployment.device.ip));
    let job_id = job.id;
    tracing::info!("Deployment {} queued for {}", job_id, deployment.device.ip);
    tokio::spawn(jobs::run_deploy(state.orchestrator.clone(), deployment, job));

    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

pub async fn get_deploy(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploySnapshot>, ApiError> {
    state
        .deploys
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Deployment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_file_name() {
        assert_eq!(
            package_file_name("https://host/releases/download/v1/App_1_aarch64.eap?x=1"),
            "App_1_aarch64.eap"
        );
        assert_eq!(package_file_name("https://host/"), "package.eap");
    }

    #[test]
    fn test_proxy_reply_carries_device_error() {
        let ok = proxy_reply(&DeviceResponse::new(200, br#"{"data":{"a":1}}"#));
        assert_eq!(ok["status"], 200);
        assert_eq!(ok["data"]["data"]["a"], 1);
        assert!(ok.get("error").is_none());

        let failed = proxy_reply(&DeviceResponse::new(404, b"Not Found"));
        assert_eq!(failed["data"]["text"], "Not Found");
        assert_eq!(failed["error"], "Not Found");
    }
}
