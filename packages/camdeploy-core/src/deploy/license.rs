//! License signing. The signer is an external service; this crate only
//! carries its result to the device.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait LicenseSigner: Send + Sync {
    /// Signed license XML bound to `device_id` (the device serial number).
    async fn sign(&self, device_id: &str, license_key: &str, application: &str) -> Result<String>;
}

/// A license file that was signed ahead of time.
pub struct StaticLicense(pub String);

#[async_trait]
impl LicenseSigner for StaticLicense {
    async fn sign(&self, _device_id: &str, _license_key: &str, _application: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Used when no signer is configured; every request fails with a clear reason.
pub struct NoSigner;

#[async_trait]
impl LicenseSigner for NoSigner {
    async fn sign(&self, _device_id: &str, _license_key: &str, _application: &str) -> Result<String> {
        Err(anyhow::anyhow!(
            "No license signer configured; set deploy.license_signer_url or supply license XML"
        ))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    device_id: &'a str,
    license_key: &'a str,
    application_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    license_xml: String,
}

/// Signing service reached over HTTPS.
pub struct RemoteLicenseSigner {
    url: String,
    client: reqwest::Client,
}

impl RemoteLicenseSigner {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LicenseSigner for RemoteLicenseSigner {
    async fn sign(&self, device_id: &str, license_key: &str, application: &str) -> Result<String> {
        let resp = self
            .client
            .post(&self.url)
            .json(&SignRequest {
                device_id,
                license_key,
                application_name: application,
            })
            .send()
            .await
            .context("Failed to reach license signer")?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("License signer returned error: {}", resp.status()));
        }

        let signed: SignResponse = resp
            .json()
            .await
            .context("Failed to parse license signer response")?;
        if signed.license_xml.trim().is_empty() {
            return Err(anyhow::anyhow!("License signer returned an empty license"));
        }
        Ok(signed.license_xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_remote_signer_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .and(body_json(serde_json::json!({
                "deviceId": "B8A44F000001",
                "licenseKey": "KEY-1",
                "applicationName": "BatonAnalytic"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"licenseXml": "<license/>"})),
            )
            .mount(&server)
            .await;

        let signer = RemoteLicenseSigner::new(format!("{}/sign", server.uri()));
        let xml = signer.sign("B8A44F000001", "KEY-1", "BatonAnalytic").await.unwrap();
        assert_eq!(xml, "<license/>");
    }

    #[tokio::test]
    async fn test_remote_signer_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let signer = RemoteLicenseSigner::new(server.uri());
        assert!(signer.sign("x", "y", "z").await.is_err());
    }

    #[tokio::test]
    async fn test_no_signer_fails() {
        assert!(NoSigner.sign("x", "y", "z").await.is_err());
    }
}
