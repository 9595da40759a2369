//! Device API calls used by the provisioning stages, and their reply parsers.

use crate::auth::DeviceCredentials;
use crate::http::attributes::parse_elements;
use crate::http::multipart::FormFile;
use crate::http::{DeviceResponse, ProxyRequest, RequestBody};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

pub const DEVICE_INFO_PATH: &str = "/axis-cgi/basicdeviceinfo.cgi";
pub const LIST_PATH: &str = "/axis-cgi/applications/list.cgi";
pub const UPLOAD_PATH: &str = "/axis-cgi/applications/upload.cgi";
pub const LICENSE_PATH: &str = "/axis-cgi/applications/license.cgi";
pub const CONTROL_PATH: &str = "/axis-cgi/applications/control.cgi";

/// License upload reply meaning the application already holds a license.
pub const ALREADY_LICENSED_CODE: u32 = 30;

/// Firmware generation, used to pick the package build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Os11,
    Os12,
}

impl OsFamily {
    /// Major version 12 and later is `os12`.
    pub fn from_firmware(version: &str) -> Option<Self> {
        let major: u32 = version.trim().split('.').next()?.trim().parse().ok()?;
        Some(if major >= 12 { OsFamily::Os12 } else { OsFamily::Os11 })
    }

    pub fn token(&self) -> &'static str {
        match self {
            OsFamily::Os11 => "os11",
            OsFamily::Os12 => "os12",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub serial_number: String,
    pub architecture: String,
    pub firmware_version: String,
    pub os_family: OsFamily,
    pub product_number: Option<String>,
    pub model: Option<String>,
}

/// One entry of the installed-application list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub name: String,
    pub version: Option<String>,
    pub status: Option<String>,
    pub license: Option<String>,
}

impl ApplicationStatus {
    pub fn is_running(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("running"))
    }

    pub fn is_licensed(&self) -> bool {
        self.license
            .as_deref()
            .is_some_and(|l| l.eq_ignore_ascii_case("valid"))
    }
}

fn base_url(scheme: &str, ip: &str) -> String {
    format!("{}://{}", scheme, ip)
}

pub fn device_info_request(scheme: &str, ip: &str, credentials: &DeviceCredentials) -> ProxyRequest {
    ProxyRequest::post_json(
        format!("{}{}", base_url(scheme, ip), DEVICE_INFO_PATH),
        credentials.clone(),
        json!({ "apiVersion": "1.0", "method": "getAllProperties" }),
    )
}

pub fn parse_device_info(response: &DeviceResponse) -> Result<DeviceInfo, String> {
    let properties = response
        .json()
        .and_then(|v| v.get("data"))
        .and_then(|v| v.get("propertyList"))
        .ok_or_else(|| format!("unexpected device info reply: {}", response.text()))?;
    let field = |name: &str| {
        properties
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let architecture = field("Architecture").ok_or("device did not report its architecture")?;
    let serial_number = field("SerialNumber").ok_or("device did not report a serial number")?;
    let firmware_version = field("Version").ok_or("device did not report a firmware version")?;
    let os_family = OsFamily::from_firmware(&firmware_version)
        .ok_or_else(|| format!("unrecognised firmware version '{}'", firmware_version))?;

    Ok(DeviceInfo {
        serial_number,
        architecture,
        firmware_version,
        os_family,
        product_number: field("ProdNbr"),
        model: field("ProdFullName"),
    })
}

pub fn list_applications_request(
    scheme: &str,
    ip: &str,
    credentials: &DeviceCredentials,
) -> ProxyRequest {
    ProxyRequest::get(format!("{}{}", base_url(scheme, ip), LIST_PATH), credentials.clone())
}

pub fn parse_applications(text: &str) -> Vec<ApplicationStatus> {
    parse_elements(text, "application")
        .into_iter()
        .filter_map(|element| {
            Some(ApplicationStatus {
                name: element.get("Name")?.to_string(),
                version: element.get("Version").map(str::to_string),
                status: element.get("Status").map(str::to_string),
                license: element.get("License").map(str::to_string),
            })
        })
        .collect()
}

pub fn upload_package_request(
    scheme: &str,
    ip: &str,
    credentials: &DeviceCredentials,
    filename: &str,
    data: Vec<u8>,
) -> ProxyRequest {
    let (content_type, body) =
        FormFile::new("packfil", filename, "application/octet-stream", data).encode();
    ProxyRequest::new("POST", format!("{}{}", base_url(scheme, ip), UPLOAD_PATH), credentials.clone())
        .with_body(RequestBody::Raw {
            content_type,
            data: body,
        })
}

pub fn upload_license_request(
    scheme: &str,
    ip: &str,
    credentials: &DeviceCredentials,
    app: &str,
    license_xml: &str,
) -> ProxyRequest {
    let (content_type, body) =
        FormFile::new("fileData", "license.xml", "text/xml", license_xml.as_bytes().to_vec()).encode();
    ProxyRequest::new(
        "POST",
        format!(
            "{}{}?action=uploadlicensekey&package={}",
            base_url(scheme, ip),
            LICENSE_PATH,
            app
        ),
        credentials.clone(),
    )
    .with_body(RequestBody::Raw {
        content_type,
        data: body,
    })
}

pub fn start_request(scheme: &str, ip: &str, credentials: &DeviceCredentials, app: &str) -> ProxyRequest {
    ProxyRequest::get(
        format!("{}{}?action=start&package={}", base_url(scheme, ip), CONTROL_PATH, app),
        credentials.clone(),
    )
}

pub fn config_request(
    scheme: &str,
    ip: &str,
    credentials: &DeviceCredentials,
    app: &str,
    config: &Value,
) -> ProxyRequest {
    ProxyRequest::post_json(
        format!(
            "{}/local/{}/baton_analytic.cgi?command=setInstallerConfig",
            base_url(scheme, ip),
            app
        ),
        credentials.clone(),
        config.clone(),
    )
}

/// What a package or license upload reply means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadVerdict {
    Accepted,
    AlreadySatisfied,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Package,
    License,
}

/// The numeric code of an `Error: N` reply.
pub fn error_code(text: &str) -> Option<u32> {
    let rest = &text[text.find("Error:")? + "Error:".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn interpret_upload(kind: UploadKind, response: &DeviceResponse) -> UploadVerdict {
    let text = response.text();
    let already_installed = text.to_ascii_lowercase().contains("already installed");

    if kind == UploadKind::Package && already_installed {
        return UploadVerdict::AlreadySatisfied;
    }
    if !response.is_success() {
        return UploadVerdict::Rejected(response.error_message());
    }
    if !text.contains("Error:") {
        return UploadVerdict::Accepted;
    }

    match (kind, error_code(&text)) {
        (_, Some(0)) => UploadVerdict::Accepted,
        (UploadKind::License, Some(ALREADY_LICENSED_CODE)) => UploadVerdict::AlreadySatisfied,
        _ => UploadVerdict::Rejected(text.trim().to_string()),
    }
}

/// Whether a config push failed because the application is mid-restart.
pub fn is_thread_pool_error(response: &DeviceResponse) -> bool {
    response
        .error_message()
        .to_ascii_lowercase()
        .contains("thread pool")
}
