//! Device identification through the basic device info API.

use crate::auth::DeviceCredentials;
use crate::http::{DeviceClient, DeviceResponse, ProxyRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::Ipv4Addr;
use std::time::Duration;

pub const PROBE_PATH: &str = "/axis-cgi/basicdeviceinfo.cgi";

const PROBE_PROPERTIES: [&str; 6] = [
    "Brand",
    "ProdType",
    "ProdNbr",
    "ProdFullName",
    "SerialNumber",
    "Architecture",
];

/// Product family derived from the product number prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Camera,
    Speaker,
    Intercom,
    AccessControl,
    Unknown,
}

impl DeviceKind {
    pub fn from_product_number(product_number: &str) -> Self {
        match product_number.trim().chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('M' | 'P' | 'Q') => DeviceKind::Camera,
            Some('C') => DeviceKind::Speaker,
            Some('I') => DeviceKind::Intercom,
            Some('A') => DeviceKind::AccessControl,
            _ => DeviceKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub ip: String,
    pub vendor_brand: String,
    pub model: String,
    pub serial_number: String,
    pub product_type: String,
    pub product_number: String,
    pub architecture: Option<String>,
    pub device_kind: DeviceKind,
}

pub fn probe_body() -> Value {
    json!({
        "apiVersion": "1.0",
        "method": "getProperties",
        "params": { "propertyList": PROBE_PROPERTIES }
    })
}

/// Probe one address. Any failure means "no device here".
pub async fn probe(
    client: &DeviceClient,
    scheme: &str,
    ip: Ipv4Addr,
    credentials: &DeviceCredentials,
    timeout: Duration,
) -> Option<DiscoveredDevice> {
    let request = ProxyRequest::post_json(
        format!("{}://{}{}", scheme, ip, PROBE_PATH),
        credentials.clone(),
        probe_body(),
    )
    .with_timeout(timeout);

    match client.execute(&request).await {
        Ok(response) => identify(ip, &response),
        Err(e) => {
            tracing::trace!("No device at {}: {}", ip, e);
            None
        }
    }
}

/// Build a device from a probe reply; `None` unless the reply carries the
/// vendor-identifying fields.
pub fn identify(ip: Ipv4Addr, response: &DeviceResponse) -> Option<DiscoveredDevice> {
    if response.status != 200 {
        return None;
    }
    let properties = response.json()?.get("data")?.get("propertyList")?;
    let field = |name: &str| {
        properties
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let vendor_brand = field("Brand")?;
    let serial_number = field("SerialNumber")?;
    let product_number = field("ProdNbr").unwrap_or_default();

    Some(DiscoveredDevice {
        ip: ip.to_string(),
        vendor_brand,
        model: field("ProdFullName").unwrap_or_else(|| product_number.clone()),
        serial_number,
        product_type: field("ProdType").unwrap_or_default(),
        device_kind: DeviceKind::from_product_number(&product_number),
        product_number,
        architecture: field("Architecture"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u16, body: Value) -> DeviceResponse {
        DeviceResponse::new(status, body.to_string().as_bytes())
    }

    #[test]
    fn test_identifies_camera() {
        let response = reply(
            200,
            json!({"apiVersion": "1.0", "data": {"propertyList": {
                "Brand": "AXIS", "ProdType": "Network Camera", "ProdNbr": "M3086-V",
                "ProdFullName": "AXIS M3086-V Network Camera", "SerialNumber": "B8A44F000001",
                "Architecture": "aarch64"
            }}}),
        );
        let device = identify(Ipv4Addr::new(10, 0, 0, 9), &response).unwrap();
        assert_eq!(device.vendor_brand, "AXIS");
        assert_eq!(device.model, "AXIS M3086-V Network Camera");
        assert_eq!(device.architecture.as_deref(), Some("aarch64"));
        assert_eq!(device.device_kind, DeviceKind::Camera);
    }

    #[test]
    fn test_missing_serial_is_not_a_device() {
        let response = reply(200, json!({"data": {"propertyList": {"Brand": "AXIS"}}}));
        assert!(identify(Ipv4Addr::LOCALHOST, &response).is_none());
    }

    #[test]
    fn test_non_200_and_text_are_not_devices() {
        let ok = json!({"data": {"propertyList": {"Brand": "AXIS", "SerialNumber": "1"}}});
        assert!(identify(Ipv4Addr::LOCALHOST, &reply(404, ok)).is_none());
        let text = DeviceResponse::new(200, b"<html>router login</html>");
        assert!(identify(Ipv4Addr::LOCALHOST, &text).is_none());
    }

    #[test]
    fn test_device_kind_prefixes() {
        assert_eq!(DeviceKind::from_product_number("P3265"), DeviceKind::Camera);
        assert_eq!(DeviceKind::from_product_number("q1615"), DeviceKind::Camera);
        assert_eq!(DeviceKind::from_product_number("C1310-E"), DeviceKind::Speaker);
        assert_eq!(DeviceKind::from_product_number("I8016-LVE"), DeviceKind::Intercom);
        assert_eq!(DeviceKind::from_product_number("A1001"), DeviceKind::AccessControl);
        assert_eq!(DeviceKind::from_product_number(""), DeviceKind::Unknown);
    }

    #[test]
    fn test_probe_body_requests_architecture() {
        let body = probe_body();
        assert_eq!(body["method"], "getProperties");
        assert!(
            body["params"]["propertyList"]
                .as_array()
                .unwrap()
                .iter()
                .any(|p| p == "Architecture")
        );
    }
}
