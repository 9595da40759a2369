//! Device replies, modelled as structured JSON or free text.

use serde_json::{Value, json};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Structured(Value),
    /// Plain text or the XML-like blobs the application CGIs return.
    Text(String),
    Empty,
}

impl ResponseBody {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return ResponseBody::Empty;
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(value) if value.is_object() || value.is_array() => ResponseBody::Structured(value),
            _ => ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl DeviceResponse {
    pub fn new(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            body: ResponseBody::from_bytes(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Structured(value) => Some(value),
            _ => None,
        }
    }

    /// The body as text, serializing JSON if necessary.
    pub fn text(&self) -> Cow<'_, str> {
        match &self.body {
            ResponseBody::Structured(value) => Cow::Owned(value.to_string()),
            ResponseBody::Text(text) => Cow::Borrowed(text),
            ResponseBody::Empty => Cow::Borrowed(""),
        }
    }

    /// JSON view of the body; text is wrapped as `{"text": ...}`.
    pub fn to_json(&self) -> Value {
        match &self.body {
            ResponseBody::Structured(value) => value.clone(),
            ResponseBody::Text(text) => json!({ "text": text }),
            ResponseBody::Empty => json!({ "text": "" }),
        }
    }

    /// Human-readable failure reason: the JSON `error` field, then the body
    /// text, then `HTTP <status>`.
    pub fn error_message(&self) -> String {
        if let Some(error) = self.json().and_then(|v| v.get("error")) {
            match error {
                Value::String(s) if !s.is_empty() => return s.clone(),
                Value::Object(obj) => {
                    if let Some(message) = obj.get("message").and_then(Value::as_str) {
                        return message.to_string();
                    }
                    return error.to_string();
                }
                Value::Null => {}
                other => return other.to_string(),
            }
        }
        if let ResponseBody::Text(text) = &self.body {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        format!("HTTP {}", self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_body_is_structured() {
        let response = DeviceResponse::new(200, br#"{"data":{"propertyList":{}}}"#);
        assert!(response.json().is_some());
    }

    #[test]
    fn test_xml_body_is_text() {
        let response = DeviceResponse::new(200, b"<reply result=\"ok\"></reply>");
        assert!(matches!(response.body, ResponseBody::Text(_)));
        assert_eq!(response.to_json()["text"], "<reply result=\"ok\"></reply>");
    }

    #[test]
    fn test_bare_json_scalar_stays_text() {
        let response = DeviceResponse::new(200, b"OK");
        assert_eq!(response.body, ResponseBody::Text("OK".into()));
        let response = DeviceResponse::new(200, b"42");
        assert_eq!(response.body, ResponseBody::Text("42".into()));
    }

    #[test]
    fn test_error_message_precedence() {
        let vapix = DeviceResponse::new(
            400,
            br#"{"error":{"code":2002,"message":"Method not supported"}}"#,
        );
        assert_eq!(vapix.error_message(), "Method not supported");

        let plain = DeviceResponse::new(400, br#"{"error":"bad"}"#);
        assert_eq!(plain.error_message(), "bad");

        let text = DeviceResponse::new(500, b"  Error: 12  ");
        assert_eq!(text.error_message(), "Error: 12");

        let empty = DeviceResponse::new(503, b"");
        assert_eq!(empty.error_message(), "HTTP 503");
    }
}
