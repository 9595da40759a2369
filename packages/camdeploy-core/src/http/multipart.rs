//! Single-file `multipart/form-data` bodies.
//!
//! Built by hand rather than through reqwest's multipart support because the
//! body must be plain bytes that can be resent for each auth attempt.

use rand::Rng;
use rand::distributions::Alphanumeric;

const BOUNDARY_PREFIX: &str = "----WebKitFormBoundary";

#[derive(Debug, Clone)]
pub struct FormFile {
    pub field: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl FormFile {
    pub fn new(
        field: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            field: field.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Encode with a fresh random boundary. Returns the `Content-Type` header
    /// value and the body.
    pub fn encode(&self) -> (String, Vec<u8>) {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        self.encode_with_boundary(&format!("{}{}", BOUNDARY_PREFIX, suffix))
    }

    pub fn encode_with_boundary(&self, boundary: &str) -> (String, Vec<u8>) {
        let mut body = Vec::with_capacity(self.data.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                self.field, self.filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", self.content_type).as_bytes());
        body.extend_from_slice(&self.data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        (format!("multipart/form-data; boundary={}", boundary), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_license_form_layout() {
        let file = FormFile::new("fileData", "license.xml", "text/xml", b"<lic/>".to_vec());
        let (content_type, body) = file.encode_with_boundary("XYZ");
        let body = String::from_utf8(body).unwrap();

        assert_eq!(content_type, "multipart/form-data; boundary=XYZ");
        assert_eq!(
            body,
            "--XYZ\r\nContent-Disposition: form-data; name=\"fileData\"; filename=\"license.xml\"\r\nContent-Type: text/xml\r\n\r\n<lic/>\r\n--XYZ--\r\n"
        );
    }

    #[test]
    fn test_random_boundary_shape() {
        let (content_type, _) = FormFile::new("packfil", "a.eap", "application/octet-stream", vec![1]).encode();
        let boundary = content_type.split("boundary=").nth(1).unwrap();
        assert!(boundary.starts_with(BOUNDARY_PREFIX));
        let suffix = &boundary[BOUNDARY_PREFIX.len()..];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
