//! HTTP Digest authentication (RFC 2617 / RFC 7616).
//!
//! Parses `WWW-Authenticate: Digest ...` challenges and computes the matching
//! `Authorization` header. RFC 2069 devices (no `qop`) are supported.

use super::DeviceCredentials;
use crate::error::DeviceError;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Nonce count sent with every Digest attempt. Each attempt uses a fresh
/// cnonce, so the count never advances.
pub const NONCE_COUNT: &str = "00000001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }

    fn hash(&self, input: &[u8]) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex::encode(Md5::digest(input)),
            Self::Sha256 | Self::Sha256Sess => hex::encode(Sha256::digest(input)),
        }
    }
}

/// Quality of protection selected from the server's offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// A parsed Digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<Qop>,
}

impl DigestChallenge {
    /// Parse one `WWW-Authenticate` header value.
    ///
    /// The value may carry several challenges (`Digest ..., Basic ...`); only
    /// the Digest one is read. Realm and nonce are mandatory.
    pub fn parse(header: &str) -> Result<Self, DeviceError> {
        let offset = digest_offset(header).ok_or_else(|| {
            DeviceError::Protocol(format!("not a Digest challenge: {}", header))
        })?;
        let params = header_params(&header[offset + "digest".len()..]);

        let realm = params.get("realm").cloned().unwrap_or_default();
        let nonce = params.get("nonce").cloned().unwrap_or_default();
        if realm.is_empty() || nonce.is_empty() {
            return Err(DeviceError::Protocol(format!(
                "Digest challenge missing realm or nonce: {}",
                header
            )));
        }

        let algorithm = match params.get("algorithm") {
            Some(token) => DigestAlgorithm::parse(token).ok_or_else(|| {
                DeviceError::Protocol(format!("unsupported Digest algorithm '{}'", token))
            })?,
            None => DigestAlgorithm::Md5,
        };

        let qop = params.get("qop").and_then(|offer| {
            let options: Vec<String> = offer
                .split(',')
                .map(|o| o.trim().to_ascii_lowercase())
                .collect();
            if options.iter().any(|o| o == "auth") {
                Some(Qop::Auth)
            } else if options.iter().any(|o| o == "auth-int") {
                Some(Qop::AuthInt)
            } else {
                None
            }
        });

        Ok(Self {
            realm,
            nonce,
            opaque: params.get("opaque").filter(|o| !o.is_empty()).cloned(),
            algorithm,
            qop,
        })
    }

    /// Whether a header value offers a Digest challenge at all.
    pub fn is_offered(header: &str) -> bool {
        digest_offset(header).is_some()
    }

    /// Compute the `response` hash for the given request.
    pub fn response(
        &self,
        credentials: &DeviceCredentials,
        method: &str,
        uri: &str,
        body: &[u8],
        cnonce: &str,
    ) -> String {
        let alg = self.algorithm;

        let mut ha1 = alg.hash(
            format!(
                "{}:{}:{}",
                credentials.username, self.realm, credentials.password
            )
            .as_bytes(),
        );
        if alg.is_session() {
            ha1 = alg.hash(format!("{}:{}:{}", ha1, self.nonce, cnonce).as_bytes());
        }

        let ha2 = match self.qop {
            Some(Qop::AuthInt) => {
                alg.hash(format!("{}:{}:{}", method, uri, alg.hash(body)).as_bytes())
            }
            _ => alg.hash(format!("{}:{}", method, uri).as_bytes()),
        };

        match self.qop {
            None => alg.hash(format!("{}:{}:{}", ha1, self.nonce, ha2).as_bytes()),
            Some(qop) => alg.hash(
                format!(
                    "{}:{}:{}:{}:{}:{}",
                    ha1,
                    self.nonce,
                    NONCE_COUNT,
                    cnonce,
                    qop.as_str(),
                    ha2
                )
                .as_bytes(),
            ),
        }
    }

    /// Build the full `Authorization` header value.
    pub fn authorization(
        &self,
        credentials: &DeviceCredentials,
        method: &str,
        uri: &str,
        body: &[u8],
        cnonce: &str,
    ) -> String {
        let response = self.response(credentials, method, uri, body, cnonce);

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
            quote(&credentials.username),
            quote(&self.realm),
            quote(&self.nonce),
            quote(uri),
            response
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, quote(opaque)));
        }
        header.push_str(&format!(", algorithm={}", self.algorithm.as_str()));
        if let Some(qop) = self.qop {
            header.push_str(&format!(
                r#", qop={}, nc={}, cnonce="{}""#,
                qop.as_str(),
                NONCE_COUNT,
                cnonce
            ));
        }
        header
    }
}

/// Escape a value for use inside a quoted-string parameter.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}

/// Byte offset of the `Digest` scheme token inside a header value.
fn digest_offset(header: &str) -> Option<usize> {
    let lower = header.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find("digest") {
        let at = from + pos;
        let before = lower[..at].trim_end();
        let starts_challenge = before.is_empty() || before.ends_with(',');
        let followed_by_space = lower[at + 6..].starts_with(char::is_whitespace);
        if starts_challenge && followed_by_space {
            return Some(at);
        }
        from = at + 6;
    }
    None
}

/// Parse `key=value` / `key="quoted value"` pairs of an auth header.
///
/// Keys are lowercased. Parsing stops at a bare token, which marks the start
/// of the next challenge scheme.
pub fn header_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }

        let key_end = rest
            .find(|c: char| c == '=' || c == ',' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = rest[..key_end].to_ascii_lowercase();
        let Some(after_eq) = rest[key_end..].trim_start().strip_prefix('=') else {
            break;
        };
        let after_eq = after_eq.trim_start();

        let (value, remainder) = match after_eq.strip_prefix('"') {
            Some(quoted) => read_quoted(quoted),
            None => {
                let end = after_eq.find(',').unwrap_or(after_eq.len());
                (after_eq[..end].trim().to_string(), &after_eq[end..])
            }
        };

        if !key.is_empty() {
            params.insert(key, value);
        }
        rest = remainder;
    }

    params
}

fn read_quoted(input: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            '"' => return (value, &input[i + 1..]),
            _ => value.push(c),
        }
    }
    (value, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md5_hex(input: &str) -> String {
        hex::encode(Md5::digest(input.as_bytes()))
    }

    fn creds() -> DeviceCredentials {
        DeviceCredentials::new("root", "pass")
    }

    #[test]
    fn test_parse_axis_challenge() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="AXIS_ACCC8E000000", nonce="abc123", algorithm=MD5, qop="auth""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "AXIS_ACCC8E000000");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
        assert_eq!(challenge.qop, Some(Qop::Auth));
        assert_eq!(challenge.opaque, None);
    }

    #[test]
    fn test_parse_defaults_to_md5_and_prefers_auth() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="r", nonce="n", qop="auth-int,auth", opaque="op""#,
        )
        .unwrap();
        assert_eq!(challenge.algorithm, DigestAlgorithm::Md5);
        assert_eq!(challenge.qop, Some(Qop::Auth));
        assert_eq!(challenge.opaque.as_deref(), Some("op"));
    }

    #[test]
    fn test_parse_combined_header() {
        let challenge =
            DigestChallenge::parse(r#"Basic realm="x", Digest realm="cam", nonce="n1""#).unwrap();
        assert_eq!(challenge.realm, "cam");
        assert_eq!(challenge.nonce, "n1");
    }

    #[test]
    fn test_parse_rejects_missing_nonce() {
        let err = DigestChallenge::parse(r#"Digest realm="cam""#).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_parse_rejects_basic_only() {
        assert!(DigestChallenge::parse(r#"Basic realm="cam""#).is_err());
        assert!(!DigestChallenge::is_offered(r#"Basic realm="cam""#));
    }

    #[test]
    fn test_parse_rejects_unknown_algorithm() {
        let err =
            DigestChallenge::parse(r#"Digest realm="r", nonce="n", algorithm=SHA-512"#).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[test]
    fn test_response_with_qop() {
        let challenge = DigestChallenge::parse(r#"Digest realm="r", nonce="n", qop="auth""#).unwrap();
        let ha1 = md5_hex("root:r:pass");
        let ha2 = md5_hex("POST:/axis-cgi/basicdeviceinfo.cgi");
        let expected = md5_hex(&format!("{}:n:00000001:cn:auth:{}", ha1, ha2));

        let response =
            challenge.response(&creds(), "POST", "/axis-cgi/basicdeviceinfo.cgi", b"{}", "cn");
        assert_eq!(response, expected);
    }

    #[test]
    fn test_response_without_qop_is_rfc2069() {
        let challenge = DigestChallenge::parse(r#"Digest realm="r", nonce="n""#).unwrap();
        let ha1 = md5_hex("root:r:pass");
        let ha2 = md5_hex("GET:/index.html");
        let expected = md5_hex(&format!("{}:n:{}", ha1, ha2));

        assert_eq!(
            challenge.response(&creds(), "GET", "/index.html", b"", "ignored"),
            expected
        );
    }

    #[test]
    fn test_authorization_header_fields() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="r", nonce="n", opaque="o", qop="auth""#,
        )
        .unwrap();
        let header = challenge.authorization(&creds(), "GET", "/x?y=1", b"", "c0ffee");

        assert!(header.starts_with("Digest "));
        let params = header_params(&header["Digest".len()..]);
        assert_eq!(params["username"], "root");
        assert_eq!(params["uri"], "/x?y=1");
        assert_eq!(params["opaque"], "o");
        assert_eq!(params["algorithm"], "MD5");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["nc"], NONCE_COUNT);
        assert_eq!(params["cnonce"], "c0ffee");
        assert_eq!(
            params["response"],
            challenge.response(&creds(), "GET", "/x?y=1", b"", "c0ffee")
        );
    }

    #[test]
    fn test_authorization_escapes_quoted_values() {
        let challenge =
            DigestChallenge::parse(r#"Digest realm="lab \"north\"", nonce="n", qop="auth""#)
                .unwrap();
        let user = DeviceCredentials::new(r#"ad"min\ops"#, "pass");
        let header = challenge.authorization(&user, "GET", "/", b"", "c");

        assert!(header.contains(r#"username="ad\"min\\ops""#));
        let params = header_params(&header["Digest".len()..]);
        assert_eq!(params["username"], r#"ad"min\ops"#);
        assert_eq!(params["realm"], r#"lab "north""#);
        assert_eq!(params["response"], challenge.response(&user, "GET", "/", b"", "c"));
    }

    #[test]
    fn test_sha256_session_changes_ha1() {
        let plain = DigestChallenge::parse(r#"Digest realm="r", nonce="n", algorithm=SHA-256"#)
            .unwrap();
        let sess = DigestChallenge::parse(
            r#"Digest realm="r", nonce="n", algorithm=SHA-256-sess"#,
        )
        .unwrap();
        let a = plain.response(&creds(), "GET", "/", b"", "c");
        let b = sess.response(&creds(), "GET", "/", b"", "c");
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_header_params_handles_escapes_and_tokens() {
        let params = header_params(r#" realm="a \"b\"", stale=FALSE, nonce="x,y""#);
        assert_eq!(params["realm"], r#"a "b""#);
        assert_eq!(params["stale"], "FALSE");
        assert_eq!(params["nonce"], "x,y");
    }
}
