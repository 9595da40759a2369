//! Device credentials and the log sanitizer.
//!
//! Passwords never reach a log sink in plaintext. Anything that needs to
//! mention a credential renders it through [`sanitize_credential`].

use serde::Deserialize;
use std::fmt;

/// Username/password pair for a device's HTTP API.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub username: String,
    pub password: String,
}

impl DeviceCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Username as it may appear in logs.
    pub fn display_user(&self) -> String {
        sanitize_credential(&self.username)
    }
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("username", &sanitize_credential(&self.username))
            .field("password", &sanitize_credential(&self.password))
            .finish()
    }
}

/// Mask a credential for logging, keeping only the first and last character.
///
/// `"anava"` becomes `"a***a"`; one-character values become `"*"` and
/// two-character values keep only the first character.
pub fn sanitize_credential(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    match chars.len() {
        0 => "[empty]".to_string(),
        1 => "*".to_string(),
        2 => format!("{}*", chars[0]),
        n => format!("{}{}{}", chars[0], "*".repeat(n - 2), chars[n - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_first_and_last() {
        assert_eq!(sanitize_credential("anava"), "a***a");
        assert_eq!(sanitize_credential("root"), "r**t");
    }

    #[test]
    fn test_sanitize_short_values() {
        assert_eq!(sanitize_credential(""), "[empty]");
        assert_eq!(sanitize_credential("x"), "*");
        assert_eq!(sanitize_credential("ab"), "a*");
    }

    #[test]
    fn test_sanitize_multibyte() {
        assert_eq!(sanitize_credential("pässwörd"), "p******d");
    }

    #[test]
    fn test_debug_never_shows_password() {
        let creds = DeviceCredentials::new("admin", "hunter22");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter22"));
        assert!(!rendered.contains("admin"));
        assert!(rendered.contains("h******2"));
    }
}
