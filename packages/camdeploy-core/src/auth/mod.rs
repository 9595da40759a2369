//! Device authentication helpers.
//!
//! Provides credential sanitizing, Digest challenge handling and client nonces.

mod credentials;
pub mod digest;
pub mod nonce;

pub use credentials::{DeviceCredentials, sanitize_credential};
pub use digest::{DigestAlgorithm, DigestChallenge, Qop};
pub use nonce::generate_cnonce;
