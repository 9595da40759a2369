//! Client nonces for Digest authentication.

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};

/// Number of random bytes in a client nonce (32 hex characters).
pub const CNONCE_BYTES: usize = 16;

/// Derive a client nonce from the given cryptographic entropy source.
pub fn cnonce_from<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; CNONCE_BYTES];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fresh client nonce from the operating system's CSPRNG.
pub fn generate_cnonce() -> String {
    cnonce_from(&mut OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_cnonce_is_32_hex_chars() {
        let nonce = generate_cnonce();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cnonce_differs_between_calls() {
        assert_ne!(generate_cnonce(), generate_cnonce());
    }

    #[test]
    fn test_cnonce_is_pure_function_of_entropy() {
        let a = cnonce_from(&mut StdRng::seed_from_u64(7));
        let b = cnonce_from(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
