//! Agent token generation and hashing.
//!
//! Agent tokens are minted once, shown to the operator once, and stored
//! only as a SHA-256 hash. A connecting agent presents the plaintext token;
//! the hub hashes it and looks the server up by hash.
//!
//! Token format: `shw_ag_<32 random bytes base64>`

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Prefix for agent tokens.
pub const AGENT_TOKEN_PREFIX: &str = "shw_ag_";

/// Token bytes (32 bytes = 256 bits of entropy).
const TOKEN_BYTES: usize = 32;

/// Generate a new agent token.
pub fn generate_agent_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    format!("{}{}", AGENT_TOKEN_PREFIX, encoded)
}

/// Hash a token for storage using SHA-256.
/// The hash is returned as a hex string.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_prefixed_and_unique() {
        let a = generate_agent_token();
        let b = generate_agent_token();
        assert!(a.starts_with(AGENT_TOKEN_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let h1 = hash_token("shw_ag_example");
        let h2 = hash_token("shw_ag_example");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_tokens_hash_differently() {
        assert_ne!(hash_token("shw_ag_a"), hash_token("shw_ag_b"));
    }
}
