//! Join Tokens
//!
//! A join token is a single-use, time-limited credential minted by the
//! leader. The wire format is base64 of a JSON document so it can be pasted
//! between terminals.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default token lifetime
pub const TOKEN_EXPIRY_MINUTES: i64 = 10;

/// A cluster join token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    /// Reserved name of the joining server
    pub server_name: String,

    /// Fingerprint of the cluster certificate the joiner should trust
    pub fingerprint: String,

    /// Addresses of members that were online when the token was minted
    pub addresses: Vec<String>,

    /// Join secret, matched against the stored token operation
    pub secret: String,

    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
}

impl JoinToken {
    /// Mint a new token for `server_name`.
    pub fn mint(server_name: &str, fingerprint: &str, addresses: Vec<String>) -> Self {
        Self {
            server_name: server_name.to_string(),
            fingerprint: fingerprint.to_string(),
            addresses,
            secret: generate_secret(),
            expires_at: Utc::now() + Duration::minutes(TOKEN_EXPIRY_MINUTES),
        }
    }

    /// Whether the token has passed its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Encode for the wire: base64 of the JSON document.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    /// Decode a wire token.
    pub fn decode(raw: &str) -> Result<Self> {
        let json = BASE64
            .decode(raw.trim())
            .map_err(|_| Error::TokenInvalid)?;
        serde_json::from_slice(&json).map_err(|_| Error::TokenInvalid)
    }
}

/// Generate a 256-bit random join secret, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let token = JoinToken::mint(
            "b",
            "abcd1234",
            vec!["10.0.0.1:8443".into(), "10.0.0.2:8443".into()],
        );
        let encoded = token.encode().unwrap();
        let decoded = JoinToken::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            JoinToken::decode("not a token").unwrap_err(),
            Error::TokenInvalid
        ));
        assert!(matches!(
            JoinToken::decode(&BASE64.encode(b"{}")).unwrap_err(),
            Error::TokenInvalid
        ));
    }

    #[test]
    fn test_secret_entropy() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fresh_token_not_expired() {
        let token = JoinToken::mint("b", "abcd", vec![]);
        assert!(!token.is_expired());
    }
}
