use std::fmt;

use crypto_box::{PublicKey, SecretKey, aead::OsRng};

use crate::error::AuthFailure;

pub const KEY_LEN: usize = 32;

/// The process-wide static key pair. Immutable for the life of the server.
#[derive(Clone)]
pub struct ServerKeys {
    secret: SecretKey,
}

impl ServerKeys {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            secret: SecretKey::from(bytes),
        }
    }

    pub fn from_hex(raw: &str) -> Result<Self, AuthFailure> {
        Ok(Self::from_bytes(decode_key_hex(raw)?))
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    /// Hex form served by `/getpublickey` (64 characters).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().as_bytes())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }
}

impl fmt::Debug for ServerKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a peer's hex-encoded public key.
pub fn parse_public_key_hex(raw: &str) -> Result<PublicKey, AuthFailure> {
    decode_key_hex(raw).map(PublicKey::from)
}

fn decode_key_hex(raw: &str) -> Result<[u8; KEY_LEN], AuthFailure> {
    let bytes = hex::decode(raw.trim()).map_err(|e| AuthFailure::MalformedKey(e.to_string()))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        AuthFailure::MalformedKey(format!("expected {KEY_LEN} bytes, got {}", b.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_hex_is_64_chars() {
        let keys = ServerKeys::generate();
        let hex = keys.public_key_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn secret_round_trips_through_hex() {
        let keys = ServerKeys::generate();
        let restored = ServerKeys::from_hex(&keys.secret_key_hex()).unwrap();
        assert_eq!(restored.public_key_hex(), keys.public_key_hex());
    }

    #[test]
    fn rejects_short_and_non_hex_keys() {
        assert!(matches!(
            parse_public_key_hex("abcd"),
            Err(AuthFailure::MalformedKey(_))
        ));
        assert!(matches!(
            parse_public_key_hex(&"g".repeat(64)),
            Err(AuthFailure::MalformedKey(_))
        ));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let keys = ServerKeys::from_bytes([7; KEY_LEN]);
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains(&keys.secret_key_hex()));
    }
}
