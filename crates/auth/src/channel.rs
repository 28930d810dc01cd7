use std::fmt;

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    crypto_box::{
        PublicKey, SalsaBox, SecretKey,
        aead::{Aead, AeadCore, OsRng, generic_array::GenericArray},
    },
    serde::{Serialize, de::DeserializeOwned},
};

use crate::error::AuthFailure;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to encrypt payload")]
    Encrypt,
}

/// A negotiated box between our static secret key and one peer public key.
///
/// The shared secret is derived once in [`Channel::new`]. Wire form of a
/// sealed message is `base64(nonce || ciphertext)`, the layout produced by a
/// NaCl box with a base64 encoder. The same type works from the client side
/// (client secret + server public key).
pub struct Channel {
    peer: PublicKey,
    cipher: SalsaBox,
}

impl Channel {
    pub fn new(secret: &SecretKey, peer: PublicKey) -> Self {
        let cipher = SalsaBox::new(&peer, secret);
        Self { peer, cipher }
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    pub fn peer_hex(&self) -> String {
        hex::encode(self.peer.as_bytes())
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, SealError> {
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SealError::Encrypt)?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(wire))
    }

    /// Serialize `value` as JSON, then seal it.
    pub fn seal_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, SealError> {
        self.seal(&serde_json::to_vec(value)?)
    }

    /// Decode and authenticate a sealed message.
    pub fn open(&self, encoded: &str) -> Result<Vec<u8>, AuthFailure> {
        let wire = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthFailure::DecryptionFailed(format!("invalid base64: {e}")))?;
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(AuthFailure::DecryptionFailed(format!(
                "message of {} bytes is shorter than nonce and tag",
                wire.len()
            )));
        }

        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| {
                AuthFailure::DecryptionFailed("message forged or sealed for another key".into())
            })
    }

    /// Open a sealed message and parse the plaintext as JSON.
    pub fn open_json<T: DeserializeOwned>(&self, encoded: &str) -> Result<T, AuthFailure> {
        let plaintext = self.open(encoded)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| AuthFailure::DecryptionFailed(format!("plaintext is not JSON: {e}")))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer_hex())
            .finish_non_exhaustive()
    }
}
