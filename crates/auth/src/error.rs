/// Why a request could not be authenticated.
///
/// All variants collapse to the same unauthorized outcome on the wire; the
/// variant and detail only differ in logs and in the diagnostic body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("missing query parameter `{0}`")]
    MissingField(&'static str),

    #[error("malformed public key: {0}")]
    MalformedKey(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

impl AuthFailure {
    /// Short reason used as the status text and websocket close prefix.
    pub const REASON: &'static str = "Failed to retrieve a valid message!";

    /// Human diagnostic rendered into the rejection body.
    pub fn diagnostic(&self) -> String {
        format!("{}\n{self}", Self::REASON)
    }
}
