//! Public-key authenticated encryption for inbound requests.
//!
//! Every request outside the configured exclusions must carry a `publicKey`
//! (hex) and an `encryptedMessage` (base64 NaCl box). The gate resolves a
//! cached [`Channel`] for the peer, opens the message and hands the plaintext
//! to the route through an [`AuthenticatedRequest`] extension.

pub mod cache;
pub mod channel;
pub mod error;
pub mod keys;
pub mod middleware;

pub use {
    cache::ChannelCache,
    channel::Channel,
    error::AuthFailure,
    keys::{ServerKeys, parse_public_key_hex},
    middleware::{AuthGate, AuthenticatedRequest, ResponseShape, authenticate},
};

pub use crypto_box::{PublicKey, SecretKey};
