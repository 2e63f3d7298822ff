//! Error types.
use crate::types::{H160, H256};

/// Errors raised while agreeing on keys, decoding events and decrypting them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid secret length: expected 32 bytes, got {0}")]
    InvalidSecretLength(usize),

    #[error("invalid hex in {0}")]
    InvalidHex(&'static str),

    #[error("event carries no sender, it was emitted in the legacy format")]
    MissingSender,

    #[error("multiple contracts emitted encrypted events, pick one of: {}", format_addresses(.0))]
    AmbiguousEventMatch(Vec<H160>),

    #[error("no encrypted event found in transaction {0:?}")]
    EventNotFound(H256),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("unable to decrypt message or authenticate additional data")]
    AuthenticationFailed,

    #[error("per-message keys are enabled but the emitter sealed with the session key")]
    ConfigurationMismatch,

    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,

    #[error("transport: {0:#}")]
    Transport(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn format_addresses(addresses: &[H160]) -> String {
    addresses
        .iter()
        .map(|a| format!("{a:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}
