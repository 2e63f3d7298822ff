//! Types shared between the codec, the decryption pipeline and the session controller.
use std::fmt;

pub use ethabi::ethereum_types::{H160, H256};
pub use oasis_confidential_events_crypto::deoxysii::{EVENT_NONCE_SIZE, NONCE_SIZE, TAG_SIZE};

use crate::error::Error;

/// How the session key is agreed upon with the emitting contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAgreementMode {
    /// A 32-byte key handed to the contract in the emitting call.
    #[serde(alias = "psk")]
    PreSharedKey,
    /// X25519 between the caller and the contract's published public key.
    #[serde(alias = "ecdh")]
    EcdhDerived,
}

impl fmt::Display for KeyAgreementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreSharedKey => f.write_str("pre_shared_key"),
            Self::EcdhDerived => f.write_str("ecdh_derived"),
        }
    }
}

/// What the associated data of each encrypted event is bound to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AadMode {
    /// No associated data.
    #[default]
    None,
    /// The address that invoked the emitting call.
    #[serde(alias = "sender")]
    SenderBound,
    /// Chain identifier followed by the emitting contract address.
    #[serde(alias = "context")]
    ContextBound,
}

impl AadMode {
    /// Encoding of the mode in the emitter's call data.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::SenderBound => 1,
            Self::ContextBound => 2,
        }
    }

    /// Decode the mode from the emitter's call data.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::SenderBound),
            2 => Some(Self::ContextBound),
            _ => None,
        }
    }
}

/// A raw log entry as returned by receipts and subscriptions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawLog {
    /// Address of the contract that emitted the log.
    pub address: H160,
    /// Indexed topics, the first one being the event signature hash.
    pub topics: Vec<H256>,
    /// ABI-encoded non-indexed event fields.
    pub data: Vec<u8>,
    /// Hash of the transaction that emitted the log, when known.
    pub transaction_hash: Option<H256>,
}

/// An encrypted event parsed from a log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedEvent {
    /// Caller of the emitting method. Absent in the legacy event format.
    pub sender: Option<H160>,
    /// Nonce as stored on chain. Only the first [`NONCE_SIZE`] bytes are used.
    pub nonce: [u8; EVENT_NONCE_SIZE],
    /// Ciphertext including the authentication tag.
    pub ciphertext: Vec<u8>,
    /// Contract that emitted the event.
    pub contract: H160,
    /// Transaction that emitted the event.
    pub transaction: Option<H256>,
}

impl EncryptedEvent {
    /// Nonce prefix consumed by the cipher.
    pub fn nonce_prefix(&self) -> [u8; NONCE_SIZE] {
        oasis_confidential_events_crypto::deoxysii::truncate_nonce(&self.nonce)
    }
}

/// A recovered plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct Plaintext(Vec<u8>);

impl Plaintext {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the plaintext as UTF-8 text.
    pub fn as_text(&self) -> Result<&str, Error> {
        std::str::from_utf8(&self.0).map_err(|_| Error::InvalidUtf8)
    }
}

impl fmt::Debug for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Plaintext({} bytes)", self.0.len())
    }
}

/// Decode a hex string with an optional `0x` prefix into a fixed-size array.
///
/// `what` names the parameter in errors. Length mismatches are reported through `on_length`.
pub fn decode_hex_array<const N: usize>(
    value: &str,
    what: &'static str,
    on_length: fn(usize) -> Error,
) -> Result<[u8; N], Error> {
    let value = value.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let raw = hex::decode(value).map_err(|_| Error::InvalidHex(what))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| on_length(raw.len()))
}

/// Parse a hex-encoded 20-byte address.
pub fn parse_address(value: &str) -> Result<H160, Error> {
    let raw: [u8; 20] = decode_hex_array(value, "address", |len| {
        Error::InvalidConfig(format!("address must be 20 bytes, got {len}"))
    })?;
    Ok(H160::from(raw))
}

/// Parse a hex-encoded 32-byte transaction hash.
pub fn parse_tx_hash(value: &str) -> Result<H256, Error> {
    let raw: [u8; 32] = decode_hex_array(value, "transaction hash", |len| {
        Error::InvalidConfig(format!("transaction hash must be 32 bytes, got {len}"))
    })?;
    Ok(H256::from(raw))
}
