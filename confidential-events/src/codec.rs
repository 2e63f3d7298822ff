//! Encoding and decoding of the emitting contract's events and calls.
//!
//! The emitting contract exposes:
//!
//! ```solidity
//! event Encrypted(address indexed sender, bytes32 nonce, bytes ciphertext);
//!
//! function publicKey() external view returns (bytes32);
//! function emitEncrypted(bytes32 key, bytes calldata message, uint8 aadMode) external;
//! function emitEncryptedEcdh(bytes32 callerPublicKey, bytes calldata message, uint8 aadMode) external;
//! ```
//!
//! Earlier deployments emitted `Encrypted(bytes32 nonce, bytes ciphertext)` without the sender,
//! which is still accepted.
use std::collections::BTreeSet;

use ethabi::{ParamType, Token};
use once_cell::sync::Lazy;

use crate::{
    error::Error,
    types::{AadMode, EncryptedEvent, RawLog, EVENT_NONCE_SIZE, H160, H256, TAG_SIZE},
};

/// Name of the encrypted event.
pub const EVENT_NAME: &str = "Encrypted";

/// Topic of the current event shape, `Encrypted(address,bytes32,bytes)`.
pub static EVENT_TOPIC: Lazy<H256> = Lazy::new(|| {
    ethabi::long_signature(
        EVENT_NAME,
        &[
            ParamType::Address,
            ParamType::FixedBytes(EVENT_NONCE_SIZE),
            ParamType::Bytes,
        ],
    )
});

/// Topic of the legacy event shape, `Encrypted(bytes32,bytes)`.
pub static LEGACY_EVENT_TOPIC: Lazy<H256> = Lazy::new(|| {
    ethabi::long_signature(
        EVENT_NAME,
        &[ParamType::FixedBytes(EVENT_NONCE_SIZE), ParamType::Bytes],
    )
});

/// Non-indexed fields shared by both event shapes.
fn event_data_params() -> [ParamType; 2] {
    [ParamType::FixedBytes(EVENT_NONCE_SIZE), ParamType::Bytes]
}

/// Shape of an encrypted event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventShape {
    /// Carries the sender as the first indexed topic.
    Current,
    /// Carries no sender.
    Legacy,
}

/// Classify a log by its signature topic. Returns `None` for unrelated logs.
pub fn event_shape(log: &RawLog) -> Option<EventShape> {
    let topic = log.topics.first()?;
    if *topic == *EVENT_TOPIC {
        Some(EventShape::Current)
    } else if *topic == *LEGACY_EVENT_TOPIC {
        Some(EventShape::Legacy)
    } else {
        None
    }
}

/// Decode an encrypted event log.
///
/// Returns `Ok(None)` when the log is not an encrypted event at all.
pub fn decode_log(log: &RawLog) -> Result<Option<EncryptedEvent>, Error> {
    let shape = match event_shape(log) {
        Some(shape) => shape,
        None => return Ok(None),
    };

    let sender = match shape {
        EventShape::Current => {
            let topic = log
                .topics
                .get(1)
                .ok_or_else(|| Error::MalformedEvent("missing sender topic".to_string()))?;
            Some(H160::from_slice(&topic.as_bytes()[12..]))
        }
        EventShape::Legacy => None,
    };

    let mut tokens = ethabi::decode(&event_data_params(), &log.data)
        .map_err(|err| Error::MalformedEvent(err.to_string()))?
        .into_iter();
    let nonce = tokens
        .next()
        .and_then(Token::into_fixed_bytes)
        .ok_or_else(|| Error::MalformedEvent("bad nonce".to_string()))?;
    let ciphertext = tokens
        .next()
        .and_then(Token::into_bytes)
        .ok_or_else(|| Error::MalformedEvent("bad ciphertext".to_string()))?;

    let nonce: [u8; EVENT_NONCE_SIZE] = nonce
        .as_slice()
        .try_into()
        .map_err(|_| Error::MalformedEvent("bad nonce".to_string()))?;
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::MalformedEvent(
            "ciphertext shorter than authentication tag".to_string(),
        ));
    }

    Ok(Some(EncryptedEvent {
        sender,
        nonce,
        ciphertext,
        contract: log.address,
        transaction: log.transaction_hash,
    }))
}

/// Find the encrypted events of a transaction.
///
/// With a target, logs of other contracts are dropped before decoding. Without one, all matching
/// logs must come from a single contract.
pub fn find_events(
    logs: &[RawLog],
    target: Option<H160>,
    transaction: H256,
) -> Result<Vec<EncryptedEvent>, Error> {
    let candidates: Vec<&RawLog> = logs
        .iter()
        .filter(|log| target.map_or(true, |target| log.address == target))
        .filter(|log| event_shape(log).is_some())
        .collect();

    if target.is_none() {
        let emitters: BTreeSet<H160> = candidates.iter().map(|log| log.address).collect();
        if emitters.len() > 1 {
            return Err(Error::AmbiguousEventMatch(emitters.into_iter().collect()));
        }
    }

    let events = candidates
        .into_iter()
        .filter_map(|log| decode_log(log).transpose())
        .map(|event| {
            event.map(|mut event| {
                event.transaction.get_or_insert(transaction);
                event
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if events.is_empty() {
        return Err(Error::EventNotFound(transaction));
    }
    Ok(events)
}

/// Encode an encrypted event log as the emitting contract would.
pub fn encode_log(
    contract: H160,
    sender: Option<H160>,
    nonce: &[u8; EVENT_NONCE_SIZE],
    ciphertext: &[u8],
) -> RawLog {
    let topics = match sender {
        Some(sender) => vec![*EVENT_TOPIC, H256::from(sender)],
        None => vec![*LEGACY_EVENT_TOPIC],
    };
    RawLog {
        address: contract,
        topics,
        data: ethabi::encode(&[
            Token::FixedBytes(nonce.to_vec()),
            Token::Bytes(ciphertext.to_vec()),
        ]),
        transaction_hash: None,
    }
}

/// Key argument of an emitting call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmitKey {
    /// Pre-shared symmetric key.
    PreShared([u8; 32]),
    /// Caller's X25519 public key.
    CallerPublic([u8; 32]),
}

/// An emitting call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmitCall {
    pub contract: H160,
    pub key: EmitKey,
    pub message: Vec<u8>,
    pub aad_mode: AadMode,
}

fn emit_params() -> [ParamType; 3] {
    [ParamType::FixedBytes(32), ParamType::Bytes, ParamType::Uint(8)]
}

/// Encode the call data of an emitting call.
pub fn encode_emit_call(call: &EmitCall) -> Vec<u8> {
    let (method, key) = match &call.key {
        EmitKey::PreShared(key) => ("emitEncrypted", key),
        EmitKey::CallerPublic(pk) => ("emitEncryptedEcdh", pk),
    };
    let mut data = ethabi::short_signature(method, &emit_params()).to_vec();
    data.extend(ethabi::encode(&[
        Token::FixedBytes(key.to_vec()),
        Token::Bytes(call.message.clone()),
        Token::Uint(call.aad_mode.as_u8().into()),
    ]));
    data
}

/// Decode the call data of an emitting call sent to `contract`.
pub fn decode_emit_call(contract: H160, data: &[u8]) -> Result<EmitCall, Error> {
    if data.len() < 4 {
        return Err(Error::MalformedEvent("call data too short".to_string()));
    }
    let (selector, args) = data.split_at(4);
    let ecdh = if selector == ethabi::short_signature("emitEncrypted", &emit_params()) {
        false
    } else if selector == ethabi::short_signature("emitEncryptedEcdh", &emit_params()) {
        true
    } else {
        return Err(Error::MalformedEvent("unknown method".to_string()));
    };

    let mut tokens = ethabi::decode(&emit_params(), args)
        .map_err(|err| Error::MalformedEvent(err.to_string()))?
        .into_iter();
    let key: [u8; 32] = tokens
        .next()
        .and_then(Token::into_fixed_bytes)
        .and_then(|key| key.try_into().ok())
        .ok_or_else(|| Error::MalformedEvent("bad key".to_string()))?;
    let message = tokens
        .next()
        .and_then(Token::into_bytes)
        .ok_or_else(|| Error::MalformedEvent("bad message".to_string()))?;
    let aad_mode = tokens
        .next()
        .and_then(Token::into_uint)
        .filter(|mode| mode.bits() <= 8)
        .and_then(|mode| AadMode::from_u8(mode.low_u32() as u8))
        .ok_or_else(|| Error::MalformedEvent("bad AAD mode".to_string()))?;

    Ok(EmitCall {
        contract,
        key: if ecdh {
            EmitKey::CallerPublic(key)
        } else {
            EmitKey::PreShared(key)
        },
        message,
        aad_mode,
    })
}

/// Call data of `publicKey()`.
pub fn encode_public_key_call() -> Vec<u8> {
    ethabi::short_signature("publicKey", &[]).to_vec()
}

/// Decode the result of `publicKey()`.
pub fn decode_public_key_result(data: &[u8]) -> Result<[u8; 32], Error> {
    ethabi::decode(&[ParamType::FixedBytes(32)], data)
        .ok()
        .and_then(|tokens| tokens.into_iter().next())
        .and_then(Token::into_fixed_bytes)
        .and_then(|pk| pk.try_into().ok())
        .ok_or_else(|| Error::Transport(anyhow::anyhow!("malformed public key result")))
}
