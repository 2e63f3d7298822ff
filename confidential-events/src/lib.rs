//! Emit, decrypt and follow encrypted events of confidential EVM contracts.
//!
//! A contract seals each message with Deoxys-II under a session key agreed with the caller,
//! either a pre-shared key handed over in the (confidential) emitting call or an X25519 key
//! derived from the caller's and the contract's key pairs, and emits it as an `Encrypted` log.
//! The [`session::Session`] controller emits such events and recovers their plaintexts from
//! past transactions or from a live subscription.
pub mod aad;
pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod logger;
pub mod pipeline;
pub mod session;
pub mod transport;
pub mod types;

pub use crate::error::Error;
