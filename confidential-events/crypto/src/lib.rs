//! Cryptography helpers for confidential contract events.
//!
//! The emitting contract seals payloads with Deoxys-II-256-128 under either a pre-shared key or a
//! key derived from an X25519 exchange with the caller. Everything here must reproduce the
//! emitter's conventions byte for byte.

pub mod deoxysii;
pub mod hkdf;
pub mod x25519;
