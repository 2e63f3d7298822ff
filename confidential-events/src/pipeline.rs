//! Decryption pipeline.
use std::sync::Arc;

use oasis_confidential_events_crypto::deoxysii;

use crate::{
    aad::AadBinding,
    error::Error,
    keys::SessionKeys,
    types::{EncryptedEvent, Plaintext},
};

/// Open an encrypted event with the given key and associated data.
///
/// Every authentication failure is the same opaque [`Error::AuthenticationFailed`], whether the
/// key, the associated data or the ciphertext is wrong.
pub fn decrypt(
    event: &EncryptedEvent,
    key: &[u8; deoxysii::KEY_SIZE],
    aad: &[u8],
) -> Result<Plaintext, Error> {
    deoxysii::open(key, &event.nonce_prefix(), &event.ciphertext, aad)
        .map(Plaintext::new)
        .map_err(|_| Error::AuthenticationFailed)
}

/// Decrypts events of a session.
#[derive(Clone)]
pub struct Decryptor {
    keys: Arc<SessionKeys>,
    binding: AadBinding,
}

impl Decryptor {
    pub fn new(keys: Arc<SessionKeys>, binding: AadBinding) -> Self {
        Self { keys, binding }
    }

    pub fn keys(&self) -> &Arc<SessionKeys> {
        &self.keys
    }

    /// Decrypt a single event.
    ///
    /// When per-message keys are enabled and authentication fails, the event is probed once with
    /// the plain session key. If that opens it, the emitter does not derive per-message keys and
    /// [`Error::ConfigurationMismatch`] is returned instead. The probed plaintext is discarded.
    pub fn decrypt(&self, event: &EncryptedEvent) -> Result<Plaintext, Error> {
        let aad = self.binding.for_event(event)?;
        let key = self.keys.message_key(&event.nonce_prefix());

        match decrypt(event, key.as_bytes(), &aad) {
            Err(Error::AuthenticationFailed) if self.keys.per_message() => {
                match decrypt(event, self.keys.session_key().as_bytes(), &aad) {
                    Ok(_) => Err(Error::ConfigurationMismatch),
                    Err(err) => Err(err),
                }
            }
            result => result,
        }
    }
}
