pub use ::deoxysii::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use ::deoxysii::DeoxysII;

/// Size of the nonce as stored in contract events.
///
/// Only the first [`NONCE_SIZE`] bytes are used by the cipher, the rest is ignored.
pub const EVENT_NONCE_SIZE: usize = 32;

/// DeoxysII encryption and decryption errors.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("malformed encryption key")]
    MalformedKey,
    #[error("malformed nonce")]
    MalformedNonce,
    #[error("unable to decrypt message or authenticate additional data")]
    DecryptionFailed,
}

/// Truncate an event nonce to the prefix consumed by the cipher.
pub fn truncate_nonce(nonce: &[u8; EVENT_NONCE_SIZE]) -> [u8; NONCE_SIZE] {
    let mut prefix = [0u8; NONCE_SIZE];
    prefix.copy_from_slice(&nonce[..NONCE_SIZE]);
    prefix
}

/// Encrypt and authenticate a message and authenticate additional data using
/// DeoxysII.
pub fn seal(
    key: &[u8],
    nonce: &[u8],
    message: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>, Error> {
    let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| Error::MalformedKey)?;
    let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| Error::MalformedNonce)?;
    let deoxysii = DeoxysII::new(&key);
    Ok(deoxysii.seal(&nonce, message, additional_data))
}

/// Decrypt and authenticate a message and authenticate additional data using
/// DeoxysII.
///
/// Any authentication failure (wrong key, wrong additional data or a corrupted ciphertext) is
/// reported as the same [`Error::DecryptionFailed`].
pub fn open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    additional_data: &[u8],
) -> Result<Vec<u8>, Error> {
    let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| Error::MalformedKey)?;
    let nonce: [u8; NONCE_SIZE] = nonce.try_into().map_err(|_| Error::MalformedNonce)?;
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::DecryptionFailed);
    }
    let mut ciphertext = ciphertext.to_vec();
    let deoxysii = DeoxysII::new(&key);
    deoxysii
        .open(&nonce, &mut ciphertext, additional_data)
        .map_err(|_| Error::DecryptionFailed)
}
