//! Optional per-message key derivation.
//!
//! Only usable when the emitter applies the identical derivation before sealing. No emitter in
//! the confidential EVM does this out of the box, so enabling it against a stock contract makes
//! every message fail authentication.
use ::hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::deoxysii::{KEY_SIZE, NONCE_SIZE};

/// Application context mixed into every per-message key.
pub const MESSAGE_KEY_INFO: &[u8] = b"oasis-confidential-events/message-key";

/// Largest output HKDF-SHA256 can expand to.
const MAX_OUTPUT_SIZE: usize = 255 * 32;

const _: () = assert!(KEY_SIZE <= MAX_OUTPUT_SIZE);

/// Derive a one-time message key from the session key and the message nonce prefix.
pub fn derive_message_key(
    session_key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
) -> Zeroizing<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(nonce), session_key);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hk.expand(MESSAGE_KEY_INFO, okm.as_mut_slice())
        .expect("key size is below the HKDF-SHA256 output limit");
    okm
}
