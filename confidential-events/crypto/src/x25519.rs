use hmac::{Hmac, Mac as _};
use rand_core::OsRng;
use sha2::Sha512_256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub use crate::deoxysii::KEY_SIZE;

/// Size of X25519 public and private keys.
pub const X25519_KEY_SIZE: usize = 32;

/// Domain separation label used by the emitting runtime when deriving the symmetric key.
pub const KDF_LABEL: &[u8] = b"MRAE_Box_Deoxys-II-256-128";

/// x25519 key derivation errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed private key")]
    MalformedPrivateKey,
    #[error("key derivation function failure")]
    KeyDerivationFunctionFailure,
}

/// An X25519 key pair held by the off-chain party.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a key pair from its secret half.
    pub fn from_secret(secret: &[u8]) -> Result<Self, Error> {
        let secret: [u8; X25519_KEY_SIZE] = secret
            .try_into()
            .map_err(|_| Error::MalformedPrivateKey)?;
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public half of the key pair.
    pub fn public(&self) -> [u8; X25519_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Secret half of the key pair.
    pub fn secret(&self) -> Zeroizing<[u8; X25519_KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Derive the symmetric key shared with the owner of `public_key`.
    pub fn derive_symmetric(&self, public_key: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, Error> {
        derive_symmetric(public_key, self.secret().as_slice())
    }
}

/// Derive a symmetric encryption key from the provided public/private key
/// pair.
///
/// The shared secret is fed through HMAC-SHA512/256 keyed by [`KDF_LABEL`] and truncated to
/// [`KEY_SIZE`] bytes.
pub fn derive_symmetric(
    public_key: &[u8],
    private_key: &[u8],
) -> Result<Zeroizing<[u8; KEY_SIZE]>, Error> {
    let public: [u8; X25519_KEY_SIZE] = public_key
        .try_into()
        .map_err(|_| Error::MalformedPublicKey)?;
    let private: [u8; X25519_KEY_SIZE] = private_key
        .try_into()
        .map_err(|_| Error::MalformedPrivateKey)?;

    let public = PublicKey::from(public);
    let private = StaticSecret::from(private);
    let shared = private.diffie_hellman(&public);

    let mut kdf = Hmac::<Sha512_256>::new_from_slice(KDF_LABEL)
        .map_err(|_| Error::KeyDerivationFunctionFailure)?;
    kdf.update(shared.as_bytes());

    let mut derived_key = Zeroizing::new([0u8; KEY_SIZE]);
    let digest = kdf.finalize();
    derived_key.copy_from_slice(&digest.into_bytes()[..KEY_SIZE]);

    Ok(derived_key)
}
