//! Session key agreement.
use std::fmt;

use oasis_confidential_events_crypto::{
    deoxysii::{KEY_SIZE, NONCE_SIZE},
    hkdf,
    x25519::{self, KeyPair, X25519_KEY_SIZE},
};
use rand::RngCore as _;
use zeroize::Zeroizing;

use crate::{
    error::Error,
    transport::Transport,
    types::{decode_hex_array, KeyAgreementMode, H160},
};

/// A 256-bit symmetric key.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; KEY_SIZE]>);

impl SymmetricKey {
    /// Wrap raw key bytes, rejecting anything that is not exactly 32 bytes long.
    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        let raw: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| Error::InvalidKeyLength(raw.len()))?;
        Ok(Self(Zeroizing::new(raw)))
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(value: &str) -> Result<Self, Error> {
        let raw: [u8; KEY_SIZE] = decode_hex_array(value, "key", Error::InvalidKeyLength)?;
        Ok(Self(Zeroizing::new(raw)))
    }

    /// Generate a random key.
    pub fn random() -> Self {
        let mut raw = Zeroizing::new([0u8; KEY_SIZE]);
        rand::rngs::OsRng.fill_bytes(raw.as_mut_slice());
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<Zeroizing<[u8; KEY_SIZE]>> for SymmetricKey {
    fn from(raw: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Key agreement inputs, fixed for the lifetime of a session.
pub enum KeyAgreement {
    /// Use the given key, or a fresh random one that must reach the emitter through the
    /// (confidential) emitting call.
    PreSharedKey(Option<SymmetricKey>),
    /// Derive the key via X25519 with the contract, using the given identity or a fresh one.
    EcdhDerived(Option<KeyPair>),
}

impl KeyAgreement {
    /// Pre-shared key agreement from an optional hex-encoded key.
    pub fn pre_shared_key(key: Option<&str>) -> Result<Self, Error> {
        Ok(Self::PreSharedKey(key.map(SymmetricKey::from_hex).transpose()?))
    }

    /// ECDH key agreement from an optional hex-encoded X25519 secret.
    pub fn ecdh(secret: Option<&str>) -> Result<Self, Error> {
        let identity = secret
            .map(|secret| -> Result<KeyPair, Error> {
                let raw: Zeroizing<[u8; X25519_KEY_SIZE]> = Zeroizing::new(decode_hex_array(
                    secret,
                    "secret",
                    Error::InvalidSecretLength,
                )?);
                KeyPair::from_secret(raw.as_slice())
                    .map_err(|_| Error::InvalidSecretLength(raw.len()))
            })
            .transpose()?;
        Ok(Self::EcdhDerived(identity))
    }

    pub fn mode(&self) -> KeyAgreementMode {
        match self {
            Self::PreSharedKey(_) => KeyAgreementMode::PreSharedKey,
            Self::EcdhDerived(_) => KeyAgreementMode::EcdhDerived,
        }
    }

    /// Whether the caller supplied the key material, as opposed to having it generated.
    pub fn is_supplied(&self) -> bool {
        match self {
            Self::PreSharedKey(key) => key.is_some(),
            Self::EcdhDerived(identity) => identity.is_some(),
        }
    }

    /// Resolve the session key, fetching the contract's public key when needed.
    pub async fn resolve<T>(
        self,
        transport: &T,
        contract: H160,
        per_message: bool,
    ) -> Result<SessionKeys, Error>
    where
        T: Transport + ?Sized,
    {
        match self {
            Self::PreSharedKey(key) => Ok(SessionKeys {
                key: key.unwrap_or_else(SymmetricKey::random),
                ecdh: None,
                per_message,
            }),
            Self::EcdhDerived(identity) => {
                let identity = identity.unwrap_or_else(KeyPair::generate);
                let remote_public = transport.public_key(contract).await?;
                let key = derive_session_key(&identity, &remote_public)?;
                Ok(SessionKeys {
                    key,
                    ecdh: Some(EcdhKeys {
                        identity,
                        remote_public,
                    }),
                    per_message,
                })
            }
        }
    }
}

/// Derive the session key the emitting contract derives for the caller's public key.
pub fn derive_session_key(
    identity: &KeyPair,
    remote_public: &[u8; X25519_KEY_SIZE],
) -> Result<SymmetricKey, Error> {
    identity
        .derive_symmetric(remote_public)
        .map(SymmetricKey::from)
        .map_err(|err| match err {
            x25519::Error::MalformedPublicKey => Error::Transport(anyhow::anyhow!(
                "contract returned a malformed public key"
            )),
            x25519::Error::MalformedPrivateKey => Error::InvalidSecretLength(0),
            x25519::Error::KeyDerivationFunctionFailure => {
                Error::Transport(anyhow::anyhow!("key derivation failed"))
            }
        })
}

/// X25519 material of an ECDH session.
pub struct EcdhKeys {
    /// Caller's identity.
    pub identity: KeyPair,
    /// Contract's public key, as fetched when the session was resolved.
    pub remote_public: [u8; X25519_KEY_SIZE],
}

/// Resolved key material of a session.
pub struct SessionKeys {
    key: SymmetricKey,
    ecdh: Option<EcdhKeys>,
    per_message: bool,
}

impl SessionKeys {
    /// The session key.
    pub fn session_key(&self) -> &SymmetricKey {
        &self.key
    }

    /// X25519 material when the session key was derived via ECDH.
    pub fn ecdh(&self) -> Option<&EcdhKeys> {
        self.ecdh.as_ref()
    }

    /// Whether per-message keys are derived from the session key.
    pub fn per_message(&self) -> bool {
        self.per_message
    }

    /// Key used to open a message sealed under the given nonce prefix.
    pub fn message_key(&self, nonce: &[u8; NONCE_SIZE]) -> SymmetricKey {
        if self.per_message {
            hkdf::derive_message_key(self.key.as_bytes(), nonce).into()
        } else {
            self.key.clone()
        }
    }

    /// Key material for display after an emit.
    pub fn material(&self) -> KeyMaterial<'_> {
        KeyMaterial(self)
    }
}

/// Printable key material of a session.
///
/// Contains secrets. Only meant for demo output, never for production logs.
pub struct KeyMaterial<'a>(&'a SessionKeys);

impl fmt::Display for KeyMaterial<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.0;
        match keys.ecdh() {
            None => {
                writeln!(f, "mode: {}", KeyAgreementMode::PreSharedKey)?;
                writeln!(
                    f,
                    "key: 0x{} (demo only, never log in production)",
                    hex::encode(keys.session_key().as_bytes())
                )?;
            }
            Some(ecdh) => {
                writeln!(f, "mode: {}", KeyAgreementMode::EcdhDerived)?;
                writeln!(f, "caller public key: 0x{}", hex::encode(ecdh.identity.public()))?;
                writeln!(
                    f,
                    "contract public key: 0x{}",
                    hex::encode(ecdh.remote_public)
                )?;
                writeln!(
                    f,
                    "caller secret: 0x{} (demo only, never log in production)",
                    hex::encode(ecdh.identity.secret().as_slice())
                )?;
                writeln!(
                    f,
                    "derived key: 0x{} (demo only, never log in production)",
                    hex::encode(keys.session_key().as_bytes())
                )?;
            }
        }
        write!(f, "per-message keys: {}", keys.per_message())
    }
}
