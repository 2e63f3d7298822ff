//! Associated data builder.
//!
//! The output must match what the emitting contract passes to its seal call byte for byte,
//! otherwise authentication fails exactly as if the key were wrong.
use crate::{
    error::Error,
    types::{AadMode, EncryptedEvent, H160},
};

/// Width of the big-endian chain identifier in context-bound associated data.
pub const CHAIN_ID_SIZE: usize = 32;

/// Associated data for sender-bound events.
pub fn sender_bound(sender: &H160) -> Vec<u8> {
    sender.as_bytes().to_vec()
}

/// Associated data for context-bound events: `uint256(chain_id) || contract`.
pub fn context_bound(chain_id: u64, contract: &H160) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CHAIN_ID_SIZE + H160::len_bytes());
    aad.extend_from_slice(&[0u8; CHAIN_ID_SIZE - 8]);
    aad.extend_from_slice(&chain_id.to_be_bytes());
    aad.extend_from_slice(contract.as_bytes());
    aad
}

/// Associated data binding resolved for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AadBinding {
    None,
    Sender,
    Context { chain_id: u64, contract: H160 },
}

impl AadBinding {
    /// Binding for the given mode. Context binding requires the chain identifier and the
    /// targeted contract.
    pub fn new(mode: AadMode, chain_id: Option<u64>, contract: H160) -> Result<Self, Error> {
        match mode {
            AadMode::None => Ok(Self::None),
            AadMode::SenderBound => Ok(Self::Sender),
            AadMode::ContextBound => {
                let chain_id = chain_id.ok_or_else(|| {
                    Error::InvalidConfig("context-bound AAD requires a chain id".to_string())
                })?;
                Ok(Self::Context { chain_id, contract })
            }
        }
    }

    /// Associated data for the given event.
    pub fn for_event(&self, event: &EncryptedEvent) -> Result<Vec<u8>, Error> {
        match self {
            Self::None => Ok(Vec::new()),
            Self::Sender => event
                .sender
                .as_ref()
                .map(sender_bound)
                .ok_or(Error::MissingSender),
            Self::Context { chain_id, contract } => Ok(context_bound(*chain_id, contract)),
        }
    }
}
