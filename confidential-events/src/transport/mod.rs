//! Access to the confidential execution environment hosting the emitting contract.
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::EmitCall,
    error::Error,
    types::{RawLog, H160, H256},
};

pub mod jsonrpc;
#[cfg(any(test, feature = "test"))]
pub mod mock;

/// Size of the per-subscription delivery queue.
pub const SUBSCRIPTION_BACKLOG: usize = 64;

/// A single delivery of a subscription. Transient delivery failures are reported in-band.
pub type Delivery = Result<RawLog, Error>;

/// The external collaborator that runs the emitting contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Chain identifier of the network.
    async fn chain_id(&self) -> Result<u64, Error>;

    /// X25519 public key of the given contract.
    async fn public_key(&self, contract: H160) -> Result<[u8; 32], Error>;

    /// Logs emitted by the given transaction.
    async fn receipt_logs(&self, transaction: H256) -> Result<Vec<RawLog>, Error>;

    /// Subscribe to logs emitted by the given contract.
    async fn subscribe(&self, contract: H160) -> Result<Subscription, Error>;

    /// Submit an emitting call and return the transaction hash.
    async fn emit(&self, call: EmitCall) -> Result<H256, Error>;
}

/// A live log subscription.
///
/// Deliveries arrive in order. Dropping the subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Create a subscription together with the sending half used by the transport.
    ///
    /// The transport should stop producing once the returned token is cancelled.
    pub fn channel() -> (Self, mpsc::Sender<Delivery>, CancellationToken) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BACKLOG);
        let cancel = CancellationToken::new();
        (
            Self {
                rx,
                cancel: cancel.clone(),
            },
            tx,
            cancel,
        )
    }

    /// Receive the next delivery. Returns `None` once the transport closed the subscription.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Stop the subscription and discard anything still queued.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
