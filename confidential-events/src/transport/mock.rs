//! In-memory emitting contract for tests.
//!
//! Performs the on-chain half of the protocol the way the confidential EVM contract does: a
//! random 32-byte nonce of which the first 15 bytes are used, the session key either taken from
//! the call or derived from the contract's own X25519 secret, associated data according to the
//! requested mode, and an `Encrypted` log delivered to subscribers and stored in a receipt.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use async_trait::async_trait;
use oasis_confidential_events_crypto::{
    deoxysii::{self, KEY_SIZE},
    hkdf::derive_message_key,
    x25519::{derive_symmetric, KeyPair},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use super::{Delivery, Subscription, Transport};
use crate::{
    aad,
    codec::{self, EmitCall, EmitKey},
    error::Error,
    types::{AadMode, RawLog, H160, H256},
};

/// Behaviour of a mock contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContractOptions {
    /// Emit `Encrypted(bytes32,bytes)` without the sender.
    pub legacy_events: bool,
    /// Seal with per-message keys derived from the session key.
    pub per_message_keys: bool,
}

struct Contract {
    keypair: KeyPair,
    options: ContractOptions,
}

struct Subscriber {
    contract: H160,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    contracts: HashMap<H160, Contract>,
    receipts: HashMap<H256, Vec<RawLog>>,
    subscribers: Vec<Subscriber>,
    last_tx: u64,
    offline: bool,
}

impl State {
    fn next_tx(&mut self) -> H256 {
        self.last_tx += 1;
        H256::from_low_u64_be(self.last_tx)
    }

    fn ensure_online(&self) -> Result<(), Error> {
        if self.offline {
            return Err(Error::Transport(anyhow!("connection refused")));
        }
        Ok(())
    }

    fn subscribers_of(&mut self, contract: H160) -> Vec<mpsc::Sender<Delivery>> {
        self.subscribers
            .retain(|sub| !sub.cancel.is_cancelled() && !sub.tx.is_closed());
        self.subscribers
            .iter()
            .filter(|sub| sub.contract == contract)
            .map(|sub| sub.tx.clone())
            .collect()
    }
}

/// In-memory transport emulating a confidential EVM with deployed emitter contracts.
#[derive(Clone)]
pub struct MockTransport {
    chain_id: u64,
    caller: H160,
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    /// Create a new mock network with the given chain identifier.
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            caller: H160::repeat_byte(0x5e),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Address used as the sender of emitting calls.
    pub fn caller(&self) -> H160 {
        self.caller
    }

    /// Deploy an emitter contract at the given address.
    pub fn deploy(&self, contract: H160) {
        self.deploy_with(contract, ContractOptions::default())
    }

    /// Deploy an emitter contract with the given behaviour.
    pub fn deploy_with(&self, contract: H160, options: ContractOptions) {
        self.state.lock().unwrap().contracts.insert(
            contract,
            Contract {
                keypair: KeyPair::generate(),
                options,
            },
        );
    }

    /// Record a transaction with arbitrary logs and return its hash.
    pub fn push_receipt(&self, mut logs: Vec<RawLog>) -> H256 {
        let mut state = self.state.lock().unwrap();
        let tx = state.next_tx();
        for log in &mut logs {
            log.transaction_hash = Some(tx);
        }
        state.receipts.insert(tx, logs);
        tx
    }

    /// Push a raw delivery to all subscribers of the given contract.
    pub async fn deliver(&self, contract: H160, delivery: Delivery) {
        let subscribers = self.state.lock().unwrap().subscribers_of(contract);
        deliver_to(subscribers, || match &delivery {
            Ok(log) => Ok(log.clone()),
            Err(err) => Err(Error::Transport(anyhow!("{err}"))),
        })
        .await;
    }

    /// Close all subscriptions from the transport side.
    pub fn close_subscriptions(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    /// Make every subsequent request fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|sub| !sub.cancel.is_cancelled() && !sub.tx.is_closed());
        state.subscribers.len()
    }

    fn seal(&self, call: &EmitCall) -> Result<RawLog, Error> {
        let state = self.state.lock().unwrap();
        state.ensure_online()?;
        let contract = state
            .contracts
            .get(&call.contract)
            .ok_or_else(|| Error::Transport(anyhow!("execution reverted: no contract")))?;

        let key: Zeroizing<[u8; KEY_SIZE]> = match &call.key {
            EmitKey::PreShared(key) => Zeroizing::new(*key),
            EmitKey::CallerPublic(pk) => derive_symmetric(pk, contract.keypair.secret().as_slice())
                .map_err(|err| Error::Transport(anyhow!("execution reverted: {err}")))?,
        };

        let nonce: [u8; 32] = rand::random();
        let prefix = deoxysii::truncate_nonce(&nonce);
        let key = if contract.options.per_message_keys {
            derive_message_key(&key, &prefix)
        } else {
            key
        };

        let aad = match call.aad_mode {
            AadMode::None => Vec::new(),
            AadMode::SenderBound => aad::sender_bound(&self.caller),
            AadMode::ContextBound => aad::context_bound(self.chain_id, &call.contract),
        };
        let ciphertext = deoxysii::seal(key.as_slice(), &prefix, &call.message, &aad)
            .map_err(|err| Error::Transport(anyhow!("execution reverted: {err}")))?;

        let sender = (!contract.options.legacy_events).then_some(self.caller);
        Ok(codec::encode_log(call.contract, sender, &nonce, &ciphertext))
    }
}

async fn deliver_to<F>(subscribers: Vec<mpsc::Sender<Delivery>>, delivery: F)
where
    F: Fn() -> Delivery,
{
    for tx in subscribers {
        let _ = tx.send(delivery()).await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn chain_id(&self) -> Result<u64, Error> {
        self.state.lock().unwrap().ensure_online()?;
        Ok(self.chain_id)
    }

    async fn public_key(&self, contract: H160) -> Result<[u8; 32], Error> {
        let state = self.state.lock().unwrap();
        state.ensure_online()?;
        state
            .contracts
            .get(&contract)
            .map(|contract| contract.keypair.public())
            .ok_or_else(|| Error::Transport(anyhow!("execution reverted: no contract")))
    }

    async fn receipt_logs(&self, transaction: H256) -> Result<Vec<RawLog>, Error> {
        let state = self.state.lock().unwrap();
        state.ensure_online()?;
        state
            .receipts
            .get(&transaction)
            .cloned()
            .ok_or_else(|| Error::Transport(anyhow!("receipt not found")))
    }

    async fn subscribe(&self, contract: H160) -> Result<Subscription, Error> {
        let mut state = self.state.lock().unwrap();
        state.ensure_online()?;
        let (subscription, tx, cancel) = Subscription::channel();
        state.subscribers.push(Subscriber {
            contract,
            tx,
            cancel,
        });
        Ok(subscription)
    }

    async fn emit(&self, call: EmitCall) -> Result<H256, Error> {
        // Go through the ABI like a real call would.
        let call = codec::decode_emit_call(call.contract, &codec::encode_emit_call(&call))?;

        let mut log = self.seal(&call)?;
        let (tx, subscribers) = {
            let mut state = self.state.lock().unwrap();
            let tx = state.next_tx();
            log.transaction_hash = Some(tx);
            state.receipts.insert(tx, vec![log.clone()]);
            (tx, state.subscribers_of(call.contract))
        };
        deliver_to(subscribers, || Ok(log.clone())).await;

        Ok(tx)
    }
}
