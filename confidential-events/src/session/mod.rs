//! Session controller.
//!
//! A session fixes the key agreement, the associated data mode and optionally the targeted
//! contract, and runs one of the emit, decrypt or listen actions against a transport.
use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    aad::AadBinding,
    codec::{self, EmitCall, EmitKey},
    error::Error,
    keys::{KeyAgreement, KeyMaterial, SessionKeys},
    logger::get_logger,
    pipeline::Decryptor,
    transport::Transport,
    types::{AadMode, EncryptedEvent, KeyAgreementMode, Plaintext, H160, H256},
};

mod listener;

pub use listener::ListenSummary;

/// Session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Resolving,
    Ready,
    Emitting,
    Decrypting,
    Listening,
    Terminated,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "idle",
            State::Resolving => "resolving",
            State::Ready => "ready",
            State::Emitting => "emitting",
            State::Decrypting => "decrypting",
            State::Listening => "listening",
            State::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Session options.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Associated data binding of the emitted events.
    pub aad_mode: AadMode,
    /// Derive per-message keys from the session key.
    pub per_message_keys: bool,
}

/// An event together with its recovered plaintext.
#[derive(Clone, Debug)]
pub struct DecryptedEvent {
    pub event: EncryptedEvent,
    pub plaintext: Plaintext,
}

impl fmt::Display for DecryptedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tx) = &self.event.transaction {
            write!(f, "[{tx:?}] ")?;
        }
        match self.plaintext.as_text() {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "0x{}", hex::encode(self.plaintext.as_bytes())),
        }
    }
}

/// Result of an emit action.
pub struct EmitOutcome {
    /// Hash of the emitting transaction.
    pub transaction: H256,
    keys: Arc<SessionKeys>,
}

impl EmitOutcome {
    /// Key material needed to decrypt the emitted event.
    ///
    /// Contains secrets, for demo output only.
    pub fn key_material(&self) -> KeyMaterial<'_> {
        self.keys.material()
    }
}

struct Resolved {
    contract: H160,
    decryptor: Decryptor,
}

/// Session controller.
pub struct Session<T: Transport + ?Sized> {
    transport: Arc<T>,
    mode: KeyAgreementMode,
    agreement: Option<KeyAgreement>,
    contract: Option<H160>,
    options: Options,
    resolved: Option<Resolved>,
    state: State,
    #[cfg(test)]
    history: Vec<State>,
    logger: slog::Logger,
}

impl<T> Session<T>
where
    T: Transport + ?Sized,
{
    /// Create a new session. Without a contract only the decrypt action is available.
    pub fn new(
        transport: Arc<T>,
        agreement: KeyAgreement,
        contract: Option<H160>,
        options: Options,
    ) -> Self {
        Self {
            transport,
            mode: agreement.mode(),
            agreement: Some(agreement),
            contract,
            options,
            resolved: None,
            state: State::Idle,
            #[cfg(test)]
            history: Vec::new(),
            logger: get_logger("session"),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> KeyAgreementMode {
        self.mode
    }

    fn transition(&mut self, to: State) {
        slog::debug!(self.logger, "session state transition";
            "from" => %self.state,
            "to" => %to,
        );
        self.state = to;
        #[cfg(test)]
        self.history.push(to);
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.state == State::Terminated {
            return Err(Error::InvalidConfig("session terminated".to_string()));
        }
        Ok(())
    }

    fn target(&self) -> Result<H160, Error> {
        self.contract
            .ok_or_else(|| Error::InvalidConfig("a contract address is required".to_string()))
    }

    /// Terminate the session if the result is an error.
    fn settle<R>(&mut self, result: Result<R, Error>, next: State) -> Result<R, Error> {
        match &result {
            Ok(_) => self.transition(next),
            Err(err) => {
                slog::error!(self.logger, "session action failed"; "err" => %err);
                self.transition(State::Terminated);
            }
        }
        result
    }

    /// Resolve key material and associated data binding for the given contract.
    async fn resolve(&mut self, contract: H160) -> Result<Decryptor, Error> {
        if let Some(resolved) = &self.resolved {
            if resolved.contract != contract {
                return Err(Error::InvalidConfig(format!(
                    "session is bound to contract {:?}",
                    resolved.contract
                )));
            }
            return Ok(resolved.decryptor.clone());
        }

        self.transition(State::Resolving);
        let agreement = self
            .agreement
            .take()
            .ok_or_else(|| Error::InvalidConfig("key agreement already consumed".to_string()))?;
        slog::info!(self.logger, "resolving session keys";
            "mode" => %agreement.mode(),
            "supplied" => agreement.is_supplied(),
            "contract" => ?contract,
        );

        let keys = agreement
            .resolve(&*self.transport, contract, self.options.per_message_keys)
            .await?;
        let chain_id = match self.options.aad_mode {
            AadMode::ContextBound => Some(self.transport.chain_id().await?),
            _ => None,
        };
        let binding = AadBinding::new(self.options.aad_mode, chain_id, contract)?;
        if keys.per_message() {
            slog::warn!(self.logger, "per-message keys enabled, the emitter must derive them too");
        }

        let decryptor = Decryptor::new(Arc::new(keys), binding);
        self.resolved = Some(Resolved {
            contract,
            decryptor: decryptor.clone(),
        });
        self.transition(State::Ready);
        Ok(decryptor)
    }

    /// Emit an encrypted event carrying `message`.
    ///
    /// Key material is resolved before the call is made so it can be shown afterwards.
    pub async fn emit(&mut self, message: &[u8]) -> Result<EmitOutcome, Error> {
        self.ensure_usable()?;
        let result = self.do_emit(message).await;
        self.settle(result, State::Idle)
    }

    async fn do_emit(&mut self, message: &[u8]) -> Result<EmitOutcome, Error> {
        let contract = self.target()?;
        let decryptor = self.resolve(contract).await?;
        let keys = decryptor.keys();

        let key = match keys.ecdh() {
            None => EmitKey::PreShared(*keys.session_key().as_bytes()),
            Some(ecdh) => EmitKey::CallerPublic(ecdh.identity.public()),
        };
        let call = EmitCall {
            contract,
            key,
            message: message.to_vec(),
            aad_mode: self.options.aad_mode,
        };

        self.transition(State::Emitting);
        let transaction = self.transport.emit(call).await?;
        slog::info!(self.logger, "emitted encrypted event";
            "tx" => ?transaction,
            "contract" => ?contract,
            "aad_mode" => ?self.options.aad_mode,
        );
        if keys.ecdh().is_some() {
            slog::warn!(self.logger, "ECDH secret material is printed for demo purposes only");
        }

        Ok(EmitOutcome {
            transaction,
            keys: keys.clone(),
        })
    }

    /// Decrypt the encrypted events of a past transaction.
    ///
    /// Fails as a whole if any of the transaction's events fails to decrypt.
    pub async fn decrypt(&mut self, transaction: H256) -> Result<Vec<DecryptedEvent>, Error> {
        self.ensure_usable()?;
        let result = self.do_decrypt(transaction).await;
        self.settle(result, State::Idle)
    }

    async fn do_decrypt(&mut self, transaction: H256) -> Result<Vec<DecryptedEvent>, Error> {
        slog::debug!(self.logger, "fetching receipt"; "tx" => ?transaction);
        let logs = self.transport.receipt_logs(transaction).await?;
        let events = codec::find_events(&logs, self.contract, transaction)?;

        // All events come from the targeted or the single emitting contract.
        let contract = self.contract.unwrap_or(events[0].contract);
        let decryptor = self.resolve(contract).await?;
        self.transition(State::Decrypting);

        events
            .into_iter()
            .map(|event| {
                let plaintext = decryptor.decrypt(&event)?;
                Ok(DecryptedEvent { event, plaintext })
            })
            .collect()
    }

    /// Follow the contract's encrypted events until `cancel` fires.
    ///
    /// Each event is handled in isolation: failures are logged and counted, and never end the
    /// subscription. Only subscription setup failures are returned as errors.
    pub async fn listen<F>(
        &mut self,
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<ListenSummary, Error>
    where
        F: FnMut(&DecryptedEvent),
    {
        self.ensure_usable()?;
        let result = self.do_listen(cancel, on_event).await;
        self.settle(result, State::Terminated)
    }

    async fn do_listen<F>(
        &mut self,
        cancel: CancellationToken,
        on_event: F,
    ) -> Result<ListenSummary, Error>
    where
        F: FnMut(&DecryptedEvent),
    {
        let contract = self.target()?;
        let decryptor = self.resolve(contract).await?;
        let subscription = self.transport.subscribe(contract).await?;

        self.transition(State::Listening);
        slog::info!(self.logger, "listening for encrypted events"; "contract" => ?contract);

        let listener = listener::Listener::new(contract, decryptor, self.logger.clone());
        listener.run(subscription, cancel, on_event).await
    }
}

#[cfg(test)]
mod test;
