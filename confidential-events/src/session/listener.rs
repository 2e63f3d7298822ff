//! Subscription loop of a listening session.
use std::panic::{self, AssertUnwindSafe};

use tokio_util::sync::CancellationToken;

use crate::{
    codec,
    error::Error,
    pipeline::Decryptor,
    transport::{Delivery, Subscription},
    types::{H160, H256},
};

use super::DecryptedEvent;

/// Number of consecutive failures of the same kind after which the run is reported once.
const FAILURE_RUN_THRESHOLD: u64 = 3;

/// Counters of a finished listen action.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenSummary {
    /// Encrypted events received from the subscription.
    pub delivered: u64,
    /// Events decrypted and handed to the callback.
    pub decrypted: u64,
    /// Deliveries that failed, including transient delivery errors.
    pub failed: u64,
    /// A run of events only opened with the session key although per-message keys are enabled.
    pub mismatch_reported: bool,
    /// A run of events no configured key and associated data could authenticate.
    pub auth_failures_reported: bool,
}

pub(super) struct Listener {
    contract: H160,
    decryptor: Decryptor,
    summary: ListenSummary,
    consecutive_auth_failures: u64,
    consecutive_mismatches: u64,
    logger: slog::Logger,
}

impl Listener {
    pub(super) fn new(contract: H160, decryptor: Decryptor, logger: slog::Logger) -> Self {
        Self {
            contract,
            decryptor,
            summary: ListenSummary::default(),
            consecutive_auth_failures: 0,
            consecutive_mismatches: 0,
            logger,
        }
    }

    /// Run until cancelled or until the transport closes the subscription.
    pub(super) async fn run<F>(
        mut self,
        mut subscription: Subscription,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<ListenSummary, Error>
    where
        F: FnMut(&DecryptedEvent),
    {
        let result = loop {
            let delivery = tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),
                delivery = subscription.next() => delivery,
            };

            match delivery {
                Some(delivery) => self.handle(delivery, &mut on_event),
                None => {
                    slog::error!(self.logger, "subscription closed by transport");
                    break Err(Error::Transport(anyhow::anyhow!(
                        "subscription closed by transport"
                    )));
                }
            }
        };

        subscription.unsubscribe();
        slog::info!(self.logger, "stopped listening";
            "delivered" => self.summary.delivered,
            "decrypted" => self.summary.decrypted,
            "failed" => self.summary.failed,
        );

        result.map(|_| self.summary)
    }

    fn handle<F>(&mut self, delivery: Delivery, on_event: &mut F)
    where
        F: FnMut(&DecryptedEvent),
    {
        let log = match delivery {
            Ok(log) => log,
            Err(err) => {
                slog::warn!(self.logger, "delivery failed"; "err" => %err);
                self.summary.failed += 1;
                return;
            }
        };
        if log.address != self.contract {
            return;
        }

        let event = match codec::decode_log(&log) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                slog::warn!(self.logger, "skipping malformed event";
                    "tx" => ?log.transaction_hash,
                    "err" => %err,
                );
                self.summary.delivered += 1;
                self.summary.failed += 1;
                return;
            }
        };
        self.summary.delivered += 1;

        let plaintext = match self.decryptor.decrypt(&event) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.record_failure(&event.transaction, &err);
                return;
            }
        };
        self.consecutive_auth_failures = 0;
        self.consecutive_mismatches = 0;

        let decrypted = DecryptedEvent { event, plaintext };
        match panic::catch_unwind(AssertUnwindSafe(|| on_event(&decrypted))) {
            Ok(()) => self.summary.decrypted += 1,
            Err(_) => {
                slog::error!(self.logger, "event handler panicked";
                    "tx" => ?decrypted.event.transaction,
                );
                self.summary.failed += 1;
            }
        }
    }

    fn record_failure(&mut self, transaction: &Option<H256>, err: &Error) {
        slog::warn!(self.logger, "failed to decrypt event";
            "tx" => ?transaction,
            "err" => %err,
        );
        self.summary.failed += 1;

        match err {
            Error::ConfigurationMismatch => {
                self.consecutive_auth_failures = 0;
                self.consecutive_mismatches += 1;
                if self.consecutive_mismatches >= FAILURE_RUN_THRESHOLD
                    && !self.summary.mismatch_reported
                {
                    slog::error!(self.logger, "emitter seals with the session key, disable per-message keys";
                        "events" => self.consecutive_mismatches,
                    );
                    self.summary.mismatch_reported = true;
                }
            }
            Error::AuthenticationFailed => {
                self.consecutive_mismatches = 0;
                self.consecutive_auth_failures += 1;
                if self.consecutive_auth_failures >= FAILURE_RUN_THRESHOLD
                    && !self.summary.auth_failures_reported
                {
                    slog::error!(self.logger, "no event could be authenticated, check the key and the AAD mode";
                        "events" => self.consecutive_auth_failures,
                    );
                    self.summary.auth_failures_reported = true;
                }
            }
            _ => {
                self.consecutive_auth_failures = 0;
                self.consecutive_mismatches = 0;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        aad::AadBinding,
        codec::{EmitCall, EmitKey},
        keys::KeyAgreement,
        logger::get_logger,
        transport::{
            mock::{ContractOptions, MockTransport},
            Transport as _,
        },
        types::{AadMode, RawLog},
    };

    const PLAIN: H160 = H160([0xcc; 20]);
    const DERIVING: H160 = H160([0xdd; 20]);

    fn setup() -> MockTransport {
        let transport = MockTransport::new(1);
        transport.deploy(PLAIN);
        transport.deploy_with(
            DERIVING,
            ContractOptions {
                per_message_keys: true,
                ..Default::default()
            },
        );
        transport
    }

    async fn listener(transport: &MockTransport, contract: H160) -> Listener {
        let keys = KeyAgreement::pre_shared_key(Some(&"00".repeat(32)))
            .unwrap()
            .resolve(transport, contract, true)
            .await
            .unwrap();
        let decryptor = Decryptor::new(Arc::new(keys), AadBinding::None);
        Listener::new(contract, decryptor, get_logger("session/listener"))
    }

    async fn emitted(transport: &MockTransport, contract: H160, key: [u8; 32]) -> RawLog {
        let tx = transport
            .emit(EmitCall {
                contract,
                key: EmitKey::PreShared(key),
                message: b"ping".to_vec(),
                aad_mode: AadMode::None,
            })
            .await
            .unwrap();
        transport.receipt_logs(tx).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_session_key_emitter_reported_as_mismatch() {
        let transport = setup();
        let mut listener = listener(&transport, PLAIN).await;

        for _ in 0..FAILURE_RUN_THRESHOLD {
            let log = emitted(&transport, PLAIN, [0u8; 32]).await;
            listener.handle(Ok(log), &mut |_| {});
        }

        assert_eq!(listener.summary.failed, FAILURE_RUN_THRESHOLD);
        assert!(listener.summary.mismatch_reported);
        assert!(!listener.summary.auth_failures_reported);
    }

    #[tokio::test]
    async fn test_wrong_key_reported_as_auth_failures() {
        let transport = setup();
        let mut listener = listener(&transport, DERIVING).await;

        for _ in 0..FAILURE_RUN_THRESHOLD {
            let log = emitted(&transport, DERIVING, [0x11u8; 32]).await;
            listener.handle(Ok(log), &mut |_| {});
        }

        assert_eq!(listener.summary.failed, FAILURE_RUN_THRESHOLD);
        assert!(listener.summary.auth_failures_reported);
        assert!(!listener.summary.mismatch_reported);
    }

    #[tokio::test]
    async fn test_success_breaks_failure_run() {
        let transport = setup();
        let mut listener = listener(&transport, PLAIN).await;
        let mut decrypted = 0;

        for round in 0..2 * FAILURE_RUN_THRESHOLD {
            // Every other event comes from an emitter that derives per-message keys.
            let log = if round % 2 == 0 {
                emitted(&transport, PLAIN, [0u8; 32]).await
            } else {
                let mut log = emitted(&transport, DERIVING, [0u8; 32]).await;
                log.address = PLAIN;
                log
            };
            listener.handle(Ok(log), &mut |_| decrypted += 1);
        }

        assert_eq!(decrypted, FAILURE_RUN_THRESHOLD);
        assert_eq!(listener.summary.failed, FAILURE_RUN_THRESHOLD);
        assert!(!listener.summary.mismatch_reported);
    }
}
