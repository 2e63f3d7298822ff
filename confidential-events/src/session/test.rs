use std::{cell::RefCell, sync::Arc};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::{
    codec::EVENT_TOPIC,
    transport::mock::{ContractOptions, MockTransport},
    types::RawLog,
};

const CHAIN_ID: u64 = 0x5aff;
const ZERO_KEY: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const CALLER_SECRET: &str = "c07b151fbc1e7a11dff926111188f8d872f62eba0396da97c0a24adb75161750";

fn setup() -> (Arc<MockTransport>, H160) {
    let transport = Arc::new(MockTransport::new(CHAIN_ID));
    let contract = H160::repeat_byte(0xcc);
    transport.deploy(contract);
    (transport, contract)
}

fn psk_session(
    transport: &Arc<MockTransport>,
    key: &str,
    contract: Option<H160>,
    options: Options,
) -> Session<MockTransport> {
    Session::new(
        transport.clone(),
        KeyAgreement::pre_shared_key(Some(key)).unwrap(),
        contract,
        options,
    )
}

fn sender_bound() -> Options {
    Options {
        aad_mode: AadMode::SenderBound,
        ..Default::default()
    }
}

async fn wait_for_subscriber(transport: &MockTransport) {
    while transport.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_psk_ping() {
    let (transport, contract) = setup();

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let outcome = emitter.emit(b"ping").await.unwrap();
    assert_eq!(emitter.state(), State::Idle);
    assert!(outcome
        .key_material()
        .to_string()
        .contains(&format!("key: 0x{ZERO_KEY}")));

    let mut decrypter = psk_session(&transport, ZERO_KEY, None, Options::default());
    let events = decrypter.decrypt(outcome.transaction).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].plaintext.as_text().unwrap(), "ping");
    assert_eq!(events[0].event.sender, Some(transport.caller()));
    assert_eq!(events[0].event.contract, contract);
    assert_eq!(events[0].event.transaction, Some(outcome.transaction));
    assert_eq!(decrypter.state(), State::Idle);
}

#[tokio::test]
async fn test_state_transitions() {
    let (transport, contract) = setup();

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let tx = emitter.emit(b"ping").await.unwrap().transaction;
    assert_eq!(
        emitter.history,
        vec![State::Resolving, State::Ready, State::Emitting, State::Idle]
    );

    // Keys are ready before decryption starts, even though the receipt is fetched first.
    let mut decrypter = psk_session(&transport, ZERO_KEY, None, Options::default());
    decrypter.decrypt(tx).await.unwrap();
    assert_eq!(
        decrypter.history,
        vec![State::Resolving, State::Ready, State::Decrypting, State::Idle]
    );

    // Resolved keys are reused.
    decrypter.decrypt(tx).await.unwrap();
    assert_eq!(
        decrypter.history[4..],
        [State::Decrypting, State::Idle]
    );
}

#[tokio::test]
async fn test_psk_random_key() {
    let (transport, contract) = setup();

    let mut emitter = Session::new(
        transport.clone(),
        KeyAgreement::pre_shared_key(None).unwrap(),
        Some(contract),
        Options::default(),
    );
    let outcome = emitter.emit(b"random").await.unwrap();

    // Nothing but the printed key opens the event.
    let mut decrypter = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    assert!(matches!(
        decrypter.decrypt(outcome.transaction).await,
        Err(Error::AuthenticationFailed)
    ));
    assert_eq!(decrypter.state(), State::Terminated);
}

#[tokio::test]
async fn test_ecdh_sender_bound() {
    let (transport, contract) = setup();

    let mut emitter = Session::new(
        transport.clone(),
        KeyAgreement::ecdh(Some(CALLER_SECRET)).unwrap(),
        Some(contract),
        sender_bound(),
    );
    let outcome = emitter.emit(b"hello ecdh").await.unwrap();
    let material = outcome.key_material().to_string();
    assert!(material.contains("contract public key: 0x"));
    assert!(material.contains(&format!("caller secret: 0x{CALLER_SECRET}")));

    let mut decrypter = Session::new(
        transport.clone(),
        KeyAgreement::ecdh(Some(CALLER_SECRET)).unwrap(),
        Some(contract),
        sender_bound(),
    );
    let events = decrypter.decrypt(outcome.transaction).await.unwrap();
    assert_eq!(events[0].plaintext.as_bytes(), b"hello ecdh");
    assert_eq!(decrypter.mode(), KeyAgreementMode::EcdhDerived);

    // Same key, wrong associated data mode.
    let mut decrypter = Session::new(
        transport.clone(),
        KeyAgreement::ecdh(Some(CALLER_SECRET)).unwrap(),
        Some(contract),
        Options::default(),
    );
    assert!(matches!(
        decrypter.decrypt(outcome.transaction).await,
        Err(Error::AuthenticationFailed)
    ));

    // Another identity derives another key.
    let mut decrypter = Session::new(
        transport.clone(),
        KeyAgreement::ecdh(None).unwrap(),
        Some(contract),
        sender_bound(),
    );
    assert!(matches!(
        decrypter.decrypt(outcome.transaction).await,
        Err(Error::AuthenticationFailed)
    ));
}

#[tokio::test]
async fn test_context_bound() {
    let (transport, contract) = setup();
    let options = Options {
        aad_mode: AadMode::ContextBound,
        ..Default::default()
    };

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), options);
    let tx = emitter.emit(b"in context").await.unwrap().transaction;

    let mut decrypter = psk_session(&transport, ZERO_KEY, None, options);
    let events = decrypter.decrypt(tx).await.unwrap();
    assert_eq!(events[0].plaintext.as_bytes(), b"in context");

    let mut decrypter = psk_session(&transport, ZERO_KEY, None, sender_bound());
    assert!(matches!(
        decrypter.decrypt(tx).await,
        Err(Error::AuthenticationFailed)
    ));
}

#[tokio::test]
async fn test_ambiguous_receipt() {
    let (transport, first) = setup();
    let second = H160::repeat_byte(0xdd);
    transport.deploy(second);

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(first), Options::default());
    let tx1 = emitter.emit(b"first").await.unwrap().transaction;
    let mut emitter = psk_session(&transport, ZERO_KEY, Some(second), Options::default());
    let tx2 = emitter.emit(b"second").await.unwrap().transaction;

    let mut logs = transport.receipt_logs(tx1).await.unwrap();
    logs.extend(transport.receipt_logs(tx2).await.unwrap());
    let tx = transport.push_receipt(logs);

    let mut decrypter = psk_session(&transport, ZERO_KEY, None, Options::default());
    match decrypter.decrypt(tx).await {
        Err(Error::AmbiguousEventMatch(contracts)) => assert_eq!(contracts, vec![first, second]),
        other => panic!("unexpected result: {other:?}"),
    }

    let mut decrypter = psk_session(&transport, ZERO_KEY, Some(second), Options::default());
    let events = decrypter.decrypt(tx).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].plaintext.as_bytes(), b"second");
}

#[tokio::test]
async fn test_no_event() {
    let (transport, contract) = setup();
    let tx = transport.push_receipt(vec![RawLog {
        address: contract,
        topics: vec![H256::repeat_byte(0x01)],
        data: vec![],
        transaction_hash: None,
    }]);

    let mut decrypter = psk_session(&transport, ZERO_KEY, None, Options::default());
    assert!(matches!(
        decrypter.decrypt(tx).await,
        Err(Error::EventNotFound(hash)) if hash == tx
    ));
}

#[tokio::test]
async fn test_legacy_event_sender_bound() {
    let (transport, contract) = setup();
    let legacy = H160::repeat_byte(0xee);
    transport.deploy_with(
        legacy,
        ContractOptions {
            legacy_events: true,
            ..Default::default()
        },
    );

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(legacy), Options::default());
    let tx = emitter.emit(b"legacy").await.unwrap().transaction;
    let mut decrypter = psk_session(&transport, ZERO_KEY, None, Options::default());
    let events = decrypter.decrypt(tx).await.unwrap();
    assert_eq!(events[0].event.sender, None);
    assert_eq!(events[0].plaintext.as_bytes(), b"legacy");

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(legacy), sender_bound());
    let tx = emitter.emit(b"legacy").await.unwrap().transaction;
    let mut bound = psk_session(&transport, ZERO_KEY, None, sender_bound());
    assert!(matches!(bound.decrypt(tx).await, Err(Error::MissingSender)));

    // A session is bound to the contract it resolved keys for.
    let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let tx = emitter.emit(b"elsewhere").await.unwrap().transaction;
    assert!(matches!(
        decrypter.decrypt(tx).await,
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_per_message_keys() {
    let (transport, contract) = setup();
    let per_message = H160::repeat_byte(0xaa);
    transport.deploy_with(
        per_message,
        ContractOptions {
            per_message_keys: true,
            ..Default::default()
        },
    );
    let options = Options {
        per_message_keys: true,
        ..Default::default()
    };

    let mut emitter = psk_session(&transport, ZERO_KEY, Some(per_message), options);
    let tx = emitter.emit(b"derived").await.unwrap().transaction;
    let mut decrypter = psk_session(&transport, ZERO_KEY, None, options);
    assert_eq!(
        decrypter.decrypt(tx).await.unwrap()[0].plaintext.as_bytes(),
        b"derived"
    );

    // The emitter seals with the session key while the decrypter derives.
    let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), options);
    let tx = emitter.emit(b"plain").await.unwrap().transaction;
    let mut decrypter = psk_session(&transport, ZERO_KEY, None, options);
    assert!(matches!(
        decrypter.decrypt(tx).await,
        Err(Error::ConfigurationMismatch)
    ));
}

#[tokio::test]
async fn test_missing_contract() {
    let (transport, _) = setup();
    let mut session = psk_session(&transport, ZERO_KEY, None, Options::default());
    assert!(matches!(
        session.emit(b"nowhere").await,
        Err(Error::InvalidConfig(_))
    ));
    assert_eq!(session.state(), State::Terminated);

    // Terminated sessions refuse further work.
    assert!(matches!(
        session.decrypt(H256::zero()).await,
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_transport_offline() {
    let (transport, contract) = setup();
    let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let tx = emitter.emit(b"ping").await.unwrap().transaction;

    transport.set_offline(true);
    let mut decrypter = psk_session(&transport, ZERO_KEY, None, Options::default());
    assert!(matches!(
        decrypter.decrypt(tx).await,
        Err(Error::Transport(_))
    ));

    let mut listener = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    assert!(matches!(
        listener.listen(CancellationToken::new(), |_| {}).await,
        Err(Error::Transport(_))
    ));
    assert_eq!(listener.state(), State::Terminated);

    let mut ecdh = Session::new(
        transport.clone(),
        KeyAgreement::ecdh(None).unwrap(),
        Some(contract),
        Options::default(),
    );
    assert!(matches!(
        ecdh.emit(b"ping").await,
        Err(Error::Transport(_))
    ));
}

#[tokio::test]
async fn test_listen() {
    let (transport, contract) = setup();
    let cancel = CancellationToken::new();
    let received = RefCell::new(Vec::new());

    let mut listener = psk_session(&transport, ZERO_KEY, Some(contract), sender_bound());
    let listen = listener.listen(cancel.clone(), |event| {
        received
            .borrow_mut()
            .push(event.plaintext.as_text().unwrap().to_string())
    });

    let drive = async {
        wait_for_subscriber(&transport).await;

        let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), sender_bound());
        emitter.emit(b"one").await.unwrap();

        // Failures of single deliveries do not end the subscription.
        transport
            .deliver(contract, Err(Error::Transport(anyhow!("dropped"))))
            .await;
        transport
            .deliver(
                contract,
                Ok(RawLog {
                    address: contract,
                    topics: vec![*EVENT_TOPIC, H256::zero()],
                    data: vec![1, 2, 3],
                    transaction_hash: None,
                }),
            )
            .await;
        let mut stranger = psk_session(&transport, &"11".repeat(32), Some(contract), sender_bound());
        stranger.emit(b"wrong key").await.unwrap();
        let mut unbound = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
        unbound.emit(b"wrong binding").await.unwrap();

        emitter.emit(b"two").await.unwrap();

        while received.borrow().len() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
    };

    let (summary, _) = tokio::join!(listen, drive);
    let summary = summary.unwrap();

    assert_eq!(*received.borrow(), vec!["one".to_string(), "two".to_string()]);
    assert_eq!(
        summary,
        ListenSummary {
            delivered: 5,
            decrypted: 2,
            failed: 4,
            mismatch_reported: false,
            auth_failures_reported: false,
        }
    );
    assert_eq!(listener.state(), State::Terminated);
    assert_eq!(transport.subscriber_count(), 0);
}

#[tokio::test]
async fn test_listen_handler_panic() {
    let (transport, contract) = setup();
    let cancel = CancellationToken::new();
    let calls = RefCell::new(0);

    let mut listener = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let listen = listener.listen(cancel.clone(), |event| {
        *calls.borrow_mut() += 1;
        if event.plaintext.as_bytes() == b"boom" {
            panic!("handler failure");
        }
    });

    let drive = async {
        wait_for_subscriber(&transport).await;
        let mut emitter = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
        emitter.emit(b"boom").await.unwrap();
        emitter.emit(b"fine").await.unwrap();
        while *calls.borrow() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
    };

    let (summary, _) = tokio::join!(listen, drive);
    let summary = summary.unwrap();
    assert_eq!(summary.decrypted, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_listen_closed_by_transport() {
    let (transport, contract) = setup();

    let mut listener = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let listen = listener.listen(CancellationToken::new(), |_| {});
    let drive = async {
        wait_for_subscriber(&transport).await;
        transport.close_subscriptions();
    };

    let (result, _) = tokio::join!(listen, drive);
    assert!(matches!(result, Err(Error::Transport(_))));
    assert_eq!(listener.state(), State::Terminated);
}

#[tokio::test]
async fn test_listen_cancelled_upfront() {
    let (transport, contract) = setup();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut listener = psk_session(&transport, ZERO_KEY, Some(contract), Options::default());
    let summary = listener.listen(cancel, |_| {}).await.unwrap();
    assert_eq!(summary, ListenSummary::default());
    assert_eq!(transport.subscriber_count(), 0);
}
