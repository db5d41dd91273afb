use crate::core_value::{
    ActorId, CoValueCore, CoValueError, Header, Privacy, Ruleset, SessionId, Transaction, ValueKind,
};
use crate::crypto::{AgentSecret, CryptoProvider, DalekCrypto};
use serde_json::json;
use std::sync::Arc;

struct Writer {
    secret: AgentSecret,
    session: SessionId,
}

fn crypto() -> Arc<dyn CryptoProvider> {
    Arc::new(DalekCrypto::new())
}

fn writer(crypto: &Arc<dyn CryptoProvider>) -> Writer {
    let secret = crypto.new_agent_secret();
    let actor = ActorId::Agent(crypto.agent_id(&secret));
    Writer {
        session: SessionId::new(&actor, &crypto.random_salt()),
        secret,
    }
}

fn new_core(crypto: &Arc<dyn CryptoProvider>) -> CoValueCore {
    let header = Header::new(
        ValueKind::Map,
        Ruleset::UnsafeAllowAll,
        None,
        crypto.random_salt(),
    );
    CoValueCore::create(header, crypto.clone()).unwrap()
}

fn append(core: &mut CoValueCore, w: &Writer, made_at: u64, value: i64) {
    let agent = core.crypto().agent_id(&w.secret);
    core.make_transaction(
        &w.session,
        &w.secret,
        &agent,
        vec![json!({ "op": "set", "key": "n", "value": value })],
        Privacy::Trusting,
        None,
        made_at,
    )
    .unwrap();
}

#[test]
fn test_make_transaction_rejects_foreign_session() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let bob = writer(&crypto);
    let mut core = new_core(&crypto);

    let bob_agent = crypto.agent_id(&bob.secret);
    let result = core.make_transaction(
        &alice.session,
        &bob.secret,
        &crypto.agent_id(&alice.secret),
        vec![json!(1)],
        Privacy::Trusting,
        None,
        1,
    );
    assert!(matches!(result, Err(CoValueError::SessionNotOwned(_))));
    assert_ne!(&bob_agent, alice.session.actor().as_agent().unwrap());
    assert_eq!(core.session_len(&alice.session), 0);
}

#[test]
fn test_make_transaction_rejects_agent_session_of_another_signer() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let bob = writer(&crypto);
    let mut core = new_core(&crypto);

    // Signer and expected agent agree, but the session belongs to alice
    let result = core.make_transaction(
        &alice.session,
        &bob.secret,
        &crypto.agent_id(&bob.secret),
        vec![json!(1)],
        Privacy::Trusting,
        None,
        1,
    );
    assert!(matches!(result, Err(CoValueError::SessionNotOwned(_))));
    assert_eq!(core.session_len(&alice.session), 0);

    append(&mut core, &alice, 2, 2);
    assert_eq!(core.session_len(&alice.session), 1);
}

#[test]
fn test_remote_chunk_round_trip() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let mut source = new_core(&crypto);
    append(&mut source, &alice, 1, 1);
    append(&mut source, &alice, 2, 2);

    let mut replica =
        CoValueCore::from_remote_header(source.id(), source.header().clone(), crypto.clone())
            .unwrap();
    let agent = crypto.agent_id(&alice.secret);

    for content in source.new_content_since(None) {
        for (session, piece) in &content.new {
            let added = replica
                .try_add_transactions(
                    session,
                    piece.after,
                    &piece.new_transactions,
                    &piece.last_signature,
                    std::slice::from_ref(&agent),
                )
                .unwrap();
            assert_eq!(added, 2);
        }
    }

    assert_eq!(replica.known_state(), source.known_state());
}

#[test]
fn test_duplicate_chunk_is_noop_and_gap_is_out_of_order() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let mut source = new_core(&crypto);
    for n in 0..3 {
        append(&mut source, &alice, n, n as i64);
    }

    let agent = crypto.agent_id(&alice.secret);
    let log = source.session(&alice.session).unwrap();
    let signature = log.last_signature().unwrap().clone();
    let all = log.transactions().to_vec();

    let mut replica =
        CoValueCore::from_remote_header(source.id(), source.header().clone(), crypto.clone())
            .unwrap();

    let gap = replica.try_add_transactions(&alice.session, 1, &all[1..], &signature, &[agent.clone()]);
    assert!(matches!(
        gap,
        Err(CoValueError::OutOfOrder { expected: 0, got: 1, .. })
    ));

    assert_eq!(
        replica
            .try_add_transactions(&alice.session, 0, &all, &signature, &[agent.clone()])
            .unwrap(),
        3
    );
    assert_eq!(
        replica
            .try_add_transactions(&alice.session, 0, &all, &signature, &[agent])
            .unwrap(),
        0
    );
    assert_eq!(replica.session_len(&alice.session), 3);
}

#[test]
fn test_tampered_chunk_rejected_without_partial_apply() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let mut source = new_core(&crypto);
    append(&mut source, &alice, 1, 1);
    append(&mut source, &alice, 2, 2);

    let log = source.session(&alice.session).unwrap();
    let signature = log.last_signature().unwrap().clone();
    let mut txs = log.transactions().to_vec();
    txs[1] = Transaction::Trusting {
        made_at: 2,
        changes: vec![json!({ "op": "set", "key": "n", "value": 999 })],
    };

    let mut replica =
        CoValueCore::from_remote_header(source.id(), source.header().clone(), crypto.clone())
            .unwrap();
    let result = replica.try_add_transactions(
        &alice.session,
        0,
        &txs,
        &signature,
        &[crypto.agent_id(&alice.secret)],
    );

    assert!(matches!(result, Err(CoValueError::Integrity { .. })));
    assert_eq!(replica.session_len(&alice.session), 0);
}

#[test]
fn test_wrong_signer_is_integrity_failure() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let mallory = writer(&crypto);
    let mut source = new_core(&crypto);
    append(&mut source, &alice, 1, 1);

    let log = source.session(&alice.session).unwrap();
    let mut replica =
        CoValueCore::from_remote_header(source.id(), source.header().clone(), crypto.clone())
            .unwrap();

    let result = replica.try_add_transactions(
        &alice.session,
        0,
        log.transactions(),
        log.last_signature().unwrap(),
        &[crypto.agent_id(&mallory.secret)],
    );
    assert!(matches!(result, Err(CoValueError::Integrity { .. })));
}

#[test]
fn test_header_mismatch_rejected() {
    let crypto = crypto();
    let source = new_core(&crypto);
    let other = new_core(&crypto);

    let result = CoValueCore::from_remote_header(other.id(), source.header().clone(), crypto);
    assert!(matches!(result, Err(CoValueError::HeaderMismatch { .. })));
}

#[test]
fn test_private_transaction_round_trip() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let mut core = new_core(&crypto);
    let (key_id, key) = crypto.new_read_key();
    let agent = crypto.agent_id(&alice.secret);

    let tx_id = core
        .make_transaction(
            &alice.session,
            &alice.secret,
            &agent,
            vec![json!({ "op": "set", "key": "secret", "value": "s3cr3t" })],
            Privacy::Private,
            Some((&key_id, &key)),
            10,
        )
        .unwrap();

    let (_, tx) = core.transactions().next().unwrap();
    let Transaction::Private {
        key_used,
        encrypted_changes,
        ..
    } = tx
    else {
        panic!("expected private transaction");
    };
    assert_eq!(key_used, &key_id);
    assert!(!encrypted_changes.contains("s3cr3t"));

    let changes = core.decrypt_changes(&tx_id, encrypted_changes, &key).unwrap();
    assert_eq!(changes[0]["value"], "s3cr3t");

    let no_key = core.make_transaction(
        &alice.session,
        &alice.secret,
        &agent,
        vec![json!(1)],
        Privacy::Private,
        None,
        11,
    );
    assert!(matches!(no_key, Err(CoValueError::NoReadKey(_))));
}

#[test]
fn test_content_since_known_state() {
    let crypto = crypto();
    let alice = writer(&crypto);
    let bob = writer(&crypto);
    let mut core = new_core(&crypto);
    append(&mut core, &alice, 1, 1);
    append(&mut core, &alice, 2, 2);
    append(&mut core, &bob, 3, 3);

    let mut known = core.known_state();
    known.set(alice.session.clone(), 1);
    known.sessions.remove(&bob.session);

    let content = core.new_content_since(Some(&known));
    assert_eq!(content.len(), 1);
    assert!(content[0].header.is_none());
    assert_eq!(content[0].new[&alice.session].after, 1);
    assert_eq!(content[0].new[&alice.session].new_transactions.len(), 1);
    assert_eq!(content[0].new[&bob.session].after, 0);

    assert!(core.new_content_since(Some(&core.known_state())).is_empty());

    let fresh = core.new_content_since(None);
    assert!(fresh[0].header.is_some());
    assert_eq!(fresh[0].implied_known_state(), core.known_state());
}
