use crate::core_value::{
    ActorId, CoValueCore, Header, Privacy, Ruleset, SessionId, ValueKind, MAX_RECOMMENDED_TX_SIZE,
};
use crate::crypto::{CryptoProvider, DalekCrypto};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_large_session_streams_in_verifiable_pieces() {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(DalekCrypto::new());
    let secret = crypto.new_agent_secret();
    let agent = crypto.agent_id(&secret);
    let session = SessionId::new(&ActorId::Agent(agent.clone()), "s");

    let header = Header::new(ValueKind::BinaryStream, Ruleset::UnsafeAllowAll, None, "u".into());
    let mut source = CoValueCore::create(header, crypto.clone()).unwrap();

    let big = "ab".repeat(MAX_RECOMMENDED_TX_SIZE / 2 + 100);
    let items = vec![
        json!({ "type": "start", "mimeType": "application/octet-stream" }),
        json!({ "type": "chunk", "chunk": big }),
        json!({ "type": "chunk", "chunk": big }),
        json!({ "type": "chunk", "chunk": big }),
        json!({ "type": "end" }),
    ];
    for (n, item) in items.into_iter().enumerate() {
        source
            .make_transaction(&session, &secret, &agent, vec![item], Privacy::Trusting, None, n as u64)
            .unwrap();
    }

    let messages = source.new_content_since(None);
    assert_eq!(messages.len(), 4);
    assert!(messages[0].header.is_some());
    assert!(messages[1..].iter().all(|m| m.header.is_none()));

    let mut replica =
        CoValueCore::from_remote_header(source.id(), source.header().clone(), crypto.clone())
            .unwrap();
    for message in &messages {
        let piece = &message.new[&session];
        replica
            .try_add_transactions(
                &session,
                piece.after,
                &piece.new_transactions,
                &piece.last_signature,
                std::slice::from_ref(&agent),
            )
            .unwrap();
    }
    assert_eq!(replica.session_len(&session), 5);

    // A peer holding the first two transactions gets pieces from index 2 on
    let mut partial = source.known_state();
    partial.set(session.clone(), 2);
    let tail = source.new_content_since(Some(&partial));
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[0].new[&session].after, 2);
}
