/*
    sync_integration.rs - Nodes converging through a sync server

    Every test wires account nodes to a bare-agent server over in-memory
    channels and checks what each side can read once the logs have moved.
*/

use covalue_core::content::ContentView;
use covalue_core::core_value::{
    ActorId, CoValueCore, CoValueId, Header, KnownState, Privacy, Ruleset, SessionId, ValueKind,
};
use covalue_core::crypto::CryptoProvider;
use covalue_core::node::LocalNode;
use covalue_core::permissions::{MemberKey, Role};
use covalue_core::sync::{connected_peers, LoadResult, Peer, PeerRole, SyncMessage, SyncStatus};
use covalue_core::test_utils::{
    assert_completes_within, connect_to_server, eventually, new_account_node, new_server_node,
    test_config, test_crypto, DEFAULT_TEST_TIMEOUT,
};
use serde_json::json;
use std::sync::Arc;

fn account_of(node: &LocalNode) -> CoValueId {
    node.account_id().expect("node has an account").clone()
}

async fn publish(node: &LocalNode, id: &CoValueId) {
    node.wait_for_sync(id).await.expect("value reached the server");
}

#[tokio::test]
async fn test_two_clients_converge_through_server() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let bob = new_account_node("bob");
    connect_to_server(&alice, &server, "alice");
    connect_to_server(&bob, &server, "bob");

    let group = alice.create_group().unwrap();
    group
        .add_member_local(&MemberKey::Everyone, Role::Writer)
        .unwrap();
    let map = group.create_map(None).unwrap();
    map.set("title", json!("hello"), Privacy::Trusting).unwrap();
    publish(&alice, map.id()).await;

    assert_eq!(bob.load(map.id()).await, LoadResult::Available);
    let bobs_map = bob.map(map.id()).unwrap();
    assert_eq!(bobs_map.get("title").unwrap(), Some(json!("hello")));

    bobs_map.set("reply", json!("hi alice"), Privacy::Trusting).unwrap();
    eventually(DEFAULT_TEST_TIMEOUT, "alice sees bob's reply", || {
        map.get("reply").ok().flatten() == Some(json!("hi alice"))
    })
    .await;

    assert_eq!(
        alice.known_state(map.id()).unwrap(),
        bob.known_state(map.id()).unwrap()
    );
}

#[tokio::test]
async fn test_private_content_needs_membership() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let bob = new_account_node("bob");
    let carol = new_account_node("carol");
    for (node, name) in [(&alice, "alice"), (&bob, "bob"), (&carol, "carol")] {
        connect_to_server(node, &server, name);
    }
    publish(&bob, &account_of(&bob)).await;

    let group = alice.create_group().unwrap();
    group
        .add_member(&MemberKey::Actor(ActorId::Account(account_of(&bob))), Role::Reader)
        .await
        .unwrap();
    let map = group.create_map(None).unwrap();
    map.set("secret", json!("42"), Privacy::Private).unwrap();
    map.set("public", json!("hi"), Privacy::Trusting).unwrap();
    publish(&alice, map.id()).await;

    assert_eq!(bob.load(map.id()).await, LoadResult::Available);
    assert_eq!(bob.map(map.id()).unwrap().get("secret").unwrap(), Some(json!("42")));

    assert_eq!(carol.load(map.id()).await, LoadResult::Available);
    let carols_view = carol.map(map.id()).unwrap();
    assert_eq!(carols_view.get("secret").unwrap(), None);
    assert_eq!(carols_view.get("public").unwrap(), Some(json!("hi")));
}

#[tokio::test]
async fn test_revoked_member_loses_new_content() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let bob = new_account_node("bob");
    connect_to_server(&alice, &server, "alice");
    connect_to_server(&bob, &server, "bob");
    publish(&bob, &account_of(&bob)).await;

    let bob_member = MemberKey::Actor(ActorId::Account(account_of(&bob)));
    let group = alice.create_group().unwrap();
    group.add_member(&bob_member, Role::Reader).await.unwrap();
    let map = group.create_map(None).unwrap();
    map.set("before", json!(1), Privacy::Private).unwrap();

    let old_key = group.get_read_key().unwrap().unwrap().0;
    let new_key = group.remove_member(&bob_member).await.unwrap();
    assert_ne!(old_key, new_key);
    map.set("after", json!(2), Privacy::Private).unwrap();
    publish(&alice, map.id()).await;

    // Old content stays readable for alice through the key chain
    assert_eq!(map.get("before").unwrap(), Some(json!(1)));
    assert_eq!(map.get("after").unwrap(), Some(json!(2)));

    assert_eq!(bob.load(map.id()).await, LoadResult::Available);
    let bobs_map = bob.map(map.id()).unwrap();
    assert_eq!(bobs_map.get("before").unwrap(), Some(json!(1)));
    assert_eq!(bobs_map.get("after").unwrap(), None);
    assert_eq!(
        bob.group(group.id()).unwrap().my_role().unwrap(),
        Some(Role::Revoked)
    );
}

#[tokio::test]
async fn test_writes_by_non_members_are_ignored() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let mallory = new_account_node("mallory");
    connect_to_server(&alice, &server, "alice");
    connect_to_server(&mallory, &server, "mallory");

    let group = alice.create_group().unwrap();
    let map = group.create_map(None).unwrap();
    map.set("owner", json!("alice"), Privacy::Trusting).unwrap();
    publish(&alice, map.id()).await;

    assert_eq!(mallory.load(map.id()).await, LoadResult::Available);
    mallory
        .map(map.id())
        .unwrap()
        .set("owner", json!("mallory"), Privacy::Trusting)
        .unwrap();
    publish(&mallory, map.id()).await;

    let mallory_session = mallory.session_for(map.id()).clone();
    eventually(DEFAULT_TEST_TIMEOUT, "alice holds mallory's transaction", || {
        alice
            .known_state(map.id())
            .ok()
            .flatten()
            .map(|known| known.get(&mallory_session) == 1)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(map.get("owner").unwrap(), Some(json!("alice")));
}

#[tokio::test]
async fn test_invite_link_grants_role() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let bob = new_account_node("bob");
    connect_to_server(&alice, &server, "alice");
    connect_to_server(&bob, &server, "bob");

    let group = alice.create_group().unwrap();
    let map = group.create_map(None).unwrap();
    map.set("note", json!("for writers"), Privacy::Private).unwrap();
    let link = group.create_invite(Role::Writer).unwrap();
    publish(&alice, map.id()).await;
    publish(&alice, group.id()).await;

    let parsed: covalue_core::InviteLink = link.to_string().parse().unwrap();
    let bobs_group = bob.accept_invite(&parsed).await.unwrap();
    assert_eq!(bobs_group.my_role().unwrap(), Some(Role::Writer));

    // Accepting twice changes nothing
    let known = bob.known_state(group.id()).unwrap();
    bob.accept_invite(&parsed).await.unwrap();
    assert_eq!(bob.known_state(group.id()).unwrap(), known);

    assert_eq!(bob.load(map.id()).await, LoadResult::Available);
    let bobs_map = bob.map(map.id()).unwrap();
    assert_eq!(bobs_map.get("note").unwrap(), Some(json!("for writers")));
    bobs_map.set("signed", json!("bob"), Privacy::Private).unwrap();

    eventually(DEFAULT_TEST_TIMEOUT, "alice sees bob's write", || {
        map.get("signed").ok().flatten() == Some(json!("bob"))
    })
    .await;
    assert_eq!(
        group.role_of(&ActorId::Account(account_of(&bob))).unwrap(),
        Some(Role::Writer)
    );
}

#[tokio::test]
async fn test_subscription_sees_remote_change() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let bob = new_account_node("bob");
    connect_to_server(&alice, &server, "alice");
    connect_to_server(&bob, &server, "bob");

    let group = alice.create_group().unwrap();
    group
        .add_member_local(&MemberKey::Everyone, Role::Reader)
        .unwrap();
    let list = group.create_list(None).unwrap();
    list.push(json!("first"), Privacy::Private).unwrap();
    publish(&alice, list.id()).await;

    assert_eq!(bob.load(list.id()).await, LoadResult::Available);
    let mut updates = bob.list(list.id()).unwrap().subscribe();

    list.push(json!("second"), Privacy::Private).unwrap();
    assert_completes_within(DEFAULT_TEST_TIMEOUT, async {
        loop {
            match updates.changed().await {
                Ok(ContentView::List(seq)) if seq.len() == 2 => break,
                Ok(_) => continue,
                Err(e) => panic!("failed to read list: {}", e),
            }
        }
    })
    .await;
    assert_eq!(
        bob.list(list.id()).unwrap().values().unwrap(),
        vec![json!("first"), json!("second")]
    );
}

#[tokio::test]
async fn test_sync_status_tracks_acknowledgements() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    let (for_alice, for_server) =
        connected_peers("alice", "server", (PeerRole::Server, PeerRole::Client));
    let server_id = for_alice.id.clone();
    server.sync().add_peer(for_server);
    alice.sync().add_peer(for_alice);

    let group = alice.create_group().unwrap();
    let stream = group.create_stream(None).unwrap();
    stream.push(json!({ "n": 1 }), Privacy::Trusting).unwrap();

    alice
        .sync()
        .wait_for_sync(&server_id, stream.id(), DEFAULT_TEST_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(
        alice.sync().sync_status(&server_id, stream.id()).unwrap(),
        SyncStatus::Synced
    );
    assert_eq!(server.known_state(stream.id()).unwrap(), alice.known_state(stream.id()).unwrap());
    assert_eq!(stream.my_items().unwrap().len(), 1);
}

#[tokio::test]
async fn test_account_login_on_second_device() {
    let server = new_server_node();
    let alice = new_account_node("alice");
    connect_to_server(&alice, &server, "alice");
    let account = account_of(&alice);
    publish(&alice, &account).await;

    let (for_device, for_server) =
        connected_peers("alice-phone", "server", (PeerRole::Server, PeerRole::Client));
    server.sync().add_peer(for_server);
    let phone = LocalNode::with_loaded_account(
        test_crypto(),
        account.clone(),
        alice.agent_secret().clone(),
        vec![for_device],
        test_config(),
    )
    .await
    .unwrap();

    assert_eq!(phone.actor(), &ActorId::Account(account));
    let group = phone.create_group().unwrap();
    assert_eq!(group.my_role().unwrap(), Some(Role::Admin));
}

/// Next `known` the node sends us, skipping pushed content
async fn next_known(peer: &mut Peer) -> (KnownState, bool) {
    assert_completes_within(DEFAULT_TEST_TIMEOUT, async {
        loop {
            match peer.incoming.recv().await {
                Some(SyncMessage::Known { known, is_correction }) => return (known, is_correction),
                Some(_) => continue,
                None => panic!("node hung up"),
            }
        }
    })
    .await
}

#[tokio::test]
async fn test_gap_in_content_heals_through_correction() {
    let crypto: Arc<dyn CryptoProvider> = test_crypto();
    let secret = crypto.new_agent_secret();
    let agent = crypto.agent_id(&secret);
    let session = SessionId::new(&ActorId::Agent(agent.clone()), &crypto.random_salt());
    let header = Header::new(ValueKind::Stream, Ruleset::UnsafeAllowAll, None, crypto.random_salt());
    let mut source = CoValueCore::create(header, crypto.clone()).unwrap();
    for n in 0..3 {
        source
            .make_transaction(&session, &secret, &agent, vec![json!(n)], Privacy::Trusting, None, n)
            .unwrap();
    }

    let node = new_server_node();
    let (for_node, mut remote) =
        connected_peers("node", "remote", (PeerRole::Client, PeerRole::Server));
    node.sync().add_peer(for_node);

    // Header plus transactions 1..3, missing transaction 0
    let mut seen = KnownState::empty(source.id().clone());
    seen.header = true;
    seen.set(session.clone(), 1);
    let mut gapped = source.new_content_since(Some(&seen)).remove(0);
    gapped.header = Some(source.header().clone());
    remote.outgoing.send(SyncMessage::Content(gapped)).unwrap();

    let (known, is_correction) = next_known(&mut remote).await;
    assert!(is_correction);
    assert!(known.header);
    assert_eq!(known.get(&session), 0);

    for content in source.new_content_since(Some(&known)) {
        remote.outgoing.send(SyncMessage::Content(content)).unwrap();
    }
    let (known, is_correction) = next_known(&mut remote).await;
    assert!(!is_correction);
    assert_eq!(known, source.known_state());

    let items = node.stream(source.id()).unwrap().content().unwrap();
    let values: Vec<_> = items.items_in_session(&session).iter().map(|item| item.value.clone()).collect();
    assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
}
