//! Test fixtures for nodes and peer topologies
//!
//! Every fixture uses millisecond delays so retry paths run quickly, and
//! the real dalek crypto so signatures and sealing are exercised.

use crate::config::SyncConfig;
use crate::crypto::{CryptoProvider, DalekCrypto};
use crate::node::LocalNode;
use crate::sync::{connected_peers, PeerRole, StoragePeer, StorageBackend};
use std::sync::Arc;
use std::time::Duration;

pub fn test_crypto() -> Arc<dyn CryptoProvider> {
    Arc::new(DalekCrypto)
}

/// Sync configuration with short delays
pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay: Duration::from_millis(10),
        max_load_retries: 2,
        load_timeout: Duration::from_millis(500),
        sync_timeout: Duration::from_secs(2),
    }
}

/// Node acting as a freshly created account
pub fn new_account_node(name: &str) -> LocalNode {
    LocalNode::with_new_account(test_crypto(), name, test_config())
        .expect("failed to create account node")
}

/// Node acting as a bare agent, the usual shape of a sync server
pub fn new_server_node() -> LocalNode {
    let crypto = test_crypto();
    let secret = crypto.new_agent_secret();
    LocalNode::with_agent(crypto, secret, test_config())
}

/// Connect `client` to `server`, the server being upstream
pub fn connect_to_server(client: &LocalNode, server: &LocalNode, client_name: &str) {
    let (for_client, for_server) =
        connected_peers(client_name, "server", (PeerRole::Server, PeerRole::Client));
    server.sync().add_peer(for_server);
    client.sync().add_peer(for_client);
}

/// Connect two nodes as equal clients of each other
pub fn connect_as_peers(a: &LocalNode, b: &LocalNode, a_name: &str, b_name: &str) {
    let (for_a, for_b) = connected_peers(a_name, b_name, (PeerRole::Client, PeerRole::Client));
    a.sync().add_peer(for_a);
    b.sync().add_peer(for_b);
}

/// Attach a storage peer serving `backend`
pub fn attach_storage(node: &LocalNode, name: &str, backend: Arc<dyn StorageBackend>) {
    node.sync().add_peer(StoragePeer::spawn(name, backend));
}
