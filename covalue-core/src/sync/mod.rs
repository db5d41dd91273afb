/*
    sync - Peer-to-peer replication of transaction logs

    - message   the four protocol messages
    - peer      peer identity, role and channels
    - manager   per-peer known states, load/retry, dependency-first pushes
    - storage   storage backends served as a peer
*/

pub mod errors;
pub mod manager;
pub mod message;
pub mod peer;
pub mod storage;

pub use errors::{SyncError, SyncResult};
pub use manager::{LoadResult, PeerState, SyncManager, SyncStatus};
pub use message::SyncMessage;
pub use peer::{connected_peers, Peer, PeerId, PeerRole};
pub use storage::{open_storage, MemoryStorage, SqliteStorage, StorageBackend, StoragePeer};
