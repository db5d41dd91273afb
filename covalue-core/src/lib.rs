/*
    covalue-core - Local-first collaborative values

    Values are append-only, signed transaction logs that every node
    resolves to the same content. Nodes exchange logs with the sync
    protocol and decide locally which transactions are valid.

    Layers, bottom up:
    - crypto       signing, sealing and symmetric encryption
    - core_value   headers, session logs, known states
    - content      resolvers for maps, lists, streams, binary streams
    - permissions  groups, roles, read keys, invites
    - node         the local node, typed value handles
    - sync         peers, the sync manager, storage peers
*/

pub mod config;
pub mod content;
pub mod core_value;
pub mod crypto;
pub mod logging;
pub mod node;
pub mod permissions;
pub mod sync;

#[doc(hidden)]
pub mod test_utils;

pub use config::{Config, ConfigError, SyncConfig};
pub use content::ContentView;
pub use core_value::{ActorId, AgentId, CoValueId, Header, Privacy, Ruleset, ValueKind};
pub use crypto::{CryptoProvider, DalekCrypto};
pub use logging::{init_logging, LogLevel};
pub use node::{LocalNode, NodeError, NodeResult};
pub use permissions::{Group, InviteLink, MemberKey, Role};
pub use sync::{Peer, PeerId, PeerRole, SyncManager, SyncMessage};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = Role::Admin;
        let _ = Privacy::Private;
    }
}
