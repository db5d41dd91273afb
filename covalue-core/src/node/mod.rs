/*
    node - One agent's local view of the world

    The local node ties the layers together:
    - entry       per-value load state machine and the value registry
    - reader      permission filtering, key resolution and decryption
    - local_node  identity, value creation, transactions, invites
    - values      typed handles and change subscriptions
*/

pub mod entry;
pub mod errors;
pub mod local_node;
pub mod reader;
pub mod values;

pub use entry::{CoValueEntry, EntryState, LoadStatus, ValueRegistry};
pub use errors::{NodeError, NodeResult};
pub use local_node::{LocalNode, NodeIdentity};
pub use values::{BinaryCoStream, CoList, CoMap, CoStream, ValueSubscription, DEFAULT_BINARY_CHUNK_SIZE};
