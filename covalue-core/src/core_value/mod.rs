/*
    core_value - Signed, append-only transaction logs

    The verifiable substrate every collaborative value is built on:
    - Content-addressed value ids and actor/session identifiers
    - Per-session transaction logs with streaming hashes and chunk
      signatures
    - Known states, the sync layer's view of what a peer holds
*/

pub mod core;
pub mod errors;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod session_log;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use self::core::{assemble_content, CoValueCore, NewContent};
pub use errors::{CoValueError, CoValueResult};
pub use header::{now_millis, Header, Ruleset, ValueKind};
pub use ids::{ActorId, AgentId, CoValueId, OpId, SessionId, TransactionId};
pub use known_state::KnownState;
pub use session_log::{split_into_pieces, SessionNewContent, MAX_RECOMMENDED_TX_SIZE};
pub use transaction::{DecryptedTransaction, Privacy, Transaction};
