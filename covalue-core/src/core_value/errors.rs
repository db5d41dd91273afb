/*
    errors.rs - Error types for the transaction log

    Raised while creating values, appending local transactions and
    applying remote chunks. Integrity failures reject a whole chunk; out of
    order chunks are answered with a correction by the sync layer.
*/

use super::ids::{CoValueId, SessionId};
use crate::crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoValueError {
    /// Signature did not verify against the chunk's streaming hash
    #[error("Integrity check failed for {session}: {reason}")]
    Integrity { session: SessionId, reason: String },

    /// Chunk does not start where the local session ends
    #[error("Out of order chunk for {session}: have {expected} transactions, chunk starts after {got}")]
    OutOfOrder {
        session: SessionId,
        expected: usize,
        got: usize,
    },

    /// Header hash does not match the claimed id
    #[error("Header mismatch: expected {expected}, computed {computed}")]
    HeaderMismatch {
        expected: CoValueId,
        computed: CoValueId,
    },

    /// Local append into a session this agent does not own
    #[error("Session {0} is not owned by the signing agent")]
    SessionNotOwned(SessionId),

    /// Private transaction requested without a usable read key
    #[error("No read key available for {0}")]
    NoReadKey(CoValueId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type CoValueResult<T> = Result<T, CoValueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_display() {
        let err = CoValueError::OutOfOrder {
            session: SessionId::parse("co_zA_session_z1").unwrap(),
            expected: 3,
            got: 5,
        };
        assert_eq!(
            err.to_string(),
            "Out of order chunk for co_zA_session_z1: have 3 transactions, chunk starts after 5"
        );
    }

    #[test]
    fn test_crypto_error_converts() {
        let err: CoValueError = CryptoError::DecryptionFailed.into();
        assert_eq!(err.to_string(), "Decryption failed");
    }
}
