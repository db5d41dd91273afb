//! Error types for the local node

use crate::content::ContentError;
use crate::core_value::{CoValueError, CoValueId};
use crate::crypto::CryptoError;
use crate::permissions::InviteError;
use crate::sync::SyncError;
use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    CoValue(#[from] CoValueError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// No peer could provide the value
    #[error("Value {0} is unavailable")]
    Unavailable(CoValueId),

    #[error("Value {0} is not a group")]
    NotAGroup(CoValueId),

    /// The local account lacks the role for the requested change
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error(transparent)]
    Invite(#[from] InviteError),

    #[error("Lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,
}

pub type NodeResult<T> = Result<T, NodeError>;

pub(crate) fn handle_poison<T>(_err: PoisonError<T>) -> NodeError {
    NodeError::LockPoisoned
}
