//! Group invite links
//!
//! An invite is a fresh agent holding an `*Invite` role in a group, plus a
//! read key sealed to it. Whoever holds the agent's secret can act as it
//! once: write its own role grant for their account and pass the read key
//! on. The link carries the group and that secret:
//!
//! ```text
//! covalue://invite/<group id>/<invite agent secret>
//! ```

use crate::core_value::CoValueId;
use crate::crypto::AgentSecret;
use std::fmt;
use std::str::FromStr;

const SCHEME: &str = "covalue://invite/";

/// Invite operation errors
#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("Malformed invite link")]
    Malformed,

    #[error("Invalid group id in invite: {0}")]
    InvalidGroup(String),

    #[error("Invalid invite secret")]
    InvalidSecret,

    /// The invite agent holds no invite role (never granted, or revoked)
    #[error("Invite is not valid in group {0}")]
    NotAnInvite(CoValueId),

    /// Invites never restore revoked members
    #[error("Account was revoked from group {0}")]
    Revoked(CoValueId),
}

/// Shareable invite to a group
#[derive(Clone)]
pub struct InviteLink {
    pub group: CoValueId,
    pub secret: AgentSecret,
}

impl InviteLink {
    pub fn new(group: CoValueId, secret: AgentSecret) -> Self {
        InviteLink { group, secret }
    }

    pub fn parse(link: &str) -> Result<Self, InviteError> {
        let rest = link.strip_prefix(SCHEME).ok_or(InviteError::Malformed)?;
        let (group, secret) = rest.split_once('/').ok_or(InviteError::Malformed)?;
        if secret.is_empty() || secret.contains('/') {
            return Err(InviteError::Malformed);
        }

        let group = CoValueId::parse(group).ok_or_else(|| InviteError::InvalidGroup(group.to_string()))?;
        let secret = AgentSecret::decode(secret).map_err(|_| InviteError::InvalidSecret)?;
        Ok(InviteLink { group, secret })
    }
}

impl FromStr for InviteLink {
    type Err = InviteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InviteLink::parse(s)
    }
}

impl fmt::Display for InviteLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.group, self.secret.encode())
    }
}

// The secret stays out of logs
impl fmt::Debug for InviteLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteLink")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}
