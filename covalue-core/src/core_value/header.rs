/*
    header.rs - Immutable creation record of a value

    The header fixes the value's kind, its permission ruleset and optional
    metadata. The value id is the BLAKE3 hash of the header's JSON form, so
    a header received from a peer is checked by recomputing the id.
*/

use super::errors::{CoValueError, CoValueResult};
use super::ids::{ActorId, CoValueId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Content resolver a value uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    /// Last-writer-wins register map
    Map,
    /// Causal sequence
    List,
    /// Per-session streams
    Stream,
    /// Session stream carrying start/chunk/end binary items
    BinaryStream,
}

/// Which transactions of a value are valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The value is itself a group; it holds its own role table
    #[serde(rename_all = "camelCase")]
    Group { initial_admin: ActorId },
    /// Writes are authorized by another group's role table
    OwnedByGroup { group: CoValueId },
    /// Every transaction is valid
    UnsafeAllowAll,
}

/// Creation record of a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub kind: ValueKind,
    pub ruleset: Ruleset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// Distinguishes otherwise identical headers
    pub uniqueness: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Header {
    pub fn new(kind: ValueKind, ruleset: Ruleset, meta: Option<serde_json::Value>, uniqueness: String) -> Self {
        Self {
            kind,
            ruleset,
            meta,
            uniqueness,
            created_at: now_millis(),
        }
    }

    /// Content-derived id of this header
    pub fn id(&self) -> CoValueResult<CoValueId> {
        let encoded =
            serde_json::to_vec(self).map_err(|e| CoValueError::Serialization(e.to_string()))?;
        Ok(CoValueId::from_digest(blake3::hash(&encoded).as_bytes()))
    }

    /// Check that `id` really is the id of this header
    pub fn verify_id(&self, id: &CoValueId) -> CoValueResult<()> {
        let computed = self.id()?;
        if &computed != id {
            return Err(CoValueError::HeaderMismatch {
                expected: id.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Group that authorizes writes, for owned values
    pub fn owner_group(&self) -> Option<&CoValueId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    /// Accounts are groups tagged with `meta.type = "account"`
    pub fn is_account(&self) -> bool {
        self.is_group()
            && self
                .meta
                .as_ref()
                .and_then(|m| m.get("type"))
                .and_then(|t| t.as_str())
                == Some("account")
    }
}
