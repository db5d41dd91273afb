//! Group roles and role-table keys

use crate::core_value::ActorId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Role an actor (or everyone) holds in a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    Revoked,
    AdminInvite,
    WriterInvite,
    ReaderInvite,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Revoked => "revoked",
            Role::AdminInvite => "adminInvite",
            Role::WriterInvite => "writerInvite",
            Role::ReaderInvite => "readerInvite",
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(self) -> Value {
        Value::String(self.as_str().to_string())
    }

    /// Admins and writers may write to owned values
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer)
    }

    pub fn can_read(&self) -> bool {
        matches!(self, Role::Admin | Role::Writer | Role::Reader)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, Role::AdminInvite | Role::WriterInvite | Role::ReaderInvite)
    }

    /// Role an invite of this kind grants
    pub fn granted_by_invite(&self) -> Option<Role> {
        match self {
            Role::AdminInvite => Some(Role::Admin),
            Role::WriterInvite => Some(Role::Writer),
            Role::ReaderInvite => Some(Role::Reader),
            _ => None,
        }
    }

    /// Invite role that grants this role
    pub fn invite_for(&self) -> Option<Role> {
        match self {
            Role::Admin => Some(Role::AdminInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Reader => Some(Role::ReaderInvite),
            _ => None,
        }
    }

    /// Ordering of membership roles; None for revoked and invite roles
    pub(crate) fn rank(&self) -> Option<u8> {
        match self {
            Role::Reader => Some(1),
            Role::Writer => Some(2),
            Role::Admin => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a role-table entry: a specific actor, or everyone
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberKey {
    Everyone,
    Actor(ActorId),
}

impl MemberKey {
    pub const EVERYONE: &'static str = "everyone";

    pub fn parse(key: &str) -> Option<Self> {
        if key == Self::EVERYONE {
            Some(MemberKey::Everyone)
        } else {
            ActorId::parse(key).map(MemberKey::Actor)
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKey::Everyone => f.write_str(Self::EVERYONE),
            MemberKey::Actor(actor) => actor.fmt(f),
        }
    }
}

impl From<ActorId> for MemberKey {
    fn from(actor: ActorId) -> Self {
        MemberKey::Actor(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_wire_names() {
        assert_eq!(Role::from_value(&json!("writerInvite")), Some(Role::WriterInvite));
        assert_eq!(Role::from_value(&json!("admin")), Some(Role::Admin));
        assert_eq!(Role::from_value(&json!("owner")), None);
        assert_eq!(Role::ReaderInvite.to_value(), json!("readerInvite"));
    }

    #[test]
    fn test_invite_mapping() {
        for role in [Role::Admin, Role::Writer, Role::Reader] {
            let invite = role.invite_for().unwrap();
            assert!(invite.is_invite());
            assert_eq!(invite.granted_by_invite(), Some(role));
        }
        assert_eq!(Role::Revoked.invite_for(), None);
    }

    #[test]
    fn test_member_key_parse() {
        assert_eq!(MemberKey::parse("everyone"), Some(MemberKey::Everyone));
        assert!(matches!(MemberKey::parse("co_zAccount"), Some(MemberKey::Actor(_))));
        assert_eq!(MemberKey::parse("readKey"), None);
        assert_eq!(MemberKey::Everyone.to_string(), "everyone");
    }
}
