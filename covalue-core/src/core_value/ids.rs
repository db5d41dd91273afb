/*
    ids.rs - Identifiers for values, actors, sessions and transactions

    Every identifier has a canonical text form, which is also its wire and
    storage form:

    - CoValueId      co_z<base58>                  (hash of the header)
    - AgentId        agent_z<sealer>_z<signer>     (public keys)
    - ActorId        an AgentId or an account's CoValueId
    - SessionId      <actor>_session_z<salt>
    - TransactionId  (SessionId, index within the session)
    - OpId           (SessionId, tx index, change index)

    Session ordering is byte-wise over the text form; the canonical replay
    order of transactions relies on it.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

fn decode_key(encoded: &str) -> Option<[u8; 32]> {
    bs58::decode(encoded).into_vec().ok()?.try_into().ok()
}

/// Content-derived identifier of a collaborative value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CoValueId(String);

impl CoValueId {
    pub const PREFIX: &'static str = "co_z";

    /// Build from a header digest (first 20 bytes are used)
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        CoValueId(format!("{}{}", Self::PREFIX, bs58::encode(&digest[..20]).into_string()))
    }

    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(Self::PREFIX)?;
        if rest.is_empty() || rest.contains('_') {
            return None;
        }
        Some(CoValueId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CoValueId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CoValueId::parse(&value).ok_or_else(|| format!("invalid value id '{}'", value))
    }
}

impl From<CoValueId> for String {
    fn from(id: CoValueId) -> Self {
        id.0
    }
}

/// Public identity of an agent: its X25519 sealer key and Ed25519 signer key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    pub const PREFIX: &'static str = "agent_z";

    pub fn from_public_keys(sealer: &[u8; 32], signer: &[u8; 32]) -> Self {
        AgentId(format!(
            "{}{}_z{}",
            Self::PREFIX,
            bs58::encode(sealer).into_string(),
            bs58::encode(signer).into_string()
        ))
    }

    pub fn parse(value: &str) -> Option<Self> {
        let id = AgentId(value.to_string());
        id.sealer_public()?;
        id.signer_public()?;
        Some(id)
    }

    fn parts(&self) -> Option<(&str, &str)> {
        self.0.strip_prefix(Self::PREFIX)?.split_once("_z")
    }

    pub fn sealer_public(&self) -> Option<[u8; 32]> {
        decode_key(self.parts()?.0)
    }

    pub fn signer_public(&self) -> Option<[u8; 32]> {
        decode_key(self.parts()?.1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AgentId::parse(&value).ok_or_else(|| format!("invalid agent id '{}'", value))
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

/// Author of a session: a bare agent, or an account acting through its
/// current agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActorId {
    Agent(AgentId),
    Account(CoValueId),
}

impl ActorId {
    pub fn parse(value: &str) -> Option<Self> {
        if value.starts_with(AgentId::PREFIX) {
            AgentId::parse(value).map(ActorId::Agent)
        } else {
            CoValueId::parse(value).map(ActorId::Account)
        }
    }

    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            ActorId::Agent(agent) => Some(agent),
            ActorId::Account(_) => None,
        }
    }

    pub fn as_account(&self) -> Option<&CoValueId> {
        match self {
            ActorId::Account(account) => Some(account),
            ActorId::Agent(_) => None,
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Agent(agent) => agent.fmt(f),
            ActorId::Account(account) => account.fmt(f),
        }
    }
}

impl From<AgentId> for ActorId {
    fn from(agent: AgentId) -> Self {
        ActorId::Agent(agent)
    }
}

impl TryFrom<String> for ActorId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ActorId::parse(&value).ok_or_else(|| format!("invalid actor id '{}'", value))
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.to_string()
    }
}

/// One writer's append-only log within a value
///
/// Equality, hashing and ordering use the text form only; ordering is
/// byte-wise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId {
    repr: String,
    actor: ActorId,
}

impl SessionId {
    const MARKER: &'static str = "_session_z";

    pub fn new(actor: &ActorId, salt: &str) -> Self {
        SessionId {
            repr: format!("{}{}{}", actor, Self::MARKER, salt),
            actor: actor.clone(),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (actor, salt) = value.rsplit_once(Self::MARKER)?;
        if salt.is_empty() {
            return None;
        }
        Some(SessionId {
            repr: value.to_string(),
            actor: ActorId::parse(actor)?,
        })
    }

    /// The actor that owns this session
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }
}

impl PartialEq for SessionId {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl Eq for SessionId {}

impl std::hash::Hash for SessionId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.repr.hash(state);
    }
}

impl PartialOrd for SessionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.repr.as_bytes().cmp(other.repr.as_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::parse(&value).ok_or_else(|| format!("invalid session id '{}'", value))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.repr
    }
}

/// Position of a transaction within a value
///
/// Derived ordering (session, then index) is the canonical tie-break for
/// transactions made at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionId {
    pub session_id: SessionId,
    pub tx_index: usize,
}

impl TransactionId {
    pub fn new(session_id: SessionId, tx_index: usize) -> Self {
        Self {
            session_id,
            tx_index,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.tx_index)
    }
}

/// A single change inside a transaction; list operations reference these
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpId {
    pub session_id: SessionId,
    pub tx_index: usize,
    pub change_index: usize,
}

impl OpId {
    pub fn new(tx_id: &TransactionId, change_index: usize) -> Self {
        Self {
            session_id: tx_id.session_id.clone(),
            tx_index: tx_id.tx_index,
            change_index,
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.tx_index, self.change_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(seed: u8) -> AgentId {
        AgentId::from_public_keys(&[seed; 32], &[seed.wrapping_add(1); 32])
    }

    #[test]
    fn test_agent_id_parts() {
        let id = agent(3);
        assert!(id.as_str().starts_with("agent_z"));
        assert_eq!(id.sealer_public(), Some([3; 32]));
        assert_eq!(id.signer_public(), Some([4; 32]));
        assert_eq!(AgentId::parse(id.as_str()), Some(id));
        assert!(AgentId::parse("agent_zabc").is_none());
    }

    #[test]
    fn test_actor_id_dispatch() {
        let agent_actor = ActorId::parse(agent(1).as_str()).unwrap();
        assert!(agent_actor.as_agent().is_some());

        let account = ActorId::parse("co_zAccount1").unwrap();
        assert_eq!(account.as_account().map(|a| a.as_str()), Some("co_zAccount1"));

        assert!(ActorId::parse("everyone").is_none());
        assert!(ActorId::parse("key_zabc").is_none());
    }

    #[test]
    fn test_session_id_actor() {
        let actor = ActorId::Agent(agent(9));
        let session = SessionId::new(&actor, "salt42");
        assert_eq!(session.actor(), &actor);
        assert_eq!(SessionId::parse(session.as_str()), Some(session.clone()));

        let account = ActorId::parse("co_zAcc").unwrap();
        let session = SessionId::new(&account, "x");
        assert_eq!(session.as_str(), "co_zAcc_session_zx");
        assert_eq!(session.actor(), &account);

        assert!(SessionId::parse("co_zAcc_session_z").is_none());
        assert!(SessionId::parse("nonsense_session_zx").is_none());
    }

    #[test]
    fn test_session_order_is_bytewise() {
        let a = SessionId::parse("co_zA_session_z1").unwrap();
        let b = SessionId::parse("co_zB_session_z0").unwrap();
        let lower = SessionId::parse("co_za_session_z0").unwrap();
        assert!(a < b);
        assert!(b < lower);
    }

    #[test]
    fn test_transaction_id_order() {
        let s1 = SessionId::parse("co_zA_session_z1").unwrap();
        let s2 = SessionId::parse("co_zB_session_z1").unwrap();
        assert!(TransactionId::new(s1.clone(), 5) < TransactionId::new(s2, 0));
        assert!(TransactionId::new(s1.clone(), 0) < TransactionId::new(s1, 1));
    }

    #[test]
    fn test_serde_uses_text_form() {
        let session = SessionId::parse("co_zA_session_z1").unwrap();
        let json = serde_json::to_string(&session).unwrap();
        assert_eq!(json, "\"co_zA_session_z1\"");

        let bad: Result<CoValueId, _> = serde_json::from_str("\"not_an_id\"");
        assert!(bad.is_err());
    }
}
