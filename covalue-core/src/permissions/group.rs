//! Group handle
//!
//! Every membership operation is an ordinary one-change transaction on the
//! group's register map. Read keys travel the same way: each member gets
//! the current key sealed to its agent, and a rotation leaves the previous
//! key encrypted under the new one so history stays readable.

use super::evaluator::{current_role, key_reveal_field, READ_KEY_FIELD};
use super::invite::InviteLink;
use super::role::{MemberKey, Role};
use crate::content::{MapChange, RegisterMap};
use crate::core_value::{ActorId, CoValueError, CoValueId, Header, Privacy, Ruleset, ValueKind};
use crate::crypto::{KeyId, KeySecret};
use crate::node::errors::{NodeError, NodeResult};
use crate::node::reader::ENCRYPTED_PREFIX;
use crate::node::values::{BinaryCoStream, CoList, CoMap, CoStream};
use crate::node::LocalNode;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Group {
    node: LocalNode,
    id: CoValueId,
}

impl Group {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        Group { node, id }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    /// Role table and key fields
    pub fn map(&self) -> NodeResult<RegisterMap> {
        self.node.with_reader(|reader| reader.group_map(&self.id))
    }

    /// Current role of `actor`, including what `everyone` grants
    pub fn role_of(&self, actor: &ActorId) -> NodeResult<Option<Role>> {
        Ok(current_role(&self.map()?, actor))
    }

    pub fn my_role(&self) -> NodeResult<Option<Role>> {
        self.role_of(self.node.actor())
    }

    /// Explicit role-table entries
    pub fn members(&self) -> NodeResult<Vec<(MemberKey, Role)>> {
        let map = self.map()?;
        Ok(map
            .entries()
            .filter_map(|(key, value)| Some((MemberKey::parse(key)?, Role::from_value(value)?)))
            .collect())
    }

    pub(crate) fn set_field(&self, field: &str, value: Value) -> NodeResult<()> {
        self.node.make_transaction(
            &self.id,
            vec![MapChange::set(field, value).to_value()],
            Privacy::Trusting,
        )?;
        Ok(())
    }

    fn require_admin(&self) -> NodeResult<()> {
        match self.my_role()? {
            Some(Role::Admin) => Ok(()),
            other => Err(NodeError::NotPermitted(format!(
                "{} is {} in group {}",
                self.node.actor(),
                other.map(|r| r.as_str()).unwrap_or("not a member"),
                self.id
            ))),
        }
    }

    /// Member key this node's own reveals are sealed to
    ///
    /// In the account itself the agent is the member.
    fn my_member(&self) -> ActorId {
        if self.node.account_id() == Some(&self.id) {
            ActorId::Agent(self.node.agent_id().clone())
        } else {
            self.node.actor().clone()
        }
    }

    /// First read key of a freshly created group
    pub(crate) fn initialize_read_key(&self) -> NodeResult<KeyId> {
        let (key_id, secret) = self.node.crypto().new_read_key();
        self.reveal_to(&MemberKey::Actor(self.my_member()), &key_id, &secret)?;
        self.set_field(READ_KEY_FIELD, Value::String(key_id.to_string()))?;
        Ok(key_id)
    }

    /// Current read key, if this node can obtain it
    pub fn get_read_key(&self) -> NodeResult<Option<(KeyId, KeySecret)>> {
        self.node.with_reader(|reader| Ok(reader.current_read_key(&self.id)))
    }

    /// Any (possibly superseded) read key of this group
    pub fn read_key(&self, key_id: &KeyId) -> NodeResult<Option<KeySecret>> {
        self.node.with_reader(|reader| Ok(reader.read_key(&self.id, key_id)))
    }

    fn current_key(&self) -> NodeResult<(KeyId, KeySecret)> {
        self.get_read_key()?
            .ok_or_else(|| CoValueError::NoReadKey(self.id.clone()).into())
    }

    fn reveal_to(&self, member: &MemberKey, key_id: &KeyId, secret: &KeySecret) -> NodeResult<()> {
        match member {
            MemberKey::Everyone => self.set_field(
                &key_reveal_field(key_id, MemberKey::EVERYONE),
                Value::String(secret.encode()),
            ),
            MemberKey::Actor(actor) => {
                let (field, value) = self.node.key_reveal_for(key_id, secret, actor)?;
                self.set_field(&field, value)
            }
        }
    }

    /// Grant `role` to `member`, loading the member's account first
    pub async fn add_member(&self, member: &MemberKey, role: Role) -> NodeResult<()> {
        if let MemberKey::Actor(ActorId::Account(account)) = member {
            self.node.load_required(account).await?;
        }
        self.add_member_local(member, role)
    }

    /// Grant `role` to a member whose account is already available
    pub fn add_member_local(&self, member: &MemberKey, role: Role) -> NodeResult<()> {
        self.require_admin()?;
        if *member == MemberKey::Everyone && !matches!(role, Role::Reader | Role::Writer) {
            return Err(NodeError::NotPermitted(format!("everyone cannot be {}", role)));
        }

        let key = self.current_key()?;
        self.set_field(&member.to_string(), role.to_value())?;
        if role.can_read() || role.is_invite() {
            self.reveal_to(member, &key.0, &key.1)?;
        }
        info!(group = %self.id, member = %member, role = %role, "member added");
        Ok(())
    }

    /// Revoke `member` and rotate the read key away from it
    pub async fn remove_member(&self, member: &MemberKey) -> NodeResult<KeyId> {
        self.require_admin()?;
        let map = self.map()?;
        let current = map.get(&member.to_string()).and_then(Role::from_value);
        let is_me = *member == MemberKey::Actor(self.node.actor().clone());
        if current == Some(Role::Admin) && !is_me {
            return Err(NodeError::NotPermitted(format!("cannot revoke admin {}", member)));
        }

        self.set_field(&member.to_string(), Role::Revoked.to_value())?;
        info!(group = %self.id, member = %member, "member revoked");
        self.rotate_read_key().await
    }

    /// Replace the read key
    ///
    /// The new key is revealed to every member that can still read, the
    /// old key is kept readable under the new one.
    pub async fn rotate_read_key(&self) -> NodeResult<KeyId> {
        self.require_admin()?;
        let (old_id, old_secret) = self.current_key()?;
        let (new_id, new_secret) = self.node.crypto().new_read_key();

        for (member, role) in self.members()? {
            if !(role.can_read() || role.is_invite()) {
                continue;
            }
            if let MemberKey::Actor(ActorId::Account(account)) = &member {
                if let Err(e) = self.node.load_required(account).await {
                    warn!(group = %self.id, member = %member, error = %e, "cannot reveal new key to member");
                    continue;
                }
            }
            self.reveal_to(&member, &new_id, &new_secret)?;
        }

        let field = key_reveal_field(&old_id, new_id.as_str());
        let encrypted = self.node.crypto().encrypt(
            old_secret.encode().as_bytes(),
            &new_secret,
            field.as_bytes(),
        )?;
        self.set_field(
            &field,
            Value::String(format!("{}{}", ENCRYPTED_PREFIX, hex::encode(encrypted))),
        )?;
        self.set_field(READ_KEY_FIELD, Value::String(new_id.to_string()))?;

        info!(group = %self.id, old = %old_id, new = %new_id, "rotated read key");
        Ok(new_id)
    }

    /// Invite link granting `role` to whoever accepts it
    pub fn create_invite(&self, role: Role) -> NodeResult<InviteLink> {
        self.require_admin()?;
        let invite_role = role
            .invite_for()
            .ok_or_else(|| NodeError::NotPermitted(format!("no invite grants {}", role)))?;

        let secret = self.node.crypto().new_agent_secret();
        let agent = ActorId::Agent(self.node.crypto().agent_id(&secret));
        let (key_id, key_secret) = self.current_key()?;

        let member = MemberKey::Actor(agent);
        self.set_field(&member.to_string(), invite_role.to_value())?;
        self.reveal_to(&member, &key_id, &key_secret)?;
        Ok(InviteLink::new(self.id.clone(), secret))
    }

    fn create_owned(&self, kind: ValueKind, meta: Option<Value>) -> NodeResult<CoValueId> {
        let header = Header::new(
            kind,
            Ruleset::OwnedByGroup {
                group: self.id.clone(),
            },
            meta,
            self.node.crypto().random_salt(),
        );
        self.node.create_value(header)
    }

    pub fn create_map(&self, meta: Option<Value>) -> NodeResult<CoMap> {
        let id = self.create_owned(ValueKind::Map, meta)?;
        Ok(CoMap::new(self.node.clone(), id))
    }

    pub fn create_list(&self, meta: Option<Value>) -> NodeResult<CoList> {
        let id = self.create_owned(ValueKind::List, meta)?;
        Ok(CoList::new(self.node.clone(), id))
    }

    pub fn create_stream(&self, meta: Option<Value>) -> NodeResult<CoStream> {
        let id = self.create_owned(ValueKind::Stream, meta)?;
        Ok(CoStream::new(self.node.clone(), id))
    }

    pub fn create_binary_stream(&self, meta: Option<Value>) -> NodeResult<BinaryCoStream> {
        let id = self.create_owned(ValueKind::BinaryStream, meta)?;
        Ok(BinaryCoStream::new(self.node.clone(), id))
    }
}
