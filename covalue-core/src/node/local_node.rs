//! The local node
//!
//! A `LocalNode` is one agent's view of the world: the registry of values
//! it knows, its identity (agent, optional account, sessions), its peers
//! and the channel subscribers listen on. It is cheap to clone; all state
//! lives behind one `Arc`.

use super::entry::{LoadStatus, ValueRegistry};
use super::errors::{handle_poison, NodeError, NodeResult};
use super::reader::{KeyHolder, Reader, SEALED_PREFIX};
use super::values::{BinaryCoStream, CoList, CoMap, CoStream, ValueSubscription};
use crate::config::SyncConfig;
use crate::content::errors::ContentError;
use crate::content::{ContentView, MapChange};
use crate::core_value::{
    now_millis, ActorId, AgentId, CoValueCore, CoValueError, CoValueId, Header, KnownState,
    Privacy, Ruleset, SessionId, TransactionId, ValueKind,
};
use crate::crypto::{AgentSecret, CryptoProvider, KeyId, KeySecret};
use crate::permissions::evaluator::{key_reveal_field, PROFILE_FIELD};
use crate::permissions::{Group, InviteError, InviteLink, MemberKey, Role};
use crate::sync::{LoadResult, Peer, PeerId, PeerState, SyncManager};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Who this node acts as
#[derive(Debug)]
pub struct NodeIdentity {
    pub agent_secret: AgentSecret,
    pub agent_id: AgentId,
    /// The account, or the bare agent for account-less nodes
    pub actor: ActorId,
    /// Session used for the account's own value
    pub agent_session: SessionId,
    /// Session used for every other value
    pub actor_session: SessionId,
}

impl NodeIdentity {
    fn new(crypto: &dyn CryptoProvider, agent_secret: AgentSecret, account: Option<CoValueId>) -> Self {
        let agent_id = crypto.agent_id(&agent_secret);
        let agent_actor = ActorId::Agent(agent_id.clone());
        let actor = account.map(ActorId::Account).unwrap_or_else(|| agent_actor.clone());
        NodeIdentity {
            agent_session: SessionId::new(&agent_actor, &crypto.random_salt()),
            actor_session: SessionId::new(&actor, &crypto.random_salt()),
            agent_secret,
            agent_id,
            actor,
        }
    }

    /// Role-table keys whose key reveals this node can open
    pub fn member_keys(&self) -> Vec<MemberKey> {
        let mut members = vec![MemberKey::Actor(self.actor.clone())];
        if self.actor.as_agent().is_none() {
            members.push(MemberKey::Actor(ActorId::Agent(self.agent_id.clone())));
        }
        members
    }
}

pub(crate) struct NodeInner {
    pub(crate) identity: NodeIdentity,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) config: SyncConfig,
    pub(crate) registry: RwLock<ValueRegistry>,
    pub(crate) peers: RwLock<HashMap<PeerId, PeerState>>,
    pub(crate) updates: broadcast::Sender<CoValueId>,
}

#[derive(Clone)]
pub struct LocalNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("actor", &self.inner.identity.actor)
            .finish_non_exhaustive()
    }
}

impl LocalNode {
    fn new(
        crypto: Arc<dyn CryptoProvider>,
        agent_secret: AgentSecret,
        account: Option<CoValueId>,
        config: SyncConfig,
    ) -> Self {
        let identity = NodeIdentity::new(crypto.as_ref(), agent_secret, account);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        LocalNode {
            inner: Arc::new(NodeInner {
                identity,
                crypto,
                config,
                registry: RwLock::new(ValueRegistry::new()),
                peers: RwLock::new(HashMap::new()),
                updates,
            }),
        }
    }

    /// Node acting as a bare agent, without an account
    pub fn with_agent(crypto: Arc<dyn CryptoProvider>, agent_secret: AgentSecret, config: SyncConfig) -> Self {
        Self::new(crypto, agent_secret, None, config)
    }

    /// Create a fresh account and a node acting as it
    ///
    /// The account is a group administered by a new agent. It gets an
    /// initial read key and a public profile carrying `name`.
    pub fn with_new_account(
        crypto: Arc<dyn CryptoProvider>,
        name: &str,
        config: SyncConfig,
    ) -> NodeResult<Self> {
        let agent_secret = crypto.new_agent_secret();
        let agent_id = crypto.agent_id(&agent_secret);
        let header = Header::new(
            ValueKind::Map,
            Ruleset::Group {
                initial_admin: ActorId::Agent(agent_id.clone()),
            },
            Some(json!({ "type": "account" })),
            crypto.random_salt(),
        );
        let account_id = header.id()?;

        let node = Self::new(crypto.clone(), agent_secret, Some(account_id.clone()), config);
        node.write_registry()?
            .insert_available(CoValueCore::create(header, crypto)?);

        let account = Group::new(node.clone(), account_id.clone());
        account.set_field(&agent_id.to_string(), Role::Admin.to_value())?;
        account.initialize_read_key()?;

        let profile_group = node.create_group()?;
        profile_group.add_member_local(&MemberKey::Everyone, Role::Reader)?;
        let profile = profile_group.create_map(Some(json!({ "type": "profile" })))?;
        profile.set("name", json!(name), Privacy::Trusting)?;
        account.set_field(PROFILE_FIELD, json!(profile.id().as_str()))?;

        info!(account = %account_id, agent = %agent_id, "created account");
        Ok(node)
    }

    /// Act as an existing account, loading it from `peers`
    pub async fn with_loaded_account(
        crypto: Arc<dyn CryptoProvider>,
        account_id: CoValueId,
        agent_secret: AgentSecret,
        peers: Vec<Peer>,
        config: SyncConfig,
    ) -> NodeResult<Self> {
        let node = Self::new(crypto, agent_secret, Some(account_id.clone()), config);
        for peer in peers {
            node.sync().add_peer(peer);
        }

        if node.load(&account_id).await == LoadResult::Unavailable {
            return Err(NodeError::Unavailable(account_id));
        }

        let account = Group::new(node.clone(), account_id.clone());
        let agent = ActorId::Agent(node.agent_id().clone());
        if account.role_of(&agent)? != Some(Role::Admin) {
            return Err(NodeError::NotPermitted(format!(
                "agent is not an admin of account {}",
                account_id
            )));
        }
        Ok(node)
    }

    /// Secret of the acting agent; logging into the account elsewhere needs it
    pub fn agent_secret(&self) -> &AgentSecret {
        &self.inner.identity.agent_secret
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.identity.agent_id
    }

    /// Account (or agent) this node acts as
    pub fn actor(&self) -> &ActorId {
        &self.inner.identity.actor
    }

    pub fn account_id(&self) -> Option<&CoValueId> {
        self.inner.identity.actor.as_account()
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.inner.crypto
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn sync(&self) -> SyncManager {
        SyncManager::new(self.clone())
    }

    /// Wait until every upstream peer holds all of `id`, up to `sync_timeout`
    pub async fn wait_for_sync(&self, id: &CoValueId) -> NodeResult<()> {
        let timeout = self.inner.config.sync_timeout;
        Ok(self.sync().wait_for_upstream_sync(id, timeout).await?)
    }

    pub(crate) fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub(crate) fn read_registry(&self) -> NodeResult<RwLockReadGuard<'_, ValueRegistry>> {
        self.inner.registry.read().map_err(handle_poison)
    }

    pub(crate) fn write_registry(&self) -> NodeResult<RwLockWriteGuard<'_, ValueRegistry>> {
        self.inner.registry.write().map_err(handle_poison)
    }

    /// Run `f` with a reader for this node's identity
    pub(crate) fn with_reader<R>(&self, f: impl FnOnce(&Reader<'_>) -> NodeResult<R>) -> NodeResult<R> {
        let identity = &self.inner.identity;
        self.with_reader_for(&identity.agent_secret, identity.member_keys(), f)
    }

    /// Run `f` with a reader holding another secret
    pub(crate) fn with_reader_for<R>(
        &self,
        secret: &AgentSecret,
        members: Vec<MemberKey>,
        f: impl FnOnce(&Reader<'_>) -> NodeResult<R>,
    ) -> NodeResult<R> {
        let registry = self.read_registry()?;
        let reader = Reader {
            registry: &registry,
            crypto: self.inner.crypto.as_ref(),
            holder: KeyHolder { secret, members },
        };
        f(&reader)
    }

    /// Session this node writes to in `id`
    pub fn session_for(&self, id: &CoValueId) -> &SessionId {
        let identity = &self.inner.identity;
        if identity.actor.as_account() == Some(id) {
            &identity.agent_session
        } else {
            &identity.actor_session
        }
    }

    /// Agent that must have signed for `session`
    fn expected_signer(&self, session: &SessionId) -> NodeResult<AgentId> {
        match session.actor() {
            ActorId::Agent(agent) => Ok(agent.clone()),
            ActorId::Account(account) if Some(account) == self.account_id() => {
                Ok(self.agent_id().clone())
            }
            ActorId::Account(_) => Err(CoValueError::SessionNotOwned(session.clone()).into()),
        }
    }

    /// Create a value from a header; returns its id
    pub fn create_value(&self, header: Header) -> NodeResult<CoValueId> {
        let core = CoValueCore::create(header, self.inner.crypto.clone())?;
        let id = core.id().clone();
        self.write_registry()?.insert_available(core);
        debug!(co_value = %id, "created value");
        self.sync().sync_value(&id);
        Ok(id)
    }

    /// Create a group administered by this node's actor
    pub fn create_group(&self) -> NodeResult<Group> {
        let header = Header::new(
            ValueKind::Map,
            Ruleset::Group {
                initial_admin: self.actor().clone(),
            },
            None,
            self.inner.crypto.random_salt(),
        );
        let id = self.create_value(header)?;
        let group = Group::new(self.clone(), id);
        group.set_field(&self.actor().to_string(), Role::Admin.to_value())?;
        group.initialize_read_key()?;
        Ok(group)
    }

    /// Append a transaction to `id` in this node's session
    pub fn make_transaction(
        &self,
        id: &CoValueId,
        changes: Vec<Value>,
        privacy: Privacy,
    ) -> NodeResult<TransactionId> {
        let session = self.session_for(id).clone();
        let signer = self.inner.identity.agent_secret.clone();
        self.append_transaction(id, &session, &signer, changes, privacy)
    }

    /// Append a transaction signed by `signer` into `session`
    pub(crate) fn append_transaction(
        &self,
        id: &CoValueId,
        session: &SessionId,
        signer: &AgentSecret,
        changes: Vec<Value>,
        privacy: Privacy,
    ) -> NodeResult<TransactionId> {
        let expected = self.expected_signer(session)?;

        let read_key: Option<(KeyId, KeySecret)> = match privacy {
            Privacy::Trusting => None,
            Privacy::Private => self.with_reader(|reader| {
                let core = reader.core(id)?;
                let group = Reader::key_group(core).ok_or_else(|| CoValueError::NoReadKey(id.clone()))?;
                reader
                    .current_read_key(group)
                    .ok_or_else(|| CoValueError::NoReadKey(id.clone()).into())
            }).map(Some)?,
        };

        let tx_id = {
            let mut registry = self.write_registry()?;
            let core = registry
                .core_mut(id)
                .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            core.make_transaction(
                session,
                signer,
                &expected,
                changes,
                privacy,
                read_key.as_ref().map(|(k, s)| (k, s)),
                now_millis(),
            )?
        };

        self.notify(id);
        self.sync().sync_value(id);
        Ok(tx_id)
    }

    /// Readable content of a value
    pub fn content(&self, id: &CoValueId) -> NodeResult<ContentView> {
        self.with_reader(|reader| reader.content(id))
    }

    pub fn known_state(&self, id: &CoValueId) -> NodeResult<Option<KnownState>> {
        Ok(self.read_registry()?.core(id).map(CoValueCore::known_state))
    }

    pub fn header(&self, id: &CoValueId) -> NodeResult<Header> {
        self.read_registry()?
            .core(id)
            .map(|core| core.header().clone())
            .ok_or_else(|| NodeError::Unavailable(id.clone()))
    }

    pub fn load_status(&self, id: &CoValueId) -> NodeResult<LoadStatus> {
        Ok(self
            .read_registry()?
            .get(id)
            .map(|entry| entry.status())
            .unwrap_or(LoadStatus::Pending))
    }

    /// Load a value from peers, retrying per the sync configuration
    pub async fn load(&self, id: &CoValueId) -> LoadResult {
        self.sync().load(id).await
    }

    /// Agent currently acting for an account
    pub fn resolve_account_agent(&self, account: &CoValueId) -> NodeResult<Option<AgentId>> {
        self.with_reader(|reader| {
            Ok(reader
                .signers_for(&ActorId::Account(account.clone()))
                .into_iter()
                .next())
        })
    }

    /// Values `id` depends on (owner group, author and member accounts)
    pub fn dependencies(&self, id: &CoValueId) -> NodeResult<Vec<CoValueId>> {
        self.with_reader(|reader| Ok(reader.dependencies(id)))
    }

    /// Seal a read key for a member's current agent
    pub(crate) fn seal_key_for(&self, secret: &KeySecret, member: &ActorId) -> NodeResult<String> {
        let agent = match member {
            ActorId::Agent(agent) => agent.clone(),
            ActorId::Account(account) => self
                .resolve_account_agent(account)?
                .ok_or_else(|| NodeError::Unavailable(account.clone()))?,
        };
        let sealed = self.inner.crypto.seal(secret.encode().as_bytes(), &agent)?;
        Ok(format!("{}{}", SEALED_PREFIX, hex::encode(sealed)))
    }

    /// Key reveal field and sealed value for `member`
    pub(crate) fn key_reveal_for(&self, key_id: &KeyId, secret: &KeySecret, member: &ActorId) -> NodeResult<(String, Value)> {
        let sealed = self.seal_key_for(secret, member)?;
        Ok((key_reveal_field(key_id, &member.to_string()), Value::String(sealed)))
    }

    pub(crate) fn notify(&self, id: &CoValueId) {
        // No receivers is fine
        let _ = self.inner.updates.send(id.clone());
    }

    pub fn subscribe(&self, id: &CoValueId) -> ValueSubscription {
        ValueSubscription::new(self.clone(), id.clone(), self.inner.updates.subscribe())
    }

    fn expect_kind(&self, id: &CoValueId, kind: ValueKind) -> NodeResult<()> {
        let actual = self.header(id)?.kind;
        if actual != kind {
            return Err(ContentError::WrongKind {
                expected: format!("{:?}", kind),
                actual: format!("{:?}", actual),
            }
            .into());
        }
        Ok(())
    }

    pub fn map(&self, id: &CoValueId) -> NodeResult<CoMap> {
        self.expect_kind(id, ValueKind::Map)?;
        Ok(CoMap::new(self.clone(), id.clone()))
    }

    pub fn list(&self, id: &CoValueId) -> NodeResult<CoList> {
        self.expect_kind(id, ValueKind::List)?;
        Ok(CoList::new(self.clone(), id.clone()))
    }

    pub fn stream(&self, id: &CoValueId) -> NodeResult<CoStream> {
        self.expect_kind(id, ValueKind::Stream)?;
        Ok(CoStream::new(self.clone(), id.clone()))
    }

    pub fn binary_stream(&self, id: &CoValueId) -> NodeResult<BinaryCoStream> {
        self.expect_kind(id, ValueKind::BinaryStream)?;
        Ok(BinaryCoStream::new(self.clone(), id.clone()))
    }

    /// Handle for an available group
    pub fn group(&self, id: &CoValueId) -> NodeResult<Group> {
        if !self.header(id)?.is_group() {
            return Err(NodeError::NotAGroup(id.clone()));
        }
        Ok(Group::new(self.clone(), id.clone()))
    }

    /// Join a group through an invite link
    ///
    /// Acts as the invite agent in a session of its own: grants this
    /// node's actor the invited role and passes the read key on. Accepting
    /// when already holding that role or better is a no-op.
    pub async fn accept_invite(&self, link: &InviteLink) -> NodeResult<Group> {
        let group_id = link.group.clone();
        self.load_required(&group_id).await?;
        let group = self.group(&group_id)?;
        let map = group.map()?;

        let invite_agent = self.inner.crypto.agent_id(&link.secret);
        let invite_actor = ActorId::Agent(invite_agent);
        let granted = map
            .get(&invite_actor.to_string())
            .and_then(Role::from_value)
            .and_then(|role| role.granted_by_invite())
            .ok_or_else(|| InviteError::NotAnInvite(group_id.clone()))?;

        let me = self.actor().clone();
        match map.get(&me.to_string()).and_then(Role::from_value) {
            Some(Role::Revoked) => return Err(InviteError::Revoked(group_id).into()),
            Some(current) if current.rank() >= granted.rank() => {
                debug!(group = %group_id, role = %current, "invite already accepted");
                return Ok(group);
            }
            _ => {}
        }

        let session = SessionId::new(&invite_actor, &self.inner.crypto.random_salt());
        self.append_transaction(
            &group_id,
            &session,
            &link.secret,
            vec![MapChange::set(me.to_string(), granted.to_value()).to_value()],
            Privacy::Trusting,
        )?;

        let key = self.with_reader_for(&link.secret, vec![MemberKey::Actor(invite_actor)], |reader| {
            Ok(reader.current_read_key(&group_id))
        })?;
        if let Some((key_id, secret)) = key {
            let (field, value) = self.key_reveal_for(&key_id, &secret, &me)?;
            self.append_transaction(
                &group_id,
                &session,
                &link.secret,
                vec![MapChange::set(field, value).to_value()],
                Privacy::Trusting,
            )?;
        }

        info!(group = %group_id, role = %granted, "accepted invite");
        Ok(group)
    }

    /// Load `id` and fail with `Unavailable` if no peer has it
    pub async fn load_required(&self, id: &CoValueId) -> NodeResult<()> {
        match self.load(id).await {
            LoadResult::Available => Ok(()),
            LoadResult::Unavailable => Err(NodeError::Unavailable(id.clone())),
        }
    }
}
