//! Read pipeline over a registry snapshot
//!
//! Turns raw logs into readable content for one identity: permission
//! filtering, read key resolution, decryption and canonical ordering. Also
//! answers the questions sync needs about a value (who may sign a session,
//! which values it depends on).

use super::entry::ValueRegistry;
use super::errors::{NodeError, NodeResult};
use crate::content::{ContentView, RegisterMap};
use crate::core_value::transaction::sort_canonical;
use crate::core_value::{
    ActorId, AgentId, CoValueCore, CoValueId, DecryptedTransaction, Ruleset, Transaction,
};
use crate::crypto::{AgentSecret, CryptoProvider, KeyId, KeySecret};
use crate::permissions::evaluator::{
    account_agents, account_agents_at, determine_valid_transactions, group_map, key_reveal_field,
    parse_key_reveal, KeyRevealTarget, READ_KEY_FIELD,
};
use crate::permissions::MemberKey;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Prefix of a read key sealed for one member
pub(crate) const SEALED_PREFIX: &str = "sealed_U";
/// Prefix of a read key encrypted with another read key
pub(crate) const ENCRYPTED_PREFIX: &str = "encrypted_U";

/// Secret plus the role-table keys it can open reveals for
pub struct KeyHolder<'a> {
    pub secret: &'a AgentSecret,
    pub members: Vec<MemberKey>,
}

pub struct Reader<'a> {
    pub registry: &'a ValueRegistry,
    pub crypto: &'a dyn CryptoProvider,
    pub holder: KeyHolder<'a>,
}

impl<'a> Reader<'a> {
    pub fn core(&self, id: &CoValueId) -> NodeResult<&'a CoValueCore> {
        self.registry
            .core(id)
            .ok_or_else(|| NodeError::Unavailable(id.clone()))
    }

    /// Group whose read keys encrypt this value's private transactions
    pub fn key_group(core: &CoValueCore) -> Option<&CoValueId> {
        match &core.header().ruleset {
            Ruleset::Group { .. } => Some(core.id()),
            Ruleset::OwnedByGroup { group } => Some(group),
            Ruleset::UnsafeAllowAll => None,
        }
    }

    /// Valid transactions with readable changes, in canonical order
    pub fn decrypted_transactions(&self, id: &CoValueId) -> NodeResult<Vec<DecryptedTransaction>> {
        let core = self.core(id)?;
        let key_group = Self::key_group(core);
        let mut keys: HashMap<KeyId, Option<KeySecret>> = HashMap::new();
        let mut out = Vec::new();

        for valid in determine_valid_transactions(core, self.registry) {
            let changes = match valid.tx {
                Transaction::Trusting { changes, .. } => changes.clone(),
                Transaction::Private {
                    key_used,
                    encrypted_changes,
                    ..
                } => {
                    let key = keys.entry(key_used.clone()).or_insert_with(|| {
                        key_group.and_then(|group| self.read_key(group, key_used))
                    });
                    let Some(key) = key else {
                        debug!(co_value = %id, tx = %valid.tx_id, key = %key_used, "no read key, skipping");
                        continue;
                    };
                    match core.decrypt_changes(&valid.tx_id, encrypted_changes, key) {
                        Ok(changes) => changes,
                        Err(e) => {
                            warn!(co_value = %id, tx = %valid.tx_id, error = %e, "undecryptable transaction");
                            continue;
                        }
                    }
                }
            };
            out.push(DecryptedTransaction {
                made_at: valid.tx.made_at(),
                tx_id: valid.tx_id,
                changes,
            });
        }

        sort_canonical(&mut out);
        Ok(out)
    }

    pub fn content(&self, id: &CoValueId) -> NodeResult<ContentView> {
        let core = self.core(id)?;
        let txs = self.decrypted_transactions(id)?;
        Ok(ContentView::build(core.header().kind, &txs))
    }

    /// Role table of a group (trusting changes only)
    pub fn group_map(&self, group: &CoValueId) -> NodeResult<RegisterMap> {
        let core = self.core(group)?;
        if !core.header().is_group() {
            return Err(NodeError::NotAGroup(group.clone()));
        }
        Ok(group_map(core))
    }

    /// Current read key of a group
    pub fn current_read_key(&self, group: &CoValueId) -> Option<(KeyId, KeySecret)> {
        let map = self.group_map(group).ok()?;
        let key_id = KeyId::parse(map.get_str(READ_KEY_FIELD)?)?;
        let secret = self.read_key(group, &key_id)?;
        Some((key_id, secret))
    }

    /// A read key of `group`, if this holder can obtain it
    pub fn read_key(&self, group: &CoValueId, key_id: &KeyId) -> Option<KeySecret> {
        let map = self.group_map(group).ok()?;
        self.read_key_in(&map, key_id, &mut HashSet::new())
    }

    fn read_key_in(&self, map: &RegisterMap, key_id: &KeyId, visited: &mut HashSet<KeyId>) -> Option<KeySecret> {
        if !visited.insert(key_id.clone()) {
            return None;
        }

        for member in &self.holder.members {
            let field = key_reveal_field(key_id, &member.to_string());
            if let Some(sealed) = map.get_str(&field) {
                if let Some(secret) = self.unseal_key(sealed) {
                    return Some(secret);
                }
            }
        }

        let everyone = key_reveal_field(key_id, MemberKey::EVERYONE);
        if let Some(secret) = map.get_str(&everyone).and_then(|s| KeySecret::decode(s).ok()) {
            return Some(secret);
        }

        // Older keys are encrypted with the key that replaced them
        for field in map.all_keys() {
            let Some((revealed, KeyRevealTarget::Key(wrapping))) = parse_key_reveal(field) else {
                continue;
            };
            if &revealed != key_id {
                continue;
            }
            let Some(wrapping_secret) = self.read_key_in(map, &wrapping, visited) else {
                continue;
            };
            let Some(encrypted) = map.get_str(field).and_then(|v| v.strip_prefix(ENCRYPTED_PREFIX)) else {
                continue;
            };
            let opened = hex::decode(encrypted)
                .ok()
                .and_then(|bytes| {
                    self.crypto
                        .decrypt(&bytes, &wrapping_secret, field.as_bytes())
                        .ok()
                })
                .and_then(|plain| String::from_utf8(plain).ok())
                .and_then(|text| KeySecret::decode(&text).ok());
            if opened.is_some() {
                return opened;
            }
        }

        None
    }

    fn unseal_key(&self, sealed: &str) -> Option<KeySecret> {
        let bytes = hex::decode(sealed.strip_prefix(SEALED_PREFIX)?).ok()?;
        let plain = self.crypto.unseal(&bytes, self.holder.secret).ok()?;
        KeySecret::decode(&String::from_utf8(plain).ok()?).ok()
    }

    /// Agents currently allowed to sign for `actor`
    pub fn signers_for(&self, actor: &ActorId) -> Vec<AgentId> {
        signers_of(self.registry, actor, &[])
    }

    /// Values that must reach a peer before this one can be verified and read
    pub fn dependencies(&self, id: &CoValueId) -> Vec<CoValueId> {
        dependencies_of(self.registry, id)
    }
}

/// Agents allowed to sign a piece of `actor`'s session
///
/// `times` are the piece's `made_at` values; an account agent must have been
/// an admin at each of them. No times means now. Empty when the actor is an
/// account that is not available locally.
pub fn signers_of(registry: &ValueRegistry, actor: &ActorId, times: &[u64]) -> Vec<AgentId> {
    match actor {
        ActorId::Agent(agent) => vec![agent.clone()],
        ActorId::Account(account) => registry
            .core(account)
            .map(|core| {
                let map = group_map(core);
                if times.is_empty() {
                    account_agents(&map)
                } else {
                    account_agents_at(&map, times)
                }
            })
            .unwrap_or_default(),
    }
}

/// Owner group, accounts that author sessions, and accounts that are
/// members of a group
pub fn dependencies_of(registry: &ValueRegistry, id: &CoValueId) -> Vec<CoValueId> {
    let Some(core) = registry.core(id) else {
        return Vec::new();
    };
    let mut deps = BTreeSet::new();

    match &core.header().ruleset {
        Ruleset::OwnedByGroup { group } => {
            deps.insert(group.clone());
        }
        Ruleset::Group { initial_admin } => {
            if let Some(account) = initial_admin.as_account() {
                deps.insert(account.clone());
            }
            let map = group_map(core);
            for key in map.all_keys() {
                if let Some(MemberKey::Actor(ActorId::Account(account))) = MemberKey::parse(key) {
                    deps.insert(account);
                }
            }
        }
        Ruleset::UnsafeAllowAll => {}
    }

    for (session, _) in core.sessions() {
        if let Some(account) = session.actor().as_account() {
            deps.insert(account.clone());
        }
    }

    deps.remove(id);
    deps.into_iter().collect()
}
