/*
    evaluator.rs - Which transactions of a value are valid

    Validity depends on the value's ruleset:

    - UnsafeAllowAll   every transaction
    - Group            a fold over the group's own transactions in canonical
                       order, tracking the role table as it evolves
    - OwnedByGroup     the author's role in the owning group's table as of
                       the transaction's made_at must be admin or writer

    Invalid transactions are skipped (logged at warn), never fatal. The
    evaluation is a pure function of the transaction logs, so every peer
    reaches the same verdicts.
*/

use super::role::{MemberKey, Role};
use crate::content::{MapChange, RegisterMap};
use crate::core_value::{
    ActorId, AgentId, CoValueCore, CoValueId, DecryptedTransaction, Ruleset, Transaction,
    TransactionId,
};
use crate::crypto::KeyId;
use std::collections::HashMap;
use tracing::warn;

/// Group fields only admins may set
pub const READ_KEY_FIELD: &str = "readKey";
pub const PROFILE_FIELD: &str = "profile";
pub const ROOT_FIELD: &str = "root";

/// Lookup of other values during evaluation
pub trait ValueResolver {
    fn resolve(&self, id: &CoValueId) -> Option<&CoValueCore>;
}

impl ValueResolver for HashMap<CoValueId, CoValueCore> {
    fn resolve(&self, id: &CoValueId) -> Option<&CoValueCore> {
        self.get(id)
    }
}

/// A transaction that passed permission checks
#[derive(Debug, Clone)]
pub struct ValidTransaction<'a> {
    pub tx_id: TransactionId,
    pub tx: &'a Transaction,
}

/// Parsed `<keyId>_for_<target>` field name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRevealTarget {
    Member(MemberKey),
    Key(KeyId),
}

/// Split a key reveal field into the revealed key and its target
pub fn parse_key_reveal(field: &str) -> Option<(KeyId, KeyRevealTarget)> {
    let (key, target) = field.split_once("_for_")?;
    let key = KeyId::parse(key)?;
    let target = match KeyId::parse(target) {
        Some(wrapping) => KeyRevealTarget::Key(wrapping),
        None => KeyRevealTarget::Member(MemberKey::parse(target)?),
    };
    Some((key, target))
}

pub fn key_reveal_field(key: &KeyId, target: &str) -> String {
    format!("{}_for_{}", key, target)
}

/// Valid transactions of `core`, in session order
pub fn determine_valid_transactions<'a>(
    core: &'a CoValueCore,
    resolver: &dyn ValueResolver,
) -> Vec<ValidTransaction<'a>> {
    match &core.header().ruleset {
        Ruleset::UnsafeAllowAll => core
            .transactions()
            .map(|(tx_id, tx)| ValidTransaction { tx_id, tx })
            .collect(),
        Ruleset::Group { initial_admin } => evaluate_group(core, initial_admin).valid,
        Ruleset::OwnedByGroup { group } => evaluate_owned(core, group, resolver),
    }
}

/// Result of folding a group's transactions
pub struct GroupEvaluation<'a> {
    pub valid: Vec<ValidTransaction<'a>>,
    /// Role table and key fields built from the valid trusting changes
    pub map: RegisterMap,
}

fn skip(core: &CoValueCore, tx_id: &TransactionId, reason: &str) {
    warn!(co_value = %core.id(), tx = %tx_id, reason, "skipping unauthorized transaction");
}

/// Fold a group's transactions in canonical order
pub fn evaluate_group<'a>(core: &'a CoValueCore, initial_admin: &ActorId) -> GroupEvaluation<'a> {
    let mut ordered: Vec<(TransactionId, &'a Transaction)> = core.transactions().collect();
    ordered.sort_by(|(a_id, a), (b_id, b)| (a.made_at(), a_id).cmp(&(b.made_at(), b_id)));

    let mut roles: HashMap<MemberKey, Role> = HashMap::new();
    let mut valid = Vec::new();
    let mut trusting = Vec::new();

    for (tx_id, tx) in ordered {
        let author = tx_id.session_id.actor().clone();
        let author_role = roles.get(&MemberKey::Actor(author.clone())).copied();

        let changes = match tx {
            Transaction::Private { .. } => {
                if author_role == Some(Role::Admin) {
                    valid.push(ValidTransaction { tx_id, tx });
                } else {
                    skip(core, &tx_id, "private group transaction by non-admin");
                }
                continue;
            }
            Transaction::Trusting { changes, .. } => changes,
        };

        if changes.len() != 1 {
            skip(core, &tx_id, "group transactions carry exactly one change");
            continue;
        }
        let (field, value) = match serde_json::from_value::<MapChange>(changes[0].clone()) {
            Ok(MapChange::Set { key, value }) => (key, value),
            Ok(MapChange::Del { .. }) => {
                skip(core, &tx_id, "group fields cannot be deleted");
                continue;
            }
            Err(_) => {
                skip(core, &tx_id, "malformed group change");
                continue;
            }
        };

        let allowed = if field == READ_KEY_FIELD || field == PROFILE_FIELD || field == ROOT_FIELD {
            author_role == Some(Role::Admin)
        } else if parse_key_reveal(&field).is_some() {
            matches!(author_role, Some(role) if role == Role::Admin || role.is_invite())
        } else if let Some(member) = MemberKey::parse(&field) {
            match Role::from_value(&value) {
                Some(new_role) => {
                    let change = RoleChange {
                        author: &author,
                        author_role,
                        member: &member,
                        current: roles.get(&member).copied(),
                        new_role,
                        table_empty: roles.is_empty(),
                        initial_admin,
                    };
                    match change.check() {
                        Ok(()) => {
                            roles.insert(member, new_role);
                            true
                        }
                        Err(reason) => {
                            skip(core, &tx_id, reason);
                            continue;
                        }
                    }
                }
                None => false,
            }
        } else {
            false
        };

        if !allowed {
            skip(core, &tx_id, "author may not set this group field");
            continue;
        }

        trusting.push(DecryptedTransaction {
            tx_id: tx_id.clone(),
            made_at: tx.made_at(),
            changes: changes.clone(),
        });
        valid.push(ValidTransaction { tx_id, tx });
    }

    GroupEvaluation {
        valid,
        map: RegisterMap::from_transactions(&trusting),
    }
}

struct RoleChange<'a> {
    author: &'a ActorId,
    author_role: Option<Role>,
    member: &'a MemberKey,
    current: Option<Role>,
    new_role: Role,
    table_empty: bool,
    initial_admin: &'a ActorId,
}

impl RoleChange<'_> {
    fn check(&self) -> Result<(), &'static str> {
        let self_target = matches!(self.member, MemberKey::Actor(actor) if actor == self.author);

        if self.table_empty
            && self.author == self.initial_admin
            && self_target
            && self.new_role == Role::Admin
        {
            return Ok(());
        }

        if *self.member == MemberKey::Everyone
            && !matches!(self.new_role, Role::Reader | Role::Writer | Role::Revoked)
        {
            return Err("everyone may only be reader, writer or revoked");
        }

        match self.author_role {
            Some(Role::Admin) => {
                if self.current == Some(Role::Admin) && !self_target && self.new_role != Role::Admin {
                    Err("admins cannot demote other admins")
                } else {
                    Ok(())
                }
            }
            Some(invite) if invite.is_invite() => {
                if invite.granted_by_invite() != Some(self.new_role) {
                    return Err("invite grants a different role");
                }
                match self.current {
                    None => Ok(()),
                    Some(current) => match (current.rank(), self.new_role.rank()) {
                        (Some(have), Some(want)) if have <= want => Ok(()),
                        _ => Err("invites cannot change this member's role"),
                    },
                }
            }
            _ => Err("author has no role that may change membership"),
        }
    }
}

/// Role table of a group, from its valid trusting changes
pub fn group_map(group: &CoValueCore) -> RegisterMap {
    match &group.header().ruleset {
        Ruleset::Group { initial_admin } => evaluate_group(group, initial_admin).map,
        _ => RegisterMap::new(),
    }
}

/// Role of `actor` at `time`, falling back to the everyone entry
pub fn role_at(map: &RegisterMap, actor: &ActorId, time: u64) -> Option<Role> {
    map.get_at(&actor.to_string(), time)
        .and_then(Role::from_value)
        .or_else(|| map.get_at(MemberKey::EVERYONE, time).and_then(Role::from_value))
}

/// Current role of `actor`, falling back to the everyone entry
pub fn current_role(map: &RegisterMap, actor: &ActorId) -> Option<Role> {
    role_at(map, actor, u64::MAX)
}

/// Agent an account acted through at `time`
pub fn account_agent_at(account_map: &RegisterMap, time: u64) -> Option<AgentId> {
    account_map
        .as_of(time)
        .entries()
        .filter(|(_, value)| Role::from_value(value) == Some(Role::Admin))
        .find_map(|(key, _)| AgentId::parse(key))
}

/// Agents that are admins of the account now
pub fn account_agents(account_map: &RegisterMap) -> Vec<AgentId> {
    account_agents_at(account_map, &[u64::MAX])
}

/// Agents that were admins of the account at every one of `times`
///
/// A revoked agent still qualifies for transactions made while it was an
/// admin, never for later ones.
pub fn account_agents_at(account_map: &RegisterMap, times: &[u64]) -> Vec<AgentId> {
    account_map
        .all_keys()
        .filter_map(|key| {
            let agent = AgentId::parse(key)?;
            times
                .iter()
                .all(|&time| {
                    account_map.get_at(key, time).and_then(Role::from_value) == Some(Role::Admin)
                })
                .then_some(agent)
        })
        .collect()
}

fn evaluate_owned<'a>(
    core: &'a CoValueCore,
    group_id: &CoValueId,
    resolver: &dyn ValueResolver,
) -> Vec<ValidTransaction<'a>> {
    let Some(group) = resolver.resolve(group_id) else {
        warn!(co_value = %core.id(), group = %group_id, "owner group unavailable, no transactions valid");
        return Vec::new();
    };

    let map = group_map(group);
    let owner_is_account = group.header().is_account();

    core.transactions()
        .filter_map(|(tx_id, tx)| {
            let author = tx_id.session_id.actor();
            let time = tx.made_at();

            let effective = match author {
                ActorId::Account(account) if owner_is_account && account == group_id => {
                    account_agent_at(&map, time).map(ActorId::Agent)
                }
                other => Some(other.clone()),
            };

            let allowed = effective
                .and_then(|actor| role_at(&map, &actor, time))
                .map(|role| role.can_write())
                .unwrap_or(false);

            if allowed {
                Some(ValidTransaction { tx_id, tx })
            } else {
                skip(core, &tx_id, "author is not a writer of the owner group");
                None
            }
        })
        .collect()
}
