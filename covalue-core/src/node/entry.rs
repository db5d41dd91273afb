//! Per-value load state
//!
//! A value a node has heard of is in one of four states:
//!
//! ```text
//! Unknown ──load──▶ Loading{waiting_on} ──all peers said not found──▶ Unavailable
//!    │                    │                                               │
//!    └────────────────────┴──────── content with header ─────────────────┴──▶ Available
//! ```
//!
//! Waiters observe transitions through a `watch` channel, so a load can
//! race its retry backoff against availability.

use crate::core_value::{CoValueCore, CoValueId};
use crate::permissions::ValueResolver;
use crate::sync::PeerId;
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use tracing::debug;

/// Observable outcome of loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Not asked for yet, or still waiting on peers
    Pending,
    Available,
    Unavailable,
}

#[derive(Debug)]
pub enum EntryState {
    Unknown,
    Loading { waiting_on: HashSet<PeerId> },
    Available(Box<CoValueCore>),
    Unavailable,
}

#[derive(Debug)]
pub struct CoValueEntry {
    id: CoValueId,
    state: EntryState,
    status: watch::Sender<LoadStatus>,
}

impl CoValueEntry {
    pub fn new(id: CoValueId) -> Self {
        let (status, _) = watch::channel(LoadStatus::Pending);
        CoValueEntry {
            id,
            state: EntryState::Unknown,
            status,
        }
    }

    pub fn available(core: CoValueCore) -> Self {
        let mut entry = CoValueEntry::new(core.id().clone());
        entry.mark_available(core);
        entry
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn state(&self) -> &EntryState {
        &self.state
    }

    pub fn status(&self) -> LoadStatus {
        match self.state {
            EntryState::Available(_) => LoadStatus::Available,
            EntryState::Unavailable => LoadStatus::Unavailable,
            EntryState::Unknown | EntryState::Loading { .. } => LoadStatus::Pending,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadStatus> {
        self.status.subscribe()
    }

    pub fn core(&self) -> Option<&CoValueCore> {
        match &self.state {
            EntryState::Available(core) => Some(core.as_ref()),
            _ => None,
        }
    }

    pub fn core_mut(&mut self) -> Option<&mut CoValueCore> {
        match &mut self.state {
            EntryState::Available(core) => Some(core.as_mut()),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, EntryState::Available(_))
    }

    /// Peers still expected to answer a load
    pub fn waiting_on(&self) -> Option<&HashSet<PeerId>> {
        match &self.state {
            EntryState::Loading { waiting_on } => Some(waiting_on),
            _ => None,
        }
    }

    /// A load was sent to `peers`
    ///
    /// No-op once available. With no peers to ask, the value is
    /// immediately unavailable.
    pub fn load_requested(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        match &mut self.state {
            EntryState::Available(_) => {}
            EntryState::Loading { waiting_on } => waiting_on.extend(peers),
            EntryState::Unknown | EntryState::Unavailable => {
                let waiting_on: HashSet<PeerId> = peers.into_iter().collect();
                self.state = if waiting_on.is_empty() {
                    EntryState::Unavailable
                } else {
                    EntryState::Loading { waiting_on }
                };
                self.publish();
            }
        }
    }

    /// `peer` does not have the value; unavailable once nobody is left
    pub fn mark_not_found(&mut self, peer: &PeerId) {
        if let EntryState::Loading { waiting_on } = &mut self.state {
            waiting_on.remove(peer);
            if waiting_on.is_empty() {
                debug!(co_value = %self.id, "no peer has value");
                self.state = EntryState::Unavailable;
                self.publish();
            }
        }
    }

    /// Every remaining peer counts as not found
    pub fn give_up(&mut self) {
        if let EntryState::Loading { .. } = self.state {
            self.state = EntryState::Unavailable;
            self.publish();
        }
    }

    /// The value's core arrived; valid from any state
    pub fn mark_available(&mut self, core: CoValueCore) {
        self.state = EntryState::Available(Box::new(core));
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.status());
    }
}

/// All values a node knows about
#[derive(Debug, Default)]
pub struct ValueRegistry {
    entries: HashMap<CoValueId, CoValueEntry>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CoValueId) -> Option<&CoValueEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &CoValueId) -> Option<&mut CoValueEntry> {
        self.entries.get_mut(id)
    }

    pub fn entry(&mut self, id: &CoValueId) -> &mut CoValueEntry {
        self.entries
            .entry(id.clone())
            .or_insert_with(|| CoValueEntry::new(id.clone()))
    }

    pub fn insert_available(&mut self, core: CoValueCore) {
        let id = core.id().clone();
        match self.entries.get_mut(&id) {
            Some(entry) => entry.mark_available(core),
            None => {
                self.entries.insert(id, CoValueEntry::available(core));
            }
        }
    }

    pub fn core(&self, id: &CoValueId) -> Option<&CoValueCore> {
        self.entries.get(id)?.core()
    }

    pub fn core_mut(&mut self, id: &CoValueId) -> Option<&mut CoValueCore> {
        self.entries.get_mut(id)?.core_mut()
    }

    /// Ids of values with a load in flight
    pub fn loading_ids(&self) -> Vec<CoValueId> {
        self.entries
            .values()
            .filter(|entry| entry.waiting_on().is_some())
            .map(|entry| entry.id().clone())
            .collect()
    }

    /// Ids of every available value
    pub fn available_ids(&self) -> Vec<CoValueId> {
        self.entries
            .values()
            .filter(|entry| entry.is_available())
            .map(|entry| entry.id().clone())
            .collect()
    }
}

impl ValueResolver for ValueRegistry {
    fn resolve(&self, id: &CoValueId) -> Option<&CoValueCore> {
        self.core(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_value::{Header, Ruleset, ValueKind};
    use crate::crypto::DalekCrypto;
    use std::sync::Arc;

    fn core() -> CoValueCore {
        let header = Header::new(ValueKind::Map, Ruleset::UnsafeAllowAll, None, "u".into());
        CoValueCore::create(header, Arc::new(DalekCrypto::new())).unwrap()
    }

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    #[test]
    fn test_unavailable_after_all_peers_answer() {
        let mut entry = CoValueEntry::new(CoValueId::parse("co_zX").unwrap());
        assert_eq!(entry.status(), LoadStatus::Pending);

        entry.load_requested([peer("a"), peer("b")]);
        assert_eq!(entry.waiting_on().unwrap().len(), 2);

        entry.mark_not_found(&peer("a"));
        assert_eq!(entry.status(), LoadStatus::Pending);
        entry.mark_not_found(&peer("a"));
        assert_eq!(entry.status(), LoadStatus::Pending);
        entry.mark_not_found(&peer("b"));
        assert_eq!(entry.status(), LoadStatus::Unavailable);
    }

    #[test]
    fn test_no_peers_is_unavailable() {
        let mut entry = CoValueEntry::new(CoValueId::parse("co_zX").unwrap());
        entry.load_requested(Vec::new());
        assert_eq!(entry.status(), LoadStatus::Unavailable);
    }

    #[test]
    fn test_available_from_any_state() {
        let c = core();
        let mut entry = CoValueEntry::new(c.id().clone());
        entry.load_requested([peer("a")]);
        entry.mark_not_found(&peer("a"));
        assert_eq!(entry.status(), LoadStatus::Unavailable);

        entry.mark_available(c);
        assert!(entry.is_available());

        // further loads and not-found answers do not regress
        entry.load_requested([peer("b")]);
        entry.mark_not_found(&peer("b"));
        assert!(entry.is_available());
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let c = core();
        let mut entry = CoValueEntry::new(c.id().clone());
        let mut rx = entry.subscribe();

        entry.load_requested([peer("a")]);
        entry.mark_available(c);

        let status = rx.wait_for(|s| *s == LoadStatus::Available).await.unwrap();
        assert_eq!(*status, LoadStatus::Available);
    }

    #[test]
    fn test_registry_resolves_available_only() {
        let c = core();
        let id = c.id().clone();
        let mut registry = ValueRegistry::new();

        registry.entry(&id).load_requested([peer("a")]);
        assert!(registry.resolve(&id).is_none());

        registry.insert_available(c);
        assert!(registry.resolve(&id).is_some());
        assert_eq!(registry.available_ids(), vec![id]);
    }
}
