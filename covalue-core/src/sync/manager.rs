/*
    SyncManager - per-value sync with peers

    Keeps every connected peer's view of every value converging with ours.

    Workflow:

    1. add_peer(peer):
        - remember the peer with empty known states
        - upstream peers (server, storage) get a `load` for every value we hold
        - spawn a reader task that feeds incoming messages to handle_message

    2. On receive:
        - load     -> reply dependencies, then `known`, then missing content, then `done`;
                      if we lack the value, try to load it from other upstream peers first
        - known    -> update our estimate of the peer (replace on correction),
                      resolve pending loads, push what the peer still lacks
        - content  -> create from header, apply pieces, ack with `known`;
                      answer gaps with a correction, drop pieces that fail verification,
                      fan new content out to other peers
        - done     -> nothing to do

    3. load(id) waits for the value, retrying peers marked retry_unavailable
       with exponential backoff raced against the value arriving.

    Locking: registry before peers, both std locks, never held across an await.
*/

use super::errors::{SyncError, SyncResult};
use super::message::SyncMessage;
use super::peer::{Peer, PeerId, PeerRole};
use crate::core_value::{
    AgentId, CoValueCore, CoValueError, CoValueId, KnownState, NewContent, SessionId, Transaction,
};
use crate::node::entry::{EntryState, LoadStatus, ValueRegistry};
use crate::node::errors::{handle_poison, NodeResult};
use crate::node::reader::{dependencies_of, signers_of};
use crate::node::LocalNode;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Outcome of loading a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadResult {
    Available,
    Unavailable,
}

/// What we know about one connected peer
#[derive(Debug)]
pub struct PeerState {
    pub id: PeerId,
    pub role: PeerRole,
    pub retry_unavailable: bool,
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    /// Confirmed state plus everything we have sent since
    optimistic: HashMap<CoValueId, KnownState>,
    /// What the peer itself reported
    confirmed: HashMap<CoValueId, KnownState>,
    /// Bumped on every `known` from the peer
    ack: watch::Sender<u64>,
}

impl PeerState {
    fn new(peer: &Peer) -> Self {
        let (ack, _) = watch::channel(0);
        PeerState {
            id: peer.id.clone(),
            role: peer.role,
            retry_unavailable: peer.retry_unavailable,
            outgoing: peer.outgoing.clone(),
            optimistic: HashMap::new(),
            confirmed: HashMap::new(),
            ack,
        }
    }

    fn send(&self, msg: SyncMessage) -> bool {
        trace!(peer = %self.id, action = msg.action(), co_value = %msg.id(), "send");
        if self.outgoing.send(msg).is_err() {
            debug!(peer = %self.id, "peer channel closed");
            return false;
        }
        metrics::counter!("covalue_sync_messages_sent_total").increment(1);
        true
    }

    /// Send content and assume the peer now has it
    fn send_content(&mut self, content: NewContent) {
        let implied = content.implied_known_state();
        if self.send(SyncMessage::Content(content)) {
            self.optimistic
                .entry(implied.id.clone())
                .and_modify(|known| known.combine(&implied))
                .or_insert(implied);
        }
    }

    pub fn confirmed(&self, id: &CoValueId) -> Option<&KnownState> {
        self.confirmed.get(id)
    }

    pub fn optimistic(&self, id: &CoValueId) -> Option<&KnownState> {
        self.optimistic.get(id)
    }
}

/// How far a peer has confirmed one of our values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The peer never reported on the value
    Unknown,
    /// The peer is missing some of what we hold
    Behind,
    Synced,
}

enum LoadRequest {
    Done(LoadResult),
    Waiting(watch::Receiver<LoadStatus>),
}

#[derive(Clone)]
pub struct SyncManager {
    node: LocalNode,
}

impl SyncManager {
    pub fn new(node: LocalNode) -> Self {
        SyncManager { node }
    }

    fn peers_read(&self) -> NodeResult<std::sync::RwLockReadGuard<'_, HashMap<PeerId, PeerState>>> {
        self.node.inner.peers.read().map_err(handle_poison)
    }

    fn peers_write(&self) -> NodeResult<std::sync::RwLockWriteGuard<'_, HashMap<PeerId, PeerState>>> {
        self.node.inner.peers.write().map_err(handle_poison)
    }

    /// Connect a peer and start processing its messages
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_peer(&self, peer: Peer) {
        let peer_id = peer.id.clone();
        info!(peer = %peer_id, role = ?peer.role, "adding peer");

        if let Err(e) = self.register_peer(PeerState::new(&peer)) {
            warn!(peer = %peer_id, error = %e, "failed to register peer");
            return;
        }

        let mut incoming = peer.incoming;
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                manager.handle_message(&peer_id, msg);
            }
            if let Err(e) = manager.peer_closed(&peer_id) {
                warn!(peer = %peer_id, error = %e, "failed to remove peer");
            }
        });
    }

    /// Upstream peers learn what we hold through a `load` per value
    fn register_peer(&self, state: PeerState) -> NodeResult<()> {
        let registry = self.node.read_registry()?;
        let mut peers = self.peers_write()?;
        if state.role.is_upstream() {
            for value_id in registry.available_ids() {
                if let Some(core) = registry.core(&value_id) {
                    state.send(SyncMessage::Load(core.known_state()));
                }
            }
        }
        peers.insert(state.id.clone(), state);
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers_read()
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the peer; loads waiting on it count it as not found
    fn peer_closed(&self, peer_id: &PeerId) -> NodeResult<()> {
        info!(peer = %peer_id, "peer disconnected");
        let mut registry = self.node.write_registry()?;
        let mut peers = self.peers_write()?;
        peers.remove(peer_id);
        for value_id in registry.loading_ids() {
            if let Some(entry) = registry.get_mut(&value_id) {
                entry.mark_not_found(peer_id);
            }
        }
        Ok(())
    }

    /// Dispatch one message from `peer_id`
    pub fn handle_message(&self, peer_id: &PeerId, msg: SyncMessage) {
        metrics::counter!("covalue_sync_messages_received_total").increment(1);
        trace!(peer = %peer_id, action = msg.action(), co_value = %msg.id(), "receive");

        let result = match msg {
            SyncMessage::Load(known) => self.handle_load(peer_id, known),
            SyncMessage::Known {
                known,
                is_correction,
            } => self.handle_known(peer_id, known, is_correction),
            SyncMessage::Content(content) => self.handle_content(peer_id, content),
            SyncMessage::Done { id } => {
                trace!(peer = %peer_id, co_value = %id, "peer done");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(peer = %peer_id, error = %e, "failed to handle sync message");
        }
    }

    fn handle_load(&self, peer_id: &PeerId, their: KnownState) -> NodeResult<()> {
        let id = their.id.clone();
        let available = {
            let registry = self.node.read_registry()?;
            let mut peers = self.peers_write()?;
            let Some(peer) = peers.get_mut(peer_id) else {
                return Ok(());
            };
            peer.confirmed.insert(id.clone(), their.clone());
            peer.optimistic.insert(id.clone(), their);

            if registry.core(&id).is_some() {
                Self::answer_load(&registry, peer, &id);
                true
            } else {
                false
            }
        };
        if available {
            return Ok(());
        }

        let others = self.upstream_peers_except(peer_id)?;
        if others.is_empty() {
            self.send_not_found(peer_id, &id)?;
            return Ok(());
        }

        // Ask our own upstream on the peer's behalf
        let manager = self.clone();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            let result = manager.load(&id).await;
            let outcome = match result {
                LoadResult::Available => manager.with_peer_and_registry(&peer_id, |registry, peer| {
                    Self::answer_load(registry, peer, &id);
                }),
                LoadResult::Unavailable => manager.send_not_found(&peer_id, &id),
            };
            if let Err(e) = outcome {
                warn!(peer = %peer_id, co_value = %id, error = %e, "failed to answer load");
            }
        });
        Ok(())
    }

    /// Dependencies, `known`, missing content, `done`
    fn answer_load(registry: &ValueRegistry, peer: &mut PeerState, id: &CoValueId) {
        let mut visited = HashSet::new();
        visited.insert(id.clone());
        for dep in dependencies_of(registry, id) {
            Self::push_value(registry, peer, &dep, &mut visited);
        }
        let Some(core) = registry.core(id) else {
            return;
        };
        peer.send(SyncMessage::known(core.known_state()));
        Self::push_new_content(peer, core);
        peer.send(SyncMessage::Done { id: id.clone() });
    }

    fn send_not_found(&self, peer_id: &PeerId, id: &CoValueId) -> NodeResult<()> {
        let peers = self.peers_read()?;
        if let Some(peer) = peers.get(peer_id) {
            peer.send(SyncMessage::known(KnownState::empty(id.clone())));
        }
        Ok(())
    }

    fn with_peer_and_registry(
        &self,
        peer_id: &PeerId,
        f: impl FnOnce(&ValueRegistry, &mut PeerState),
    ) -> NodeResult<()> {
        let registry = self.node.read_registry()?;
        let mut peers = self.peers_write()?;
        if let Some(peer) = peers.get_mut(peer_id) {
            f(&registry, peer);
        }
        Ok(())
    }

    fn handle_known(&self, peer_id: &PeerId, known: KnownState, is_correction: bool) -> NodeResult<()> {
        let id = known.id.clone();
        let mut registry = self.node.write_registry()?;
        let mut peers = self.peers_write()?;
        let Some(peer) = peers.get_mut(peer_id) else {
            return Ok(());
        };

        if is_correction {
            debug!(peer = %peer_id, co_value = %id, "correction received");
            peer.confirmed.insert(id.clone(), known.clone());
            peer.optimistic.insert(id.clone(), known.clone());
        } else {
            for map in [&mut peer.confirmed, &mut peer.optimistic] {
                map.entry(id.clone())
                    .and_modify(|state| state.combine(&known))
                    .or_insert_with(|| known.clone());
            }
        }
        peer.ack.send_modify(|n| *n += 1);

        if !known.header {
            if let Some(entry) = registry.get_mut(&id) {
                entry.mark_not_found(peer_id);
            }
        }

        if let Some(core) = registry.core(&id) {
            let mut visited = HashSet::new();
            visited.insert(id.clone());
            for dep in dependencies_of(&registry, &id) {
                Self::push_value(&registry, peer, &dep, &mut visited);
            }
            Self::push_new_content(peer, core);
        }
        Ok(())
    }

    fn handle_content(&self, peer_id: &PeerId, content: NewContent) -> NodeResult<()> {
        let id = content.id.clone();
        let implied = content.implied_known_state();
        let mut added = 0usize;
        let mut became_available = false;
        let mut needs_correction = false;

        let our_known = {
            let mut registry = self.node.write_registry()?;

            if registry.core(&id).is_none() {
                match &content.header {
                    Some(header) => {
                        match CoValueCore::from_remote_header(&id, header.clone(), self.node.crypto().clone()) {
                            Ok(core) => {
                                registry.entry(&id).mark_available(core);
                                became_available = true;
                            }
                            Err(e) => {
                                warn!(peer = %peer_id, co_value = %id, error = %e, "rejected header");
                                metrics::counter!("covalue_integrity_failures_total").increment(1);
                                return Ok(());
                            }
                        }
                    }
                    None => needs_correction = true,
                }
            }

            if !needs_correction {
                let signers: BTreeMap<SessionId, Vec<AgentId>> = content
                    .new
                    .iter()
                    .map(|(session, piece)| {
                        let times: Vec<u64> =
                            piece.new_transactions.iter().map(Transaction::made_at).collect();
                        (session.clone(), signers_of(&registry, session.actor(), &times))
                    })
                    .collect();

                if let Some(core) = registry.core_mut(&id) {
                    for (session, piece) in &content.new {
                        let session_signers = signers.get(session).map(Vec::as_slice).unwrap_or(&[]);
                        match core.try_add_transactions(
                            session,
                            piece.after,
                            &piece.new_transactions,
                            &piece.last_signature,
                            session_signers,
                        ) {
                            Ok(n) => added += n,
                            Err(CoValueError::OutOfOrder { expected, got, .. }) => {
                                debug!(peer = %peer_id, co_value = %id, session = %session, expected, got, "gap in session");
                                needs_correction = true;
                            }
                            Err(e) => {
                                warn!(peer = %peer_id, co_value = %id, session = %session, error = %e, "discarding invalid piece");
                                metrics::counter!("covalue_integrity_failures_total").increment(1);
                            }
                        }
                    }
                }
            }

            registry
                .core(&id)
                .map(CoValueCore::known_state)
                .unwrap_or_else(|| KnownState::empty(id.clone()))
        };

        {
            let mut peers = self.peers_write()?;
            if let Some(peer) = peers.get_mut(peer_id) {
                if needs_correction {
                    peer.confirmed.insert(id.clone(), implied.clone());
                    peer.optimistic.insert(id.clone(), implied);
                    peer.send(SyncMessage::correction(our_known));
                } else {
                    for map in [&mut peer.confirmed, &mut peer.optimistic] {
                        map.entry(id.clone())
                            .and_modify(|state| state.combine(&implied))
                            .or_insert_with(|| implied.clone());
                    }
                    peer.send(SyncMessage::known(our_known));
                }
            }
        }

        if added > 0 || became_available {
            debug!(peer = %peer_id, co_value = %id, added, "applied content");
            self.node.notify(&id);
            self.sync_value(&id);
        }
        Ok(())
    }

    /// Push `id` (dependencies first) to every peer that should have it
    ///
    /// Upstream peers get everything; other peers only values they have
    /// asked for.
    pub fn sync_value(&self, id: &CoValueId) {
        if let Err(e) = self.try_sync_value(id) {
            warn!(co_value = %id, error = %e, "failed to sync value");
        }
    }

    fn try_sync_value(&self, id: &CoValueId) -> NodeResult<()> {
        let registry = self.node.read_registry()?;
        if registry.core(id).is_none() {
            return Ok(());
        }
        let mut peers = self.peers_write()?;
        for peer in peers.values_mut() {
            if !peer.role.is_upstream() && !peer.optimistic.contains_key(id) {
                continue;
            }
            Self::push_value(&registry, peer, id, &mut HashSet::new());
        }
        Ok(())
    }

    fn push_value(registry: &ValueRegistry, peer: &mut PeerState, id: &CoValueId, visited: &mut HashSet<CoValueId>) {
        if !visited.insert(id.clone()) {
            return;
        }
        for dep in dependencies_of(registry, id) {
            Self::push_value(registry, peer, &dep, visited);
        }
        if let Some(core) = registry.core(id) {
            Self::push_new_content(peer, core);
        }
    }

    fn push_new_content(peer: &mut PeerState, core: &CoValueCore) {
        let known = peer.optimistic.get(core.id()).cloned();
        for content in core.new_content_since(known.as_ref()) {
            peer.send_content(content);
        }
    }

    fn upstream_peers_except(&self, except: &PeerId) -> NodeResult<Vec<PeerId>> {
        Ok(self
            .peers_read()?
            .values()
            .filter(|peer| peer.role.is_upstream() && &peer.id != except)
            .map(|peer| peer.id.clone())
            .collect())
    }

    fn request_load(&self, id: &CoValueId, retry_only: bool) -> NodeResult<LoadRequest> {
        let mut registry = self.node.write_registry()?;
        let peers = self.peers_read()?;
        let entry = registry.entry(id);
        if entry.is_available() {
            return Ok(LoadRequest::Done(LoadResult::Available));
        }

        let candidates: Vec<&PeerState> = peers
            .values()
            .filter(|peer| peer.role.is_upstream() && (!retry_only || peer.retry_unavailable))
            .collect();
        if candidates.is_empty() {
            entry.give_up();
            return Ok(LoadRequest::Done(LoadResult::Unavailable));
        }

        if !matches!(entry.state(), EntryState::Loading { .. }) {
            entry.load_requested(candidates.iter().map(|peer| peer.id.clone()));
            for peer in &candidates {
                peer.send(SyncMessage::Load(KnownState::empty(id.clone())));
            }
        }
        Ok(LoadRequest::Waiting(entry.subscribe()))
    }

    fn give_up(&self, id: &CoValueId) {
        if let Ok(mut registry) = self.node.write_registry() {
            registry.entry(id).give_up();
        }
    }

    fn has_retry_peers(&self) -> bool {
        self.peers_read()
            .map(|peers| peers.values().any(|peer| peer.role.is_upstream() && peer.retry_unavailable))
            .unwrap_or(false)
    }

    /// Load a value from upstream peers
    ///
    /// Peers that report the value missing are retried only if marked
    /// `retry_unavailable`, waiting `retry_delay(attempt)` between rounds.
    /// The value arriving during a wait ends the load early.
    pub async fn load(&self, id: &CoValueId) -> LoadResult {
        let config = self.node.config().clone();

        let mut status = match self.request_load(id, false) {
            Ok(LoadRequest::Done(result)) => return result,
            Ok(LoadRequest::Waiting(rx)) => rx,
            Err(e) => {
                warn!(co_value = %id, error = %e, "load failed");
                return LoadResult::Unavailable;
            }
        };

        match wait_for_answer(&mut status, config.load_timeout).await {
            LoadStatus::Available => return LoadResult::Available,
            LoadStatus::Pending => self.give_up(id),
            LoadStatus::Unavailable => {}
        }

        for attempt in 0..config.max_load_retries {
            if !self.has_retry_peers() {
                break;
            }
            let delay = config.retry_delay(attempt);
            debug!(co_value = %id, attempt, delay = ?delay, "retrying load");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                arrived = wait_until_available(&mut status) => {
                    if arrived {
                        return LoadResult::Available;
                    }
                }
            }

            status = match self.request_load(id, true) {
                Ok(LoadRequest::Done(result)) => return result,
                Ok(LoadRequest::Waiting(rx)) => rx,
                Err(e) => {
                    warn!(co_value = %id, error = %e, "load retry failed");
                    return LoadResult::Unavailable;
                }
            };
            match wait_for_answer(&mut status, config.load_timeout).await {
                LoadStatus::Available => return LoadResult::Available,
                LoadStatus::Pending => self.give_up(id),
                LoadStatus::Unavailable => {}
            }
        }

        let available = self
            .node
            .read_registry()
            .map(|registry| registry.core(id).is_some())
            .unwrap_or(false);
        if available {
            LoadResult::Available
        } else {
            debug!(co_value = %id, "value unavailable");
            LoadResult::Unavailable
        }
    }

    /// Whether `peer_id` has confirmed everything we hold of `id`
    pub fn sync_status(&self, peer_id: &PeerId, id: &CoValueId) -> NodeResult<SyncStatus> {
        let ours = self.node.known_state(id)?;
        let peers = self.peers_read()?;
        let peer = peers
            .get(peer_id)
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;
        let status = match (peer.confirmed.get(id), ours) {
            (None, _) => SyncStatus::Unknown,
            (Some(_), None) => SyncStatus::Synced,
            (Some(theirs), Some(ours)) if theirs.covers(&ours) => SyncStatus::Synced,
            (Some(_), Some(_)) => SyncStatus::Behind,
        };
        Ok(status)
    }

    /// Wait until `peer_id` confirms it holds everything we hold of `id`
    pub async fn wait_for_sync(&self, peer_id: &PeerId, id: &CoValueId, timeout: Duration) -> SyncResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut ack = {
                let peers = self.peers_read().map_err(|_| SyncError::PeerNotFound(peer_id.to_string()))?;
                peers
                    .get(peer_id)
                    .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?
                    .ack
                    .subscribe()
            };
            if matches!(self.sync_status(peer_id, id), Ok(SyncStatus::Synced)) {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, ack.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SyncError::PeerClosed(peer_id.to_string())),
                Err(_) => return Err(SyncError::Timeout(timeout)),
            }
        }
    }

    /// `wait_for_sync` against every upstream peer
    pub async fn wait_for_upstream_sync(&self, id: &CoValueId, timeout: Duration) -> SyncResult<()> {
        let upstream: Vec<PeerId> = self
            .peers_read()
            .map(|peers| {
                peers
                    .values()
                    .filter(|peer| peer.role.is_upstream())
                    .map(|peer| peer.id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for peer_id in upstream {
            self.wait_for_sync(&peer_id, id, timeout).await?;
        }
        Ok(())
    }
}

/// Wait until the load is answered; `Pending` means it timed out
async fn wait_for_answer(status: &mut watch::Receiver<LoadStatus>, timeout: Duration) -> LoadStatus {
    match tokio::time::timeout(timeout, status.wait_for(|s| *s != LoadStatus::Pending)).await {
        Ok(Ok(answered)) => *answered,
        Ok(Err(_)) => LoadStatus::Unavailable,
        Err(_) => LoadStatus::Pending,
    }
}

/// Resolves once the value is available; never if the entry is dropped
async fn wait_until_available(status: &mut watch::Receiver<LoadStatus>) -> bool {
    let available = status
        .wait_for(|s| *s == LoadStatus::Available)
        .await
        .is_ok();
    if !available {
        std::future::pending::<()>().await;
    }
    available
}
