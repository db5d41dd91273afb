/*
    known_state.rs - What a peer holds of one value

    A known state records whether the header is present and, per session,
    how many transactions are held. It behaves like a vector clock over
    sessions: combining takes the per-session maximum, and one state covers
    another when it is at least as far along in every session.
*/

use super::ids::{CoValueId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoValueId,
    pub header: bool,
    pub sessions: BTreeMap<SessionId, usize>,
}

impl KnownState {
    /// Nothing known: no header, no sessions
    pub fn empty(id: CoValueId) -> Self {
        KnownState {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Number of transactions held for a session
    pub fn get(&self, session: &SessionId) -> usize {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    pub fn set(&mut self, session: SessionId, count: usize) {
        self.sessions.insert(session, count);
    }

    /// Per-session maximum; header if either side has it
    pub fn combine(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let current = self.sessions.entry(session.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    pub fn combined(mut self, other: &KnownState) -> KnownState {
        self.combine(other);
        self
    }

    /// True when `self` holds everything `other` holds
    pub fn covers(&self, other: &KnownState) -> bool {
        (self.header || !other.header)
            && other
                .sessions
                .iter()
                .all(|(session, &count)| self.get(session) >= count)
    }

    /// Total transactions across sessions
    pub fn transaction_count(&self) -> usize {
        self.sessions.values().sum()
    }
}
