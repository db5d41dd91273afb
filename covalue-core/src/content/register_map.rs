/*
    register_map.rs - Last-writer-wins map over transaction history

    Each key holds an ordered list of edits. An edit is stamped with the
    transaction's made_at and id; the edit with the greatest stamp is the
    current value. Ties on made_at fall back to (session, tx index), so
    every replica picks the same winner regardless of delivery order.

    Deletions are kept as tombstone edits, which keeps history queries
    (edits_of, as_of) exact.

    Change format:
        {"op": "set", "key": K, "value": V}
        {"op": "del", "key": K}
*/

use crate::core_value::{DecryptedTransaction, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// A single map change as carried in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapChange {
    Set { key: String, value: Value },
    Del { key: String },
}

impl MapChange {
    pub fn set(key: impl Into<String>, value: Value) -> Self {
        MapChange::Set {
            key: key.into(),
            value,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        MapChange::Del { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            MapChange::Set { key, .. } | MapChange::Del { key } => key,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Ordering stamp of an edit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EditStamp {
    pub made_at: u64,
    pub tx_id: TransactionId,
}

impl EditStamp {
    /// True if an edit with this stamp replaces one stamped `other`
    pub fn wins_over(&self, other: &EditStamp) -> bool {
        self > other
    }
}

/// One historical edit of a key; `value` is None for deletions
#[derive(Debug, Clone, PartialEq)]
pub struct MapEdit {
    pub stamp: EditStamp,
    pub value: Option<Value>,
}

impl MapEdit {
    pub fn made_at(&self) -> u64 {
        self.stamp.made_at
    }

    pub fn tx_id(&self) -> &TransactionId {
        &self.stamp.tx_id
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    edits: BTreeMap<String, Vec<MapEdit>>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay transactions; changes that do not parse are skipped
    pub fn from_transactions<'a>(txs: impl IntoIterator<Item = &'a DecryptedTransaction>) -> Self {
        let mut map = RegisterMap::new();
        for tx in txs {
            for change in &tx.changes {
                match serde_json::from_value::<MapChange>(change.clone()) {
                    Ok(change) => map.apply(tx.tx_id.clone(), tx.made_at, change),
                    Err(e) => debug!(tx = %tx.tx_id, error = %e, "skipping malformed map change"),
                }
            }
        }
        map
    }

    /// Record one edit, keeping each key's history sorted by stamp
    pub fn apply(&mut self, tx_id: TransactionId, made_at: u64, change: MapChange) {
        let (key, value) = match change {
            MapChange::Set { key, value } => (key, Some(value)),
            MapChange::Del { key } => (key, None),
        };
        let edit = MapEdit {
            stamp: EditStamp { made_at, tx_id },
            value,
        };

        let history = self.edits.entry(key).or_default();
        let position = history.partition_point(|existing| edit.stamp.wins_over(&existing.stamp));
        history.insert(position, edit);
    }

    /// Current value of a key; None if never set or deleted
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.last_edit(key)?.value.as_ref()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Latest edit of a key, tombstones included
    pub fn last_edit(&self, key: &str) -> Option<&MapEdit> {
        self.edits.get(key)?.last()
    }

    /// Full edit history of a key in stamp order
    pub fn edits_of(&self, key: &str) -> &[MapEdit] {
        self.edits.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys with a live value
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.edits
            .iter()
            .filter(|(_, history)| matches!(history.last(), Some(MapEdit { value: Some(_), .. })))
            .map(|(key, _)| key.as_str())
    }

    /// Every key ever edited, deleted ones included
    pub fn all_keys(&self) -> impl Iterator<Item = &str> {
        self.edits.keys().map(String::as_str)
    }

    /// Live entries
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.edits
            .iter()
            .filter_map(|(key, history)| Some((key.as_str(), history.last()?.value.as_ref()?)))
    }

    /// Value of a key as it was at `time`
    pub fn get_at(&self, key: &str, time: u64) -> Option<&Value> {
        self.edits
            .get(key)?
            .iter()
            .rev()
            .find(|edit| edit.made_at() <= time)?
            .value
            .as_ref()
    }

    /// The map as it was at `time`: only edits with `made_at <= time`
    pub fn as_of(&self, time: u64) -> RegisterMap {
        let edits = self
            .edits
            .iter()
            .filter_map(|(key, history)| {
                let kept: Vec<MapEdit> = history
                    .iter()
                    .filter(|edit| edit.made_at() <= time)
                    .cloned()
                    .collect();
                (!kept.is_empty()).then(|| (key.clone(), kept))
            })
            .collect();
        RegisterMap { edits }
    }

    /// Live entries as a JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        )
    }
}
