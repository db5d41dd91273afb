/*
    causal_sequence.rs - Ordered list built from causal insertions

    Every inserted element is addressed by the OpId of the change that
    inserted it. Insertions are anchored either after an element (or the
    list start) or before an element (or the list end):

        {"op": "app", "value": V, "after": OpId | "start"}
        {"op": "pre", "value": V, "before": OpId | "end"}
        {"op": "del", "insertion": OpId}

    Each element keeps two child lists. Appends go to the front of the
    anchor's successors (so the newest append sits right after its anchor)
    and prepends go to the back of the anchor's predecessors (so the newest
    prepend sits right before it). The list is a depth-first walk: an
    element's predecessors, the element itself unless deleted, then its
    successors.

    Operations whose anchor is not yet known wait in a pending queue and
    are retried as insertions arrive.
*/

use super::errors::{ContentError, ContentResult};
use crate::core_value::{DecryptedTransaction, OpId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListEdge {
    Start,
    End,
}

/// Anchor of an insertion: an existing element or one end of the list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListAnchor {
    Edge(ListEdge),
    Op(OpId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ListChange {
    App { value: Value, after: ListAnchor },
    Pre { value: Value, before: ListAnchor },
    Del { insertion: OpId },
}

impl ListChange {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
struct Insertion {
    op_id: OpId,
    made_at: u64,
    value: Value,
    predecessors: Vec<usize>,
    successors: Vec<usize>,
}

/// A visible list element
#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    pub op_id: OpId,
    pub made_at: u64,
    pub value: Value,
}

#[derive(Debug, Clone)]
struct PendingChange {
    op_id: OpId,
    made_at: u64,
    change: ListChange,
}

#[derive(Debug, Clone, Default)]
pub struct CausalSequence {
    insertions: Vec<Insertion>,
    index: HashMap<OpId, usize>,
    after_start: Vec<usize>,
    before_end: Vec<usize>,
    deleted: HashSet<OpId>,
    pending: Vec<PendingChange>,
}

impl CausalSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay transactions in the given (canonical) order
    pub fn from_transactions<'a>(txs: impl IntoIterator<Item = &'a DecryptedTransaction>) -> Self {
        let mut list = CausalSequence::new();
        for tx in txs {
            for (change_index, raw) in tx.changes.iter().enumerate() {
                let op_id = OpId::new(&tx.tx_id, change_index);
                match serde_json::from_value::<ListChange>(raw.clone()) {
                    Ok(change) => list.apply_or_defer(op_id, tx.made_at, change),
                    Err(e) => debug!(op = %op_id, error = %e, "skipping malformed list change"),
                }
            }
        }
        list
    }

    /// Apply a change now, or queue it until its anchor arrives
    pub fn apply_or_defer(&mut self, op_id: OpId, made_at: u64, change: ListChange) {
        match self.apply(op_id.clone(), made_at, change.clone()) {
            Ok(inserted) => {
                if inserted {
                    self.retry_pending();
                }
            }
            Err(ContentError::DanglingReference(missing)) => {
                debug!(op = %op_id, missing = %missing, "deferring list change");
                self.pending.push(PendingChange {
                    op_id,
                    made_at,
                    change,
                });
            }
            Err(e) => debug!(op = %op_id, error = %e, "skipping invalid list change"),
        }
    }

    fn retry_pending(&mut self) {
        loop {
            let waiting = std::mem::take(&mut self.pending);
            let mut progressed = false;

            for pending in waiting {
                match self.apply(pending.op_id.clone(), pending.made_at, pending.change.clone()) {
                    Ok(_) => progressed = true,
                    Err(ContentError::DanglingReference(_)) => self.pending.push(pending),
                    Err(e) => {
                        progressed = true;
                        debug!(op = %pending.op_id, error = %e, "dropping invalid list change");
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Apply one change; `Ok(true)` when an element was inserted
    pub fn apply(&mut self, op_id: OpId, made_at: u64, change: ListChange) -> ContentResult<bool> {
        if self.index.contains_key(&op_id) {
            return Ok(false);
        }

        match change {
            ListChange::App { value, after } => {
                let parent = match &after {
                    ListAnchor::Edge(ListEdge::Start) => None,
                    ListAnchor::Edge(ListEdge::End) => {
                        return Err(ContentError::InvalidChange("append after end".into()))
                    }
                    ListAnchor::Op(anchor) => Some(self.slot_of(anchor)?),
                };
                let slot = self.push_insertion(op_id, made_at, value);
                match parent {
                    None => self.after_start.insert(0, slot),
                    Some(parent) => self.insertions[parent].successors.insert(0, slot),
                }
                Ok(true)
            }
            ListChange::Pre { value, before } => {
                let parent = match &before {
                    ListAnchor::Edge(ListEdge::End) => None,
                    ListAnchor::Edge(ListEdge::Start) => {
                        return Err(ContentError::InvalidChange("prepend before start".into()))
                    }
                    ListAnchor::Op(anchor) => Some(self.slot_of(anchor)?),
                };
                let slot = self.push_insertion(op_id, made_at, value);
                match parent {
                    None => self.before_end.push(slot),
                    Some(parent) => self.insertions[parent].predecessors.push(slot),
                }
                Ok(true)
            }
            ListChange::Del { insertion } => {
                self.slot_of(&insertion)?;
                self.deleted.insert(insertion);
                Ok(false)
            }
        }
    }

    fn slot_of(&self, op_id: &OpId) -> ContentResult<usize> {
        self.index
            .get(op_id)
            .copied()
            .ok_or_else(|| ContentError::DanglingReference(op_id.clone()))
    }

    fn push_insertion(&mut self, op_id: OpId, made_at: u64, value: Value) -> usize {
        let slot = self.insertions.len();
        self.insertions.push(Insertion {
            op_id: op_id.clone(),
            made_at,
            value,
            predecessors: Vec::new(),
            successors: Vec::new(),
        });
        self.index.insert(op_id, slot);
        slot
    }

    /// Visible elements in list order
    pub fn items(&self) -> Vec<ListItem> {
        enum Step {
            Visit(usize),
            Emit(usize),
        }

        let mut out = Vec::new();
        let mut stack: Vec<Step> = Vec::new();

        let roots: Vec<usize> = self
            .after_start
            .iter()
            .chain(self.before_end.iter())
            .copied()
            .collect();
        for &root in roots.iter().rev() {
            stack.push(Step::Visit(root));
        }

        while let Some(step) = stack.pop() {
            match step {
                Step::Visit(slot) => {
                    let node = &self.insertions[slot];
                    for &succ in node.successors.iter().rev() {
                        stack.push(Step::Visit(succ));
                    }
                    stack.push(Step::Emit(slot));
                    for &pred in node.predecessors.iter().rev() {
                        stack.push(Step::Visit(pred));
                    }
                }
                Step::Emit(slot) => {
                    let node = &self.insertions[slot];
                    if !self.deleted.contains(&node.op_id) {
                        out.push(ListItem {
                            op_id: node.op_id.clone(),
                            made_at: node.made_at,
                            value: node.value.clone(),
                        });
                    }
                }
            }
        }

        out
    }

    /// Visible values in list order
    pub fn values(&self) -> Vec<Value> {
        self.items().into_iter().map(|item| item.value).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_op(&self, op_id: &OpId) -> bool {
        self.index.contains_key(op_id)
    }

    /// Changes still waiting for an unknown anchor
    pub fn dangling(&self) -> impl Iterator<Item = &OpId> {
        self.pending.iter().map(|p| &p.op_id)
    }

    /// Change that inserts `value` after visible position `after`
    /// (default: the last element)
    pub fn append_change(&self, value: Value, after: Option<usize>) -> ContentResult<ListChange> {
        let items = self.items();
        let anchor = if items.is_empty() {
            match after {
                None | Some(0) => ListAnchor::Edge(ListEdge::Start),
                Some(index) => return Err(ContentError::IndexOutOfBounds { index, len: 0 }),
            }
        } else {
            let index = after.unwrap_or(items.len() - 1);
            let item = items.get(index).ok_or(ContentError::IndexOutOfBounds {
                index,
                len: items.len(),
            })?;
            ListAnchor::Op(item.op_id.clone())
        };
        Ok(ListChange::App {
            value,
            after: anchor,
        })
    }

    /// Change that inserts `value` before visible position `before`
    /// (default: the first element)
    pub fn prepend_change(&self, value: Value, before: Option<usize>) -> ContentResult<ListChange> {
        let items = self.items();
        let index = before.unwrap_or(0);
        let anchor = if items.is_empty() {
            if index != 0 {
                return Err(ContentError::IndexOutOfBounds { index, len: 0 });
            }
            ListAnchor::Edge(ListEdge::End)
        } else {
            let item = items.get(index).ok_or(ContentError::IndexOutOfBounds {
                index,
                len: items.len(),
            })?;
            ListAnchor::Op(item.op_id.clone())
        };
        Ok(ListChange::Pre {
            value,
            before: anchor,
        })
    }

    /// Change that inserts `value` directly after a known insertion
    pub fn insert_after_change(&self, value: Value, anchor: &OpId) -> ContentResult<ListChange> {
        if !self.contains_op(anchor) {
            return Err(ContentError::DanglingReference(anchor.clone()));
        }
        Ok(ListChange::App {
            value,
            after: ListAnchor::Op(anchor.clone()),
        })
    }

    /// Change that deletes the element at visible position `index`
    pub fn delete_change(&self, index: usize) -> ContentResult<ListChange> {
        let items = self.items();
        let item = items.get(index).ok_or(ContentError::IndexOutOfBounds {
            index,
            len: items.len(),
        })?;
        Ok(ListChange::Del {
            insertion: item.op_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_value::{SessionId, TransactionId};
    use serde_json::json;

    fn session(name: &str) -> SessionId {
        SessionId::parse(&format!("co_z{}_session_z1", name)).unwrap()
    }

    fn op(session_name: &str, tx_index: usize) -> OpId {
        OpId::new(&TransactionId::new(session(session_name), tx_index), 0)
    }

    fn tx(session_name: &str, idx: usize, made_at: u64, change: ListChange) -> DecryptedTransaction {
        DecryptedTransaction {
            tx_id: TransactionId::new(session(session_name), idx),
            made_at,
            changes: vec![change.to_value()],
        }
    }

    fn app(value: &str, after: ListAnchor) -> ListChange {
        ListChange::App {
            value: json!(value),
            after,
        }
    }

    fn start() -> ListAnchor {
        ListAnchor::Edge(ListEdge::Start)
    }

    #[test]
    fn test_append_chain() {
        let txs = vec![
            tx("A", 0, 1, app("a", start())),
            tx("A", 1, 2, app("b", ListAnchor::Op(op("A", 0)))),
            tx("A", 2, 3, app("c", ListAnchor::Op(op("A", 1)))),
        ];
        let list = CausalSequence::from_transactions(&txs);
        assert_eq!(list.values(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_concurrent_appends_to_same_anchor() {
        // hello / world, then "beautiful" appended after "hello"
        let txs = vec![
            tx("A", 0, 1, app("hello", start())),
            tx("A", 1, 2, app("world", ListAnchor::Op(op("A", 0)))),
            tx("B", 0, 3, app("beautiful", ListAnchor::Op(op("A", 0)))),
        ];
        let list = CausalSequence::from_transactions(&txs);
        assert_eq!(
            list.values(),
            vec![json!("hello"), json!("beautiful"), json!("world")]
        );
    }

    #[test]
    fn test_prepends() {
        let txs = vec![
            tx("A", 0, 1, ListChange::Pre { value: json!("z"), before: ListAnchor::Edge(ListEdge::End) }),
            tx("A", 1, 2, ListChange::Pre { value: json!("y"), before: ListAnchor::Op(op("A", 0)) }),
            tx("A", 2, 3, ListChange::Pre { value: json!("x"), before: ListAnchor::Op(op("A", 1)) }),
        ];
        let list = CausalSequence::from_transactions(&txs);
        assert_eq!(list.values(), vec![json!("x"), json!("y"), json!("z")]);

        let first = list.prepend_change(json!("w"), None).unwrap();
        assert_eq!(
            first,
            ListChange::Pre {
                value: json!("w"),
                before: ListAnchor::Op(op("A", 2)),
            }
        );
    }

    #[test]
    fn test_delete_hides_but_keeps_anchor() {
        let txs = vec![
            tx("A", 0, 1, app("a", start())),
            tx("A", 1, 2, ListChange::Del { insertion: op("A", 0) }),
            tx("A", 2, 3, app("b", ListAnchor::Op(op("A", 0)))),
        ];
        let list = CausalSequence::from_transactions(&txs);
        assert_eq!(list.values(), vec![json!("b")]);
        assert!(list.contains_op(&op("A", 0)));
    }

    #[test]
    fn test_dangling_reference_waits_for_anchor() {
        let mut list = CausalSequence::new();
        list.apply_or_defer(op("B", 0), 5, app("later", ListAnchor::Op(op("A", 0))));
        assert_eq!(list.dangling().count(), 1);
        assert!(list.is_empty());

        list.apply_or_defer(op("A", 0), 1, app("first", start()));
        assert_eq!(list.dangling().count(), 0);
        assert_eq!(list.values(), vec![json!("first"), json!("later")]);
    }

    #[test]
    fn test_local_helpers() {
        let txs = vec![tx("A", 0, 1, app("a", start()))];
        let list = CausalSequence::from_transactions(&txs);

        assert_eq!(
            list.append_change(json!("b"), None).unwrap(),
            app("b", ListAnchor::Op(op("A", 0)))
        );
        assert!(matches!(
            list.append_change(json!("b"), Some(3)),
            Err(ContentError::IndexOutOfBounds { index: 3, len: 1 })
        ));
        assert!(matches!(
            list.insert_after_change(json!("b"), &op("Z", 9)),
            Err(ContentError::DanglingReference(_))
        ));
        assert_eq!(
            list.delete_change(0).unwrap(),
            ListChange::Del { insertion: op("A", 0) }
        );

        let empty = CausalSequence::new();
        assert_eq!(empty.append_change(json!(1), None).unwrap(), app_value(1, start()));
        assert!(empty.delete_change(0).is_err());
    }

    fn app_value(v: i64, after: ListAnchor) -> ListChange {
        ListChange::App { value: json!(v), after }
    }

    #[test]
    fn test_wire_form() {
        let change = app("a", start());
        assert_eq!(
            change.to_value(),
            json!({ "op": "app", "value": "a", "after": "start" })
        );

        let by_op = ListChange::Del { insertion: op("A", 0) };
        let value = by_op.to_value();
        assert_eq!(value["insertion"]["txIndex"], 0);
        let back: ListChange = serde_json::from_value(value).unwrap();
        assert_eq!(back, by_op);
    }

    #[test]
    fn test_long_list_does_not_recurse() {
        let mut txs = vec![tx("A", 0, 0, app("0", start()))];
        for i in 1..20_000 {
            txs.push(tx("A", i, i as u64, app(&i.to_string(), ListAnchor::Op(op("A", i - 1)))));
        }
        let list = CausalSequence::from_transactions(&txs);
        assert_eq!(list.len(), 20_000);
    }

    mod proptests {
        use super::*;
        use crate::core_value::transaction::sort_canonical;
        use proptest::prelude::*;

        /// (session, made_at, kind, anchor pick) per op; each op anchors to an
        /// earlier op or a list edge, and clocks are random so replay often
        /// reaches an op before its anchor
        fn ops() -> impl Strategy<Value = (Vec<(u8, u64, u8, usize)>, Vec<usize>)> {
            prop::collection::vec((0u8..3, 0u64..10, 0u8..3, any::<usize>()), 1..25).prop_flat_map(|ops| {
                let order: Vec<usize> = (0..ops.len()).collect();
                (Just(ops), Just(order).prop_shuffle())
            })
        }

        fn build(ops: &[(u8, u64, u8, usize)]) -> Vec<DecryptedTransaction> {
            let mut next_index = [0usize; 3];
            let mut inserted: Vec<OpId> = Vec::new();
            let mut txs = Vec::new();

            for (i, (who, made_at, kind, pick)) in ops.iter().enumerate() {
                let name = ["A", "B", "C"][*who as usize];
                let idx = next_index[*who as usize];
                next_index[*who as usize] += 1;

                let slot = pick % (inserted.len() + 1);
                let target = inserted.get(slot).cloned();
                let value = json!(i.to_string());
                let change = match (kind, target) {
                    (1, Some(anchor)) => ListChange::Pre { value, before: ListAnchor::Op(anchor) },
                    (1, None) => ListChange::Pre { value, before: ListAnchor::Edge(ListEdge::End) },
                    (2, Some(anchor)) => ListChange::Del { insertion: anchor },
                    (_, Some(anchor)) => ListChange::App { value, after: ListAnchor::Op(anchor) },
                    (_, None) => ListChange::App { value, after: start() },
                };

                if !matches!(change, ListChange::Del { .. }) {
                    inserted.push(op(name, idx));
                }
                txs.push(tx(name, idx, *made_at, change));
            }
            txs
        }

        proptest! {
            #[test]
            fn prop_delivery_order_does_not_matter((ops, order) in ops()) {
                let mut canonical = build(&ops);
                let mut delivered: Vec<DecryptedTransaction> =
                    order.iter().map(|&i| canonical[i].clone()).collect();

                sort_canonical(&mut canonical);
                sort_canonical(&mut delivered);

                let a = CausalSequence::from_transactions(&canonical);
                let b = CausalSequence::from_transactions(&delivered);
                prop_assert_eq!(a.items(), b.items());
                prop_assert_eq!(a.dangling().count(), 0);
                prop_assert_eq!(b.dangling().count(), 0);
            }
        }
    }
}
