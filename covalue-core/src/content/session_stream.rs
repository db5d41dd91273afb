/*
    session_stream.rs - Per-writer append-only streams

    Each session contributes its own ordered stream of items; streams of
    different sessions are never interleaved by the resolver. Items of one
    actor across its sessions can be read together, merged by made_at.
*/

use super::errors::{ContentError, ContentResult};
use crate::core_value::{ActorId, DecryptedTransaction, SessionId, TransactionId};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub tx_id: TransactionId,
    pub made_at: u64,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStream {
    items: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl SessionStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change becomes one item of its session's stream
    pub fn from_transactions<'a>(txs: impl IntoIterator<Item = &'a DecryptedTransaction>) -> Self {
        let mut stream = SessionStream::new();
        for tx in txs {
            let items = stream.items.entry(tx.tx_id.session_id.clone()).or_default();
            for change in &tx.changes {
                items.push(StreamItem {
                    tx_id: tx.tx_id.clone(),
                    made_at: tx.made_at,
                    value: change.clone(),
                });
            }
        }
        // Replay order is by made_at; session order is by index
        for items in stream.items.values_mut() {
            items.sort_by_key(|item| item.tx_id.tx_index);
        }
        stream
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.items.keys()
    }

    pub fn items_in_session(&self, session: &SessionId) -> &[StreamItem] {
        self.items.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_item_in_session(&self, session: &SessionId) -> Option<&StreamItem> {
        self.items.get(session)?.last()
    }

    /// Items of every session owned by `actor`, ordered by (made_at, tx id)
    pub fn items_by_actor(&self, actor: &ActorId) -> Vec<&StreamItem> {
        let mut items: Vec<&StreamItem> = self
            .items
            .iter()
            .filter(|(session, _)| session.actor() == actor)
            .flat_map(|(_, items)| items.iter())
            .collect();
        items.sort_by(|a, b| (a.made_at, &a.tx_id).cmp(&(b.made_at, &b.tx_id)));
        items
    }

    pub fn last_item_by_actor(&self, actor: &ActorId) -> Option<&StreamItem> {
        self.items_by_actor(actor).pop()
    }

    /// The only session's items; None if nothing was written
    pub fn single_stream(&self) -> ContentResult<Option<&[StreamItem]>> {
        match self.items.len() {
            0 => Ok(None),
            1 => Ok(self.items.values().next().map(Vec::as_slice)),
            n => Err(ContentError::MultipleStreams(n)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(actor: &str, salt: &str) -> SessionId {
        SessionId::parse(&format!("co_z{}_session_z{}", actor, salt)).unwrap()
    }

    fn tx(s: &SessionId, idx: usize, made_at: u64, value: Value) -> DecryptedTransaction {
        DecryptedTransaction {
            tx_id: TransactionId::new(s.clone(), idx),
            made_at,
            changes: vec![value],
        }
    }

    #[test]
    fn test_sessions_kept_apart() {
        let a = session("A", "1");
        let b = session("B", "1");
        let txs = vec![
            tx(&a, 0, 1, json!("a0")),
            tx(&b, 0, 2, json!("b0")),
            tx(&a, 1, 3, json!("a1")),
        ];
        let stream = SessionStream::from_transactions(&txs);

        let values: Vec<&Value> = stream.items_in_session(&a).iter().map(|i| &i.value).collect();
        assert_eq!(values, vec![&json!("a0"), &json!("a1")]);
        assert_eq!(stream.last_item_in_session(&b).unwrap().value, json!("b0"));
        assert!(matches!(stream.single_stream(), Err(ContentError::MultipleStreams(2))));
    }

    #[test]
    fn test_session_order_survives_clock_skew() {
        let a = session("A", "1");
        // second transaction claims an earlier time than the first
        let txs = vec![tx(&a, 1, 1, json!("second")), tx(&a, 0, 5, json!("first"))];
        let stream = SessionStream::from_transactions(&txs);
        let items = stream.single_stream().unwrap().unwrap();
        assert_eq!(items[0].value, json!("first"));
        assert_eq!(items[1].value, json!("second"));
    }

    #[test]
    fn test_items_by_actor_merge_sessions() {
        let phone = session("A", "phone");
        let laptop = session("A", "laptop");
        let other = session("B", "1");
        let txs = vec![
            tx(&phone, 0, 1, json!(1)),
            tx(&laptop, 0, 2, json!(2)),
            tx(&other, 0, 3, json!(3)),
            tx(&phone, 1, 4, json!(4)),
        ];
        let stream = SessionStream::from_transactions(&txs);
        let actor = phone.actor().clone();

        let values: Vec<&Value> = stream.items_by_actor(&actor).iter().map(|i| &i.value).collect();
        assert_eq!(values, vec![&json!(1), &json!(2), &json!(4)]);
        assert_eq!(stream.last_item_by_actor(&actor).unwrap().value, json!(4));
    }

    #[test]
    fn test_empty_stream() {
        let stream = SessionStream::new();
        assert!(stream.is_empty());
        assert_eq!(stream.single_stream().unwrap(), None);
    }

    mod proptests {
        use super::*;
        use crate::core_value::transaction::sort_canonical;
        use proptest::prelude::*;

        fn writes() -> impl Strategy<Value = (Vec<(u8, u64, i64)>, Vec<usize>)> {
            prop::collection::vec((0u8..3, 0u64..10, any::<i64>()), 1..30).prop_flat_map(|writes| {
                let order: Vec<usize> = (0..writes.len()).collect();
                (Just(writes), Just(order).prop_shuffle())
            })
        }

        proptest! {
            #[test]
            fn prop_delivery_order_does_not_matter((writes, order) in writes()) {
                let sessions = [session("A", "1"), session("A", "2"), session("B", "1")];
                let mut next_index = [0usize; 3];
                let mut canonical: Vec<DecryptedTransaction> = writes
                    .iter()
                    .map(|(who, made_at, value)| {
                        let idx = next_index[*who as usize];
                        next_index[*who as usize] += 1;
                        tx(&sessions[*who as usize], idx, *made_at, json!(value))
                    })
                    .collect();
                let mut delivered: Vec<DecryptedTransaction> =
                    order.iter().map(|&i| canonical[i].clone()).collect();

                sort_canonical(&mut canonical);
                sort_canonical(&mut delivered);

                let a = SessionStream::from_transactions(&canonical);
                let b = SessionStream::from_transactions(&delivered);
                prop_assert_eq!(&a, &b);
                let actor = sessions[0].actor().clone();
                prop_assert_eq!(a.items_by_actor(&actor), b.items_by_actor(&actor));
            }
        }
    }
}
