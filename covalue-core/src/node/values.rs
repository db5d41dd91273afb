//! Typed handles over a node's values
//!
//! Handles are cheap: a node and an id. Reads resolve content fresh from
//! the log each time; writes append one transaction in this node's session.

use super::errors::NodeResult;
use super::local_node::LocalNode;
use crate::content::{
    BinaryChunks, BinaryItem, BinaryStream, BinaryStreamInfo, CausalSequence, ContentView,
    MapChange, MapEdit, RegisterMap, SessionStream, StreamItem,
};
use crate::core_value::{ActorId, CoValueId, OpId, Privacy, TransactionId, MAX_RECOMMENDED_TX_SIZE};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Raw bytes per binary chunk; hex doubles them, leaving room for framing
pub const DEFAULT_BINARY_CHUNK_SIZE: usize = MAX_RECOMMENDED_TX_SIZE / 4;

#[derive(Debug, Clone)]
pub struct CoMap {
    node: LocalNode,
    id: CoValueId,
}

impl CoMap {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        CoMap { node, id }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn content(&self) -> NodeResult<RegisterMap> {
        Ok(self.node.content(&self.id)?.into_map()?)
    }

    pub fn get(&self, key: &str) -> NodeResult<Option<Value>> {
        Ok(self.content()?.get(key).cloned())
    }

    pub fn set(&self, key: &str, value: Value, privacy: Privacy) -> NodeResult<TransactionId> {
        self.node
            .make_transaction(&self.id, vec![MapChange::set(key, value).to_value()], privacy)
    }

    pub fn delete(&self, key: &str, privacy: Privacy) -> NodeResult<TransactionId> {
        self.node
            .make_transaction(&self.id, vec![MapChange::del(key).to_value()], privacy)
    }

    /// The map as it was at `time`
    pub fn as_of(&self, time: u64) -> NodeResult<RegisterMap> {
        Ok(self.content()?.as_of(time))
    }

    /// Every edit of `key`, oldest first (deletions included)
    pub fn edits_of(&self, key: &str) -> NodeResult<Vec<MapEdit>> {
        Ok(self.content()?.edits_of(key).to_vec())
    }

    pub fn subscribe(&self) -> ValueSubscription {
        self.node.subscribe(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct CoList {
    node: LocalNode,
    id: CoValueId,
}

impl CoList {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        CoList { node, id }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn content(&self) -> NodeResult<CausalSequence> {
        Ok(self.node.content(&self.id)?.into_list()?)
    }

    pub fn values(&self) -> NodeResult<Vec<Value>> {
        Ok(self.content()?.values())
    }

    /// Insert after position `after` (default: at the end)
    pub fn append(&self, value: Value, after: Option<usize>, privacy: Privacy) -> NodeResult<TransactionId> {
        let change = self.content()?.append_change(value, after)?;
        self.node.make_transaction(&self.id, vec![change.to_value()], privacy)
    }

    /// Insert before position `before` (default: at the start)
    pub fn prepend(&self, value: Value, before: Option<usize>, privacy: Privacy) -> NodeResult<TransactionId> {
        let change = self.content()?.prepend_change(value, before)?;
        self.node.make_transaction(&self.id, vec![change.to_value()], privacy)
    }

    pub fn push(&self, value: Value, privacy: Privacy) -> NodeResult<TransactionId> {
        self.append(value, None, privacy)
    }

    /// Insert directly after a known insertion, wherever it is now
    pub fn insert_after(&self, anchor: &OpId, value: Value, privacy: Privacy) -> NodeResult<TransactionId> {
        let change = self.content()?.insert_after_change(value, anchor)?;
        self.node.make_transaction(&self.id, vec![change.to_value()], privacy)
    }

    pub fn delete(&self, index: usize, privacy: Privacy) -> NodeResult<TransactionId> {
        let change = self.content()?.delete_change(index)?;
        self.node.make_transaction(&self.id, vec![change.to_value()], privacy)
    }

    pub fn subscribe(&self) -> ValueSubscription {
        self.node.subscribe(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct CoStream {
    node: LocalNode,
    id: CoValueId,
}

impl CoStream {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        CoStream { node, id }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn content(&self) -> NodeResult<SessionStream> {
        Ok(self.node.content(&self.id)?.into_stream()?)
    }

    pub fn push(&self, value: Value, privacy: Privacy) -> NodeResult<TransactionId> {
        self.node.make_transaction(&self.id, vec![value], privacy)
    }

    /// Items this node wrote, across all of its actor's sessions
    pub fn my_items(&self) -> NodeResult<Vec<StreamItem>> {
        Ok(self
            .content()?
            .items_by_actor(self.node.actor())
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn last_item_by(&self, actor: &ActorId) -> NodeResult<Option<StreamItem>> {
        Ok(self.content()?.last_item_by_actor(actor).cloned())
    }

    pub fn subscribe(&self) -> ValueSubscription {
        self.node.subscribe(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct BinaryCoStream {
    node: LocalNode,
    id: CoValueId,
}

impl BinaryCoStream {
    pub(crate) fn new(node: LocalNode, id: CoValueId) -> Self {
        BinaryCoStream { node, id }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn content(&self) -> NodeResult<BinaryStream> {
        Ok(self.node.content(&self.id)?.into_binary_stream()?)
    }

    fn push_item(&self, item: BinaryItem, privacy: Privacy) -> NodeResult<TransactionId> {
        self.node.make_transaction(&self.id, vec![item.to_value()], privacy)
    }

    pub fn start(&self, info: BinaryStreamInfo, privacy: Privacy) -> NodeResult<TransactionId> {
        self.push_item(BinaryItem::Start(info), privacy)
    }

    pub fn push_chunk(&self, bytes: &[u8], privacy: Privacy) -> NodeResult<TransactionId> {
        self.push_item(BinaryItem::chunk(bytes), privacy)
    }

    pub fn end(&self, privacy: Privacy) -> NodeResult<TransactionId> {
        self.push_item(BinaryItem::End, privacy)
    }

    /// Start, chunks of at most `chunk_size` bytes, end
    pub fn write_all(
        &self,
        info: BinaryStreamInfo,
        data: &[u8],
        chunk_size: usize,
        privacy: Privacy,
    ) -> NodeResult<()> {
        self.start(info, privacy)?;
        for chunk in data.chunks(chunk_size.max(1)) {
            self.push_chunk(chunk, privacy)?;
        }
        self.end(privacy)?;
        debug!(co_value = %self.id, bytes = data.len(), "wrote binary stream");
        Ok(())
    }

    pub fn chunks(&self, allow_unfinished: bool) -> NodeResult<Option<BinaryChunks>> {
        Ok(self.content()?.get_binary_chunks(allow_unfinished)?)
    }

    pub fn subscribe(&self) -> ValueSubscription {
        self.node.subscribe(&self.id)
    }
}

/// Change feed of one value
///
/// Yields fresh content after every local write and every applied remote
/// content message.
pub struct ValueSubscription {
    node: LocalNode,
    id: CoValueId,
    updates: broadcast::Receiver<CoValueId>,
}

impl ValueSubscription {
    pub(crate) fn new(node: LocalNode, id: CoValueId, updates: broadcast::Receiver<CoValueId>) -> Self {
        ValueSubscription { node, id, updates }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn current(&self) -> NodeResult<ContentView> {
        self.node.content(&self.id)
    }

    /// Wait for the next change of this value, then read its content
    ///
    /// The subscription keeps its node alive, so the feed never closes. A
    /// lagging receiver skips straight to the current content.
    pub async fn changed(&mut self) -> NodeResult<ContentView> {
        loop {
            match self.updates.recv().await {
                Ok(id) if id == self.id => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(co_value = %self.id, skipped, "subscription lagged");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{assert_completes_within, new_account_node, SHORT_TEST_TIMEOUT};
    use serde_json::json;

    #[tokio::test]
    async fn test_list_positions() {
        let alice = new_account_node("alice");
        let list = alice.create_group().unwrap().create_list(None).unwrap();

        list.append(json!("hello"), Some(0), Privacy::Trusting).unwrap();
        list.append(json!("world"), Some(0), Privacy::Trusting).unwrap();
        list.prepend(json!("beautiful"), Some(1), Privacy::Trusting).unwrap();

        assert_eq!(
            list.values().unwrap(),
            vec![json!("hello"), json!("beautiful"), json!("world")]
        );
    }

    #[tokio::test]
    async fn test_subscription_yields_content_after_local_write() {
        let alice = new_account_node("alice");
        let map = alice.create_group().unwrap().create_map(None).unwrap();
        let mut updates = map.subscribe();

        map.set("hello", json!("world"), Privacy::Private).unwrap();
        let content = assert_completes_within(SHORT_TEST_TIMEOUT, updates.changed())
            .await
            .unwrap();
        match content {
            ContentView::Map(map) => assert_eq!(map.get("hello"), Some(&json!("world"))),
            other => panic!("expected a map, got {:?}", other),
        }
    }
}
